use std::sync::Arc;

use ag_domain::stream::{BoxStream, RuntimeEvent};
use ag_domain::types::ImageAttachment;
use ag_domain::{Result, TaskIdentifier};

use crate::options::AgentOptions;

/// A long-lived connection to the LLM runtime for one (room, agent) pair.
///
/// Implementations are adapters over whatever actually runs the model
/// (a subprocess SDK, a remote service, or the scripted test runtime).
/// Clients are not re-entrant: callers serialize turns through the
/// pool's per-client usage lock.
#[async_trait::async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Establish the connection. The pool retries transient transport
    /// failures ([`ag_domain::Error::TransientTransport`]); anything
    /// else aborts client creation.
    async fn connect(&self) -> Result<()>;

    /// Tear down the connection. Errors are absorbed by callers.
    async fn disconnect(&self) -> Result<()>;

    /// Ask the runtime to stop generating. Cooperative: the event
    /// stream ends shortly after.
    async fn interrupt(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    /// Submit one user turn.
    async fn query(&self, prompt: &str, images: &[ImageAttachment]) -> Result<()>;

    /// The event stream for the most recent `query`. Each call returns
    /// the remaining events; iteration suspends between events.
    fn receive_events(&self) -> BoxStream<'static, Result<RuntimeEvent>>;

    /// The session id this client was connected with, if any.
    fn resume_session(&self) -> Option<String>;
}

impl std::fmt::Debug for dyn RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient").finish_non_exhaustive()
    }
}

/// Constructs runtime clients. The gateway's pool owns one factory;
/// tests substitute [`crate::testkit::ScriptedFactory`].
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, task: TaskIdentifier, options: &AgentOptions) -> Arc<dyn RuntimeClient>;
}
