//! Scripted in-process runtime for tests.
//!
//! `ScriptedFactory` hands out `ScriptedRuntime` clients whose event
//! streams replay pre-programmed turns. Scripts are keyed by agent id
//! and shared across client replacements, so pool-invalidation paths
//! behave like the real runtime (a new client continues the same
//! programme).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ag_domain::stream::{BoxStream, ContentBlock, RuntimeEvent, StreamDelta, Usage};
use ag_domain::types::ImageAttachment;
use ag_domain::{Error, Result, TaskIdentifier};

use crate::client::{RuntimeClient, RuntimeFactory};
use crate::options::AgentOptions;

type Script = Vec<RuntimeEvent>;
type ScriptQueue = Arc<Mutex<VecDeque<Script>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A normal streamed text turn: session announce, one text delta per
/// chunk, then the result message.
pub fn text_turn(session_id: &str, chunks: &[&str]) -> Script {
    let mut events = vec![RuntimeEvent::System {
        session_id: Some(session_id.to_owned()),
    }];
    for chunk in chunks {
        events.push(RuntimeEvent::Stream {
            delta: StreamDelta::TextDelta {
                text: (*chunk).to_owned(),
            },
            session_id: None,
        });
    }
    events.push(result_event());
    events
}

/// A turn where the agent thinks first, then streams text.
pub fn thinking_turn(session_id: &str, thinking: &str, chunks: &[&str]) -> Script {
    let mut events = vec![
        RuntimeEvent::System {
            session_id: Some(session_id.to_owned()),
        },
        RuntimeEvent::Stream {
            delta: StreamDelta::ThinkingDelta {
                thinking: thinking.to_owned(),
            },
            session_id: None,
        },
    ];
    for chunk in chunks {
        events.push(RuntimeEvent::Stream {
            delta: StreamDelta::TextDelta {
                text: (*chunk).to_owned(),
            },
            session_id: None,
        });
    }
    events.push(result_event());
    events
}

/// A turn where the agent invokes its skip tool and says nothing.
pub fn skip_turn(session_id: &str) -> Script {
    vec![
        RuntimeEvent::System {
            session_id: Some(session_id.to_owned()),
        },
        RuntimeEvent::Assistant {
            blocks: vec![ContentBlock::ToolUse {
                name: "mcp__room__skip".into(),
                input: serde_json::json!({}),
            }],
        },
        result_event(),
    ]
}

fn result_event() -> RuntimeEvent {
    RuntimeEvent::Result {
        usage: Some(Usage {
            input_tokens: 120,
            output_tokens: 30,
        }),
        structured_output: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedRuntime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted client. Created through [`ScriptedFactory`].
pub struct ScriptedRuntime {
    scripts: ScriptQueue,
    pending: Mutex<Option<Script>>,
    interrupted: Arc<AtomicBool>,
    connected: AtomicBool,
    resume: Option<String>,
    event_delay: Duration,
    /// Remaining connect attempts that fail with a transient transport
    /// error before one succeeds.
    transient_failures: Arc<AtomicUsize>,
    hard_connect_error: Option<String>,
    pub disconnect_count: AtomicUsize,
    pub interrupt_count: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    /// Prompts submitted through `query`, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupt_count.load(Ordering::SeqCst) > 0
    }
}

#[async_trait::async_trait]
impl RuntimeClient for ScriptedRuntime {
    async fn connect(&self) -> Result<()> {
        if let Some(message) = &self.hard_connect_error {
            return Err(Error::Other(message.clone()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransientTransport(
                "transport is not ready for writing".into(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn query(&self, prompt: &str, _images: &[ImageAttachment]) -> Result<()> {
        self.queries.lock().push(prompt.to_owned());
        self.interrupted.store(false, Ordering::SeqCst);
        let next = self.scripts.lock().pop_front().unwrap_or_else(|| {
            // Unscripted agents produce a minimal valid turn.
            text_turn("sess_scripted", &["..."])
        });
        *self.pending.lock() = Some(next);
        Ok(())
    }

    fn receive_events(&self) -> BoxStream<'static, Result<RuntimeEvent>> {
        let events = self.pending.lock().take().unwrap_or_default();
        let interrupted = self.interrupted.clone();
        let delay = self.event_delay;
        Box::pin(async_stream::stream! {
            for event in events {
                if interrupted.load(Ordering::SeqCst) {
                    break;
                }
                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(delay).await;
                }
                if interrupted.load(Ordering::SeqCst) {
                    break;
                }
                yield Ok(event);
            }
        })
    }

    fn resume_session(&self) -> Option<String> {
        self.resume.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedFactory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Factory that programs and tracks scripted clients.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<i64, ScriptQueue>>,
    transient_failures: Mutex<HashMap<i64, Arc<AtomicUsize>>>,
    hard_connect_errors: Mutex<HashMap<i64, String>>,
    event_delay: Mutex<Duration>,
    created: Mutex<Vec<(TaskIdentifier, Arc<ScriptedRuntime>)>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one turn's events for an agent. Turns are consumed in
    /// order across client replacements.
    pub fn script_turn(&self, agent_id: i64, events: Script) {
        self.queue_for(agent_id).lock().push_back(events);
    }

    /// Make the next `count` connect attempts for an agent fail with a
    /// transient transport error.
    pub fn fail_transient_connects(&self, agent_id: i64, count: usize) {
        self.transient_failures
            .lock()
            .entry(agent_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .store(count, Ordering::SeqCst);
    }

    /// Make every connect attempt for an agent fail hard (non-transient).
    pub fn fail_connect(&self, agent_id: i64, message: &str) {
        self.hard_connect_errors
            .lock()
            .insert(agent_id, message.to_owned());
    }

    /// Delay between scripted events; gives interruption tests a window
    /// to land mid-stream.
    pub fn set_event_delay(&self, delay: Duration) {
        *self.event_delay.lock() = delay;
    }

    /// All clients created so far, in creation order.
    pub fn created_clients(&self) -> Vec<(TaskIdentifier, Arc<ScriptedRuntime>)> {
        self.created.lock().clone()
    }

    /// The most recent client created for a task.
    pub fn client_for(&self, task: TaskIdentifier) -> Option<Arc<ScriptedRuntime>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(t, _)| *t == task)
            .map(|(_, c)| c.clone())
    }

    /// All prompts submitted for a task, across client replacements.
    pub fn queries_for(&self, task: TaskIdentifier) -> Vec<String> {
        self.created
            .lock()
            .iter()
            .filter(|(t, _)| *t == task)
            .flat_map(|(_, c)| c.queries())
            .collect()
    }

    fn queue_for(&self, agent_id: i64) -> ScriptQueue {
        self.scripts
            .lock()
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

impl RuntimeFactory for ScriptedFactory {
    fn create(&self, task: TaskIdentifier, options: &AgentOptions) -> Arc<dyn RuntimeClient> {
        let transient = self
            .transient_failures
            .lock()
            .entry(task.agent_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        let client = Arc::new(ScriptedRuntime {
            scripts: self.queue_for(task.agent_id),
            pending: Mutex::new(None),
            interrupted: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(false),
            resume: options.resume.clone(),
            event_delay: *self.event_delay.lock(),
            transient_failures: transient,
            hard_connect_error: self.hard_connect_errors.lock().get(&task.agent_id).cloned(),
            disconnect_count: AtomicUsize::new(0),
            interrupt_count: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        });
        self.created.lock().push((task, client.clone()));
        client
    }
}
