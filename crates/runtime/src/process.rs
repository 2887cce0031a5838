//! Subprocess transport for the LLM runtime.
//!
//! Speaks line-delimited JSON with a runtime CLI: an `init` line with
//! the connection options, `query` lines per turn, an `interrupt`
//! control line, and one [`RuntimeEvent`] JSON object per stdout line
//! (a `result` event terminates each turn's stream).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};

use ag_domain::stream::{BoxStream, RuntimeEvent};
use ag_domain::types::ImageAttachment;
use ag_domain::{Error, Result, TaskIdentifier};

use crate::client::{RuntimeClient, RuntimeFactory};
use crate::options::AgentOptions;

pub struct ProcessRuntime {
    command: String,
    args: Vec<String>,
    options: AgentOptions,
    child: Mutex<Option<Child>>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    lines: Arc<tokio::sync::Mutex<Option<Lines<BufReader<ChildStdout>>>>>,
    ready: AtomicBool,
}

impl ProcessRuntime {
    fn new(command: String, args: Vec<String>, options: AgentOptions) -> Self {
        Self {
            command,
            args,
            options,
            child: Mutex::new(None),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            lines: Arc::new(tokio::sync::Mutex::new(None)),
            ready: AtomicBool::new(false),
        }
    }

    async fn write_line(&self, payload: serde_json::Value) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::TransientTransport(
                "transport is not ready for writing".into(),
            ));
        };
        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');
        stdin.write_all(&line).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                Error::TransientTransport("transport is not ready for writing".into())
            } else {
                Error::Io(e)
            }
        })?;
        stdin.flush().await.map_err(Error::Io)
    }
}

#[async_trait::async_trait]
impl RuntimeClient for ProcessRuntime {
    async fn connect(&self) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Lifecycle(format!("spawning {}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Lifecycle("runtime child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Lifecycle("runtime child has no stdout".into()))?;

        *self.stdin.lock().await = Some(stdin);
        *self.lines.lock().await = Some(BufReader::new(stdout).lines());
        *self.child.lock() = Some(child);

        self.write_line(serde_json::json!({
            "type": "init",
            "options": self.options,
        }))
        .await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        *self.stdin.lock().await = None;
        *self.lines.lock().await = None;
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.write_line(serde_json::json!({ "type": "interrupt" }))
            .await
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn query(&self, prompt: &str, images: &[ImageAttachment]) -> Result<()> {
        self.write_line(serde_json::json!({
            "type": "query",
            "prompt": prompt,
            "images": images,
        }))
        .await
    }

    fn receive_events(&self) -> BoxStream<'static, Result<RuntimeEvent>> {
        let lines = self.lines.clone();
        Box::pin(async_stream::stream! {
            let mut guard = lines.lock_owned().await;
            let Some(reader) = guard.as_mut() else {
                yield Err(Error::TransientTransport(
                    "transport is not ready for reading".into(),
                ));
                return;
            };
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<RuntimeEvent>(&line) {
                            Ok(event) => {
                                let terminal = matches!(event, RuntimeEvent::Result { .. });
                                yield Ok(event);
                                if terminal {
                                    return;
                                }
                            }
                            Err(e) => {
                                yield Err(Error::Json(e));
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        yield Err(Error::Io(e));
                        return;
                    }
                }
            }
        })
    }

    fn resume_session(&self) -> Option<String> {
        self.options.resume.clone()
    }
}

/// Spawns one runtime subprocess per pooled client.
pub struct ProcessRuntimeFactory {
    command: String,
    args: Vec<String>,
}

impl ProcessRuntimeFactory {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self { command, args }
    }
}

impl RuntimeFactory for ProcessRuntimeFactory {
    fn create(&self, task: TaskIdentifier, options: &AgentOptions) -> Arc<dyn RuntimeClient> {
        tracing::debug!(task = %task, command = %self.command, "creating runtime subprocess client");
        Arc::new(ProcessRuntime::new(
            self.command.clone(),
            self.args.clone(),
            options.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn factory() -> ProcessRuntimeFactory {
        // `cat` echoes our init line back; it parses as garbage, which
        // is fine for transport-level tests.
        ProcessRuntimeFactory::new("cat".into(), vec![])
    }

    #[tokio::test]
    async fn query_before_connect_is_transient() {
        let client = factory().create(TaskIdentifier::new(1, 2), &AgentOptions::default());
        let err = client.query("hi", &[]).await.unwrap_err();
        assert!(err.is_transient_transport());
    }

    #[tokio::test]
    async fn connect_spawns_and_disconnect_kills() {
        let client = factory().create(TaskIdentifier::new(1, 2), &AgentOptions::default());
        client.connect().await.unwrap();
        assert!(client.is_ready());
        client.disconnect().await.unwrap();
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn missing_binary_fails_connect() {
        let factory = ProcessRuntimeFactory::new("definitely-not-a-binary-7f3a".into(), vec![]);
        let client = factory.create(TaskIdentifier::new(1, 2), &AgentOptions::default());
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn non_event_line_surfaces_parse_error() {
        // `cat` echoes the init line back; it is not a runtime event,
        // so the stream reports a JSON error and ends.
        let client = factory().create(TaskIdentifier::new(1, 2), &AgentOptions::default());
        client.connect().await.unwrap();
        let first = client.receive_events().next().await.unwrap();
        assert!(first.is_err());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn receive_without_reader_is_transient() {
        let client = factory().create(TaskIdentifier::new(1, 2), &AgentOptions::default());
        let events: Vec<_> = client.receive_events().collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().is_err());
    }
}
