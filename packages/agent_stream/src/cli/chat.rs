//! `agent-stream chat`: line-oriented REPL over stdin/stdout.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use agent_stream::{
    ConnectionStatus, MessageId, Role, SessionConfig, SessionHandle, SessionState, WsConnector,
};

/// Turns successive store snapshots into the text that is new since the last
/// call, so streamed tokens print as they arrive.
#[derive(Default)]
pub struct TranscriptRenderer {
    /// Bytes of each message already written
    printed: HashMap<MessageId, usize>,
    finished: HashSet<MessageId>,
    status: ConnectionStatus,
    suggestions: usize,
}

impl TranscriptRenderer {
    pub fn render_delta(&mut self, state: &SessionState) -> String {
        let mut out = String::new();

        if state.status != self.status {
            self.status = state.status;
            let _ = writeln!(out, "[{}]", state.status);
        }

        for message in &state.messages {
            // The user typed these; don't echo
            if message.role == Role::User {
                continue;
            }
            match self.printed.get(&message.id) {
                None => {
                    let speaker = speaker(message.role, message.sender.as_deref());
                    let _ = write!(out, "{speaker}> {}", message.content);
                }
                Some(&done) => out.push_str(message.content.get(done..).unwrap_or_default()),
            }
            self.printed.insert(message.id, message.content.len());
            if !message.is_streaming && self.finished.insert(message.id) {
                out.push('\n');
            }
        }

        for suggestion in state.suggestions.iter().skip(self.suggestions) {
            let line = suggestion
                .line
                .map(|l| format!("L{l} "))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  {line}{}: {}",
                suggestion.severity.as_str(),
                suggestion.message
            );
        }
        self.suggestions = state.suggestions.len();

        out
    }
}

fn speaker(role: Role, sender: Option<&str>) -> String {
    match role {
        Role::Assistant => sender.unwrap_or("assistant").to_string(),
        Role::Error => "error".to_string(),
        Role::System => "system".to_string(),
        Role::User => "you".to_string(),
    }
}

pub async fn chat_command(config: SessionConfig, file: Option<PathBuf>) -> Result<()> {
    info!(url = %config.url, dialect = %config.dialect, "starting chat session");
    let connector = Arc::new(WsConnector::new(config.outbound_queue));
    let session = SessionHandle::spawn(config, connector);

    if let Some(path) = file {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        session.set_active_file(content).await?;
    }

    let mut changes = session.store().subscribe();
    session.connect().await?;

    eprintln!("Type a message and press enter. /reconnect, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut renderer = TranscriptRenderer::default();

    loop {
        tokio::select! {
            change = changes.recv() => {
                match change {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let state = session.store().snapshot().await;
                        let delta = renderer.render_delta(&state);
                        if !delta.is_empty() {
                            stdout.write_all(delta.as_bytes()).await?;
                            stdout.flush().await?;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reconnect" => {
                        session.close().await?;
                        session.connect().await?;
                    }
                    text => {
                        if let Err(e) = session.send_user_message(text).await {
                            eprintln!("[not sent: {e}]");
                        }
                    }
                }
            }
        }
    }

    session.shutdown().await
}
