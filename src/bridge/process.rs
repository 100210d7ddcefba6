//! Strategy child process launch and output monitoring

use super::error::BridgeError;
use super::topics::ReadyMessage;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ENV_SESSION_ID: &str = "STRATEGY_SESSION_ID";
pub const ENV_TOPIC_PREFIX: &str = "STRATEGY_TOPIC_PREFIX";
pub const ENV_CHANNEL_URL: &str = "STRATEGY_CHANNEL_URL";
pub const ENV_CONFIG: &str = "STRATEGY_CONFIG";

/// How to start a strategy process
#[derive(Debug, Clone, Default)]
pub struct StrategyLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl StrategyLaunch {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// `sh -c <script>`, handy for wrapper scripts
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").with_args(["-c".to_string(), script.into()])
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Spawn with piped stdio. `session_env` is applied after the launch's
    /// own variables and wins on conflict.
    pub fn spawn(&self, session_env: &[(&str, String)]) -> Result<Child, BridgeError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in session_env {
            command.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| BridgeError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        info!(
            program = %self.program,
            pid = child.id().unwrap_or_default(),
            "StrategyLaunch: strategy process started"
        );
        Ok(child)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Where a readiness signal came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessEvent {
    OutputMarker { stream: OutputStream, line: String },
    Channel(ReadyMessage),
}

/// Decode one line of child output.
///
/// Invalid UTF-8 is replaced with U+FFFD; the flag reports whether that
/// happened. A trailing carriage return is dropped.
pub fn decode_output_line(bytes: &[u8]) -> (String, bool) {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(line) => (line.to_string(), false),
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), true),
    }
}

pub fn matches_marker(line: &str, markers: &[String]) -> bool {
    markers.iter().any(|marker| line.contains(marker.as_str()))
}

/// Log every line of `reader` and report the first readiness marker.
///
/// Runs until the stream closes, a read fails, or `cancel` fires.
/// Undecodable bytes never stop the loop.
pub async fn watch_output<R>(
    reader: R,
    stream: OutputStream,
    session_id: String,
    markers: Arc<Vec<String>>,
    ready_tx: mpsc::UnboundedSender<ReadinessEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut announced = false;

    loop {
        let segment = tokio::select! {
            _ = cancel.cancelled() => break,
            segment = segments.next_segment() => segment,
        };

        match segment {
            Ok(Some(bytes)) => {
                let (line, lossy) = decode_output_line(&bytes);
                if lossy {
                    warn!(
                        session_id = %session_id,
                        stream = %stream,
                        "Strategy output contained invalid UTF-8: {}",
                        line
                    );
                } else {
                    debug!(session_id = %session_id, stream = %stream, "{}", line);
                }

                if !announced && matches_marker(&line, &markers) {
                    announced = true;
                    let _ = ready_tx.send(ReadinessEvent::OutputMarker { stream, line });
                }
            }
            Ok(None) => {
                debug!(session_id = %session_id, stream = %stream, "Strategy output closed");
                break;
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    stream = %stream,
                    error = %e,
                    "Failed to read strategy output"
                );
                break;
            }
        }
    }
}
