use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid bridge configuration: {0}")]
    Config(String),
    #[error("symbol {symbol} is not available (available symbols: {available:?})")]
    SymbolUnavailable {
        symbol: String,
        available: Vec<String>,
    },
    #[error("message channel unreachable: {0}")]
    Connectivity(String),
    #[error("failed to publish on {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to launch strategy process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("historical context provider error: {0}")]
    Provider(String),
    #[error("message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("session {session_id} is not ready (state {state})")]
    NotReady { session_id: String, state: String },
    #[error("session {session_id} cannot {action} from state {state}")]
    InvalidState {
        session_id: String,
        action: &'static str,
        state: String,
    },
}
