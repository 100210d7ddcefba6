//! Per-session topic names and the JSON payloads exchanged on them

use crate::models::{Bar, StrategySignal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic names for one session, all under `{prefix}:{session_id}:`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTopics {
    pub market_data: String,
    pub sim_time: String,
    pub signal: String,
    pub ready: String,
    pub bootstrap: String,
    pub control: String,
}

impl SessionTopics {
    pub fn new(prefix: &str, session_id: &str) -> Self {
        let topic = |name: &str| format!("{}:{}:{}", prefix, session_id, name);
        Self {
            market_data: topic("market_data"),
            sim_time: topic("sim_time"),
            signal: topic("signal"),
            ready: topic("ready"),
            bootstrap: topic("bootstrap"),
            control: topic("control"),
        }
    }

    /// Topics the session listens on
    pub fn inbound(&self) -> Vec<String> {
        vec![self.signal.clone(), self.ready.clone()]
    }
}

/// Outbound bar on the market-data topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataMessage {
    pub session_id: String,
    pub sequence: u64,
    pub bar: Bar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationTimeMessage {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Lookback bars offered to the strategy while it warms up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapMessage {
    pub symbol: String,
    pub attempt: u64,
    pub bars: Vec<Bar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlMessage {
    Shutdown,
}

/// Inbound readiness announcement. Any payload on the ready topic counts;
/// the fields are informational.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMessage {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Payloads that are not a [`ReadyMessage`] still announce readiness; they
/// decode to the empty message.
pub fn decode_ready(payload: &str) -> ReadyMessage {
    serde_json::from_str(payload).unwrap_or_default()
}

pub fn decode_signal(payload: &str) -> Result<StrategySignal, serde_json::Error> {
    serde_json::from_str(payload)
}
