//! Cross-process strategy execution: message bus, child process
//! management and the per-job session tying them together

pub mod channel;
pub mod error;
pub mod executor;
pub mod process;
pub mod session;
pub mod topics;

pub use channel::{BusMessage, BusStream, InMemoryMessageBus, MessageBus, RedisMessageBus};
pub use error::BridgeError;
pub use executor::BridgeJobExecutor;
pub use process::{decode_output_line, OutputStream, ReadinessEvent, StrategyLaunch};
pub use session::{BridgeState, BridgeStatistics, StrategyBridge};
pub use topics::{
    BootstrapMessage, ControlMessage, MarketDataMessage, ReadyMessage, SessionTopics,
    SimulationTimeMessage,
};
