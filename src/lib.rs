//! Backtest orchestration: a priority job scheduler and a cross-process
//! strategy execution bridge.

pub mod bridge;
pub mod config;
pub mod core;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
