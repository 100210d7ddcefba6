//! Job executor that runs each backtest through a strategy bridge session

use super::channel::MessageBus;
use super::error::BridgeError;
use super::process::StrategyLaunch;
use super::session::StrategyBridge;
use crate::config::BridgeConfig;
use crate::jobs::executor::{ExecutorError, JobExecutor};
use crate::metrics::Metrics;
use crate::models::{Job, JobResult, StrategySignal};
use crate::services::historical::HistoricalContextProvider;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

type ProviderFactory = dyn Fn(&Job) -> Box<dyn HistoricalContextProvider> + Send + Sync;

pub struct BridgeJobExecutor {
    bus: Arc<dyn MessageBus>,
    launch: StrategyLaunch,
    config: BridgeConfig,
    provider_factory: Arc<ProviderFactory>,
    metrics: Option<Arc<Metrics>>,
}

impl BridgeJobExecutor {
    /// `provider_factory` builds a fresh provider for every session
    pub fn new<F>(
        bus: Arc<dyn MessageBus>,
        launch: StrategyLaunch,
        config: BridgeConfig,
        provider_factory: F,
    ) -> Self
    where
        F: Fn(&Job) -> Box<dyn HistoricalContextProvider> + Send + Sync + 'static,
    {
        Self {
            bus,
            launch,
            config,
            provider_factory: Arc::new(provider_factory),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn session_for(&self, job: &Job) -> StrategyBridge {
        let strategy_config = json!({
            "job_id": job.id,
            "strategy": job.strategy,
            "symbol": job.symbol,
            "start_date": job.start_date,
            "end_date": job.end_date,
            "parameters": job.parameters,
        });
        let bridge = StrategyBridge::new(
            job.symbol.clone(),
            self.launch.clone(),
            (self.provider_factory)(job),
            Arc::clone(&self.bus),
            self.config.clone(),
        )
        // A retry gets fresh topics so stale messages from the last attempt are ignored
        .with_session_id(format!("{}-{}", job.id, job.retry_count))
        .with_strategy_config(strategy_config);

        match &self.metrics {
            Some(metrics) => bridge.with_metrics(Arc::clone(metrics)),
            None => bridge,
        }
    }

    async fn run_session(
        &self,
        bridge: &mut StrategyBridge,
        job: &Job,
    ) -> Result<JobResult, BridgeError> {
        if !bridge.start(self.config.readiness_timeout).await? {
            return Ok(JobResult::failure(format!(
                "strategy {} for {} did not become ready",
                job.strategy, job.symbol
            )));
        }

        let bars = bridge.simulation_bars(job.start_date, job.end_date).await?;
        let mut signals = Vec::new();
        for bar in &bars {
            if let Some(signal) = bridge.process_market_data(bar).await? {
                signals.push(signal);
            }
        }
        signals.extend(bridge.drain_signals());

        let stats = bridge.get_statistics();
        info!(
            job_id = %job.id,
            session_id = %stats.session_id,
            bars = stats.bars_forwarded,
            signals = signals.len(),
            "BridgeJobExecutor: backtest finished"
        );
        Ok(JobResult::success(summarize(&signals, stats.bars_forwarded)))
    }
}

fn summarize(signals: &[StrategySignal], bars_processed: u64) -> HashMap<String, Value> {
    let mut by_action: HashMap<String, u64> = HashMap::new();
    for signal in signals {
        let action = serde_json::to_value(signal.action)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        *by_action.entry(action).or_default() += 1;
    }

    let mut metrics = HashMap::new();
    metrics.insert("bars_processed".to_string(), json!(bars_processed));
    metrics.insert("signals_received".to_string(), json!(signals.len()));
    metrics.insert("signals_by_action".to_string(), json!(by_action));
    metrics
}

#[async_trait]
impl JobExecutor for BridgeJobExecutor {
    async fn execute(&self, job: &Job) -> Result<JobResult, ExecutorError> {
        let mut bridge = self.session_for(job);
        let outcome = tokio::time::timeout(job.timeout(), self.run_session(&mut bridge, job)).await;
        bridge.shutdown().await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(
                    job_id = %job.id,
                    timeout_seconds = job.timeout_seconds,
                    "BridgeJobExecutor: job exceeded its timeout"
                );
                Ok(JobResult::timed_out(format!(
                    "job exceeded timeout of {}s",
                    job.timeout_seconds
                )))
            }
        }
    }
}
