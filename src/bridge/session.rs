//! One strategy execution session: a child process driven over the bus

use super::channel::{BusStream, MessageBus};
use super::error::BridgeError;
use super::process::{
    watch_output, OutputStream, ReadinessEvent, StrategyLaunch, ENV_CHANNEL_URL, ENV_CONFIG,
    ENV_SESSION_ID, ENV_TOPIC_PREFIX,
};
use super::topics::{
    decode_ready, decode_signal, encode, BootstrapMessage, ControlMessage, MarketDataMessage,
    SessionTopics, SimulationTimeMessage,
};
use crate::config::BridgeConfig;
use crate::metrics::Metrics;
use crate::models::{Bar, StrategySignal};
use crate::services::historical::HistoricalContextProvider;
use chrono::NaiveDate;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    Stopped,
    Starting,
    Ready,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Stopped => "STOPPED",
            BridgeState::Starting => "STARTING",
            BridgeState::Ready => "READY",
            BridgeState::Running => "RUNNING",
            BridgeState::Stopping => "STOPPING",
            BridgeState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatistics {
    pub session_id: String,
    pub symbol: String,
    pub state: BridgeState,
    pub ready: bool,
    pub bars_forwarded: u64,
    pub signals_received: u64,
    pub bootstrap_requests: u64,
}

/// Bridge between the backtest loop and a strategy running in a child
/// process.
///
/// The session owns its historical context provider and the child. Output
/// watchers and the bus listener run as separate tasks and hand results
/// back over channels. Sessions are single-use.
pub struct StrategyBridge {
    session_id: String,
    symbol: String,
    config: BridgeConfig,
    launch: StrategyLaunch,
    strategy_config: Value,
    provider: Box<dyn HistoricalContextProvider>,
    provider_started: bool,
    bus: Arc<dyn MessageBus>,
    topics: SessionTopics,
    metrics: Option<Arc<Metrics>>,
    counted_active: bool,

    state: BridgeState,
    ready: Arc<AtomicBool>,
    bars_forwarded: u64,
    signals_received: Arc<AtomicU64>,
    bootstrap_requests: u64,

    child: Option<Child>,
    stdin: Option<ChildStdin>,
    signal_rx: Option<mpsc::UnboundedReceiver<StrategySignal>>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl StrategyBridge {
    pub fn new(
        symbol: impl Into<String>,
        launch: StrategyLaunch,
        provider: Box<dyn HistoricalContextProvider>,
        bus: Arc<dyn MessageBus>,
        config: BridgeConfig,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let topics = SessionTopics::new(&config.topic_prefix, &session_id);
        Self {
            session_id,
            symbol: symbol.into(),
            config,
            launch,
            strategy_config: Value::Object(Default::default()),
            provider,
            provider_started: false,
            bus,
            topics,
            metrics: None,
            counted_active: false,
            state: BridgeState::Stopped,
            ready: Arc::new(AtomicBool::new(false)),
            bars_forwarded: 0,
            signals_received: Arc::new(AtomicU64::new(0)),
            bootstrap_requests: 0,
            child: None,
            stdin: None,
            signal_rx: None,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self.topics = SessionTopics::new(&self.config.topic_prefix, &self.session_id);
        self
    }

    /// Configuration handed to the child as JSON in `STRATEGY_CONFIG`
    pub fn with_strategy_config(mut self, config: Value) -> Self {
        self.strategy_config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn topics(&self) -> &SessionTopics {
        &self.topics
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Launch the strategy and wait up to `wait` for it to report ready.
    ///
    /// Returns `Ok(false)` when the wait elapses or the child exits first.
    /// Errors are reserved for setup problems: invalid configuration,
    /// unknown symbol, provider failure, unreachable bus, or a child that
    /// cannot be spawned. An invalid configuration leaves the session
    /// `STOPPED`.
    pub async fn start(&mut self, wait: Duration) -> Result<bool, BridgeError> {
        if self.state != BridgeState::Stopped {
            return Err(BridgeError::InvalidState {
                session_id: self.session_id.clone(),
                action: "start",
                state: self.state.to_string(),
            });
        }
        self.config.validate().map_err(BridgeError::Config)?;
        self.state = BridgeState::Starting;

        match self.launch_and_wait(wait).await {
            Ok(true) => {
                self.state = BridgeState::Ready;
                if let Some(metrics) = &self.metrics {
                    metrics.bridge_sessions_active.inc();
                    self.counted_active = true;
                }
                info!(
                    session_id = %self.session_id,
                    symbol = %self.symbol,
                    bootstrap_requests = self.bootstrap_requests,
                    "StrategyBridge: strategy ready"
                );
                Ok(true)
            }
            Ok(false) => {
                self.state = BridgeState::Error;
                Ok(false)
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "StrategyBridge: start failed");
                self.state = BridgeState::Error;
                Err(e)
            }
        }
    }

    async fn launch_and_wait(&mut self, wait: Duration) -> Result<bool, BridgeError> {
        let availability = self.provider.test_symbol_availability(&self.symbol).await;
        if !availability.available {
            return Err(BridgeError::SymbolUnavailable {
                symbol: self.symbol.clone(),
                available: availability.all_available_symbols,
            });
        }

        self.provider
            .start()
            .await
            .map_err(|e| BridgeError::Provider(e.to_string()))?;
        self.provider_started = true;

        // Subscribe before the child exists so an early ready message is not lost
        let inbound = self.bus.subscribe(&self.topics.inbound()).await?;

        let session_env = [
            (ENV_SESSION_ID, self.session_id.clone()),
            (ENV_TOPIC_PREFIX, self.config.topic_prefix.clone()),
            (ENV_CHANNEL_URL, self.bus.endpoint()),
            (ENV_CONFIG, self.strategy_config.to_string()),
        ];
        let mut child = self.launch.spawn(&session_env)?;
        self.stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.child = Some(child);

        self.cancel = CancellationToken::new();
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        self.signal_rx = Some(signal_rx);

        let markers = Arc::new(self.config.readiness_markers.clone());
        if let Some(stdout) = stdout {
            self.workers.push(tokio::spawn(watch_output(
                stdout,
                OutputStream::Stdout,
                self.session_id.clone(),
                Arc::clone(&markers),
                ready_tx.clone(),
                self.cancel.clone(),
            )));
        }
        if let Some(stderr) = stderr {
            self.workers.push(tokio::spawn(watch_output(
                stderr,
                OutputStream::Stderr,
                self.session_id.clone(),
                markers,
                ready_tx.clone(),
                self.cancel.clone(),
            )));
        }
        self.workers.push(tokio::spawn(listen(
            inbound,
            self.topics.clone(),
            self.session_id.clone(),
            ready_tx,
            signal_tx,
            Arc::clone(&self.signals_received),
            self.metrics.clone(),
            self.cancel.clone(),
        )));

        self.wait_for_readiness(&mut ready_rx, wait).await
    }

    async fn wait_for_readiness(
        &mut self,
        ready_rx: &mut mpsc::UnboundedReceiver<ReadinessEvent>,
        wait: Duration,
    ) -> Result<bool, BridgeError> {
        let deadline = Instant::now() + wait;
        let mut bootstrap_tick = tokio::time::interval(self.config.bootstrap_interval);
        let mut exit_tick = tokio::time::interval(EXIT_POLL_INTERVAL);
        let mut sources_open = true;

        loop {
            tokio::select! {
                event = ready_rx.recv(), if sources_open => match event {
                    Some(event) => {
                        self.mark_ready(&event);
                        return Ok(true);
                    }
                    None => sources_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        session_id = %self.session_id,
                        timeout_ms = wait.as_millis() as u64,
                        bootstrap_requests = self.bootstrap_requests,
                        "StrategyBridge: timed out waiting for strategy readiness"
                    );
                    return Ok(false);
                }
                _ = bootstrap_tick.tick() => self.publish_bootstrap().await,
                _ = exit_tick.tick() => {
                    if let Some(status) = self.child_exit_status() {
                        // The child may have announced readiness right before exiting
                        if let Ok(event) = ready_rx.try_recv() {
                            self.mark_ready(&event);
                            return Ok(true);
                        }
                        warn!(
                            session_id = %self.session_id,
                            status = %status,
                            "StrategyBridge: strategy process exited before becoming ready"
                        );
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn mark_ready(&self, event: &ReadinessEvent) {
        match event {
            ReadinessEvent::Channel(ready) => info!(
                session_id = %self.session_id,
                strategy = ready.strategy.as_deref().unwrap_or("-"),
                message = ready.message.as_deref().unwrap_or("-"),
                "StrategyBridge: ready message on bus"
            ),
            ReadinessEvent::OutputMarker { stream, line } => debug!(
                session_id = %self.session_id,
                stream = %stream,
                "StrategyBridge: readiness marker in output: {}",
                line
            ),
        }
        self.ready.store(true, Ordering::SeqCst);
    }

    fn child_exit_status(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "StrategyBridge: failed to poll child");
                None
            }
        }
    }

    async fn publish_bootstrap(&mut self) {
        self.bootstrap_requests += 1;
        let bars = match self
            .provider
            .lookback_bars(&self.symbol, self.config.lookback_bars)
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "StrategyBridge: lookback unavailable");
                Vec::new()
            }
        };
        let message = BootstrapMessage {
            symbol: self.symbol.clone(),
            attempt: self.bootstrap_requests,
            bars,
        };
        let result = match encode(&message) {
            Ok(payload) => self.bus.publish(&self.topics.bootstrap, &payload).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => debug!(
                session_id = %self.session_id,
                attempt = self.bootstrap_requests,
                bars = message.bars.len(),
                "StrategyBridge: bootstrap published"
            ),
            Err(e) => warn!(session_id = %self.session_id, error = %e, "StrategyBridge: bootstrap publish failed"),
        }
    }

    /// Forward one bar and poll briefly for a signal.
    ///
    /// Signals are asynchronous; one produced for this bar may only show up
    /// on a later call.
    pub async fn process_market_data(
        &mut self,
        bar: &Bar,
    ) -> Result<Option<StrategySignal>, BridgeError> {
        match self.state {
            BridgeState::Ready => self.state = BridgeState::Running,
            BridgeState::Running => {}
            state => {
                return Err(BridgeError::NotReady {
                    session_id: self.session_id.clone(),
                    state: state.to_string(),
                })
            }
        }

        self.provider.set_simulation_time(bar.timestamp);
        self.publish_simulation_time(bar).await;

        let message = MarketDataMessage {
            session_id: self.session_id.clone(),
            sequence: self.bars_forwarded + 1,
            bar: bar.clone(),
        };
        self.bus
            .publish(&self.topics.market_data, &encode(&message)?)
            .await?;
        self.bars_forwarded += 1;
        if let Some(metrics) = &self.metrics {
            metrics.bridge_bars_forwarded_total.inc();
        }

        Ok(self.poll_signal().await)
    }

    async fn publish_simulation_time(&self, bar: &Bar) {
        let message = SimulationTimeMessage {
            session_id: self.session_id.clone(),
            timestamp: bar.timestamp,
        };
        let result = match encode(&message) {
            Ok(payload) => self.bus.publish(&self.topics.sim_time, &payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(
                session_id = %self.session_id,
                timestamp = %bar.timestamp,
                error = %e,
                "StrategyBridge: failed to publish simulation time"
            );
        }
    }

    async fn poll_signal(&mut self) -> Option<StrategySignal> {
        let rx = self.signal_rx.as_mut()?;
        match rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => timeout(self.config.signal_poll_timeout, rx.recv())
                .await
                .ok()
                .flatten(),
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Signals that arrived and were not yet returned
    pub fn drain_signals(&mut self) -> Vec<StrategySignal> {
        let mut signals = Vec::new();
        if let Some(rx) = self.signal_rx.as_mut() {
            while let Ok(signal) = rx.try_recv() {
                signals.push(signal);
            }
        }
        signals
    }

    /// Bars in the simulated range, from the session's provider
    pub async fn simulation_bars(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, BridgeError> {
        self.provider
            .bars_between(&self.symbol, start, end)
            .await
            .map_err(|e| BridgeError::Provider(e.to_string()))
    }

    pub fn get_statistics(&self) -> BridgeStatistics {
        BridgeStatistics {
            session_id: self.session_id.clone(),
            symbol: self.symbol.clone(),
            state: self.state,
            ready: self.is_ready(),
            bars_forwarded: self.bars_forwarded,
            signals_received: self.signals_received.load(Ordering::SeqCst),
            bootstrap_requests: self.bootstrap_requests,
        }
    }

    /// Tear the session down. Safe to call repeatedly and from any state.
    pub async fn shutdown(&mut self) {
        let nothing_to_do = self.child.is_none()
            && self.workers.is_empty()
            && !self.provider_started
            && !self.counted_active;
        if nothing_to_do {
            self.state = BridgeState::Stopped;
            return;
        }

        info!(session_id = %self.session_id, state = %self.state, "StrategyBridge: shutting down");
        self.state = BridgeState::Stopping;

        if let Some(child) = self.child.take() {
            self.stop_child(child).await;
        }

        self.cancel.cancel();
        for mut worker in self.workers.drain(..) {
            if timeout(self.config.worker_join_timeout, &mut worker).await.is_err() {
                warn!(session_id = %self.session_id, "StrategyBridge: worker did not stop in time, aborting");
                worker.abort();
            }
        }
        self.signal_rx = None;

        if self.provider_started {
            if let Err(e) = self.provider.stop().await {
                warn!(session_id = %self.session_id, error = %e, "StrategyBridge: provider stop failed");
            }
            self.provider_started = false;
        }

        if self.counted_active {
            if let Some(metrics) = &self.metrics {
                metrics.bridge_sessions_active.dec();
            }
            self.counted_active = false;
        }

        self.ready.store(false, Ordering::SeqCst);
        self.state = BridgeState::Stopped;
        info!(
            session_id = %self.session_id,
            bars_forwarded = self.bars_forwarded,
            signals_received = self.signals_received.load(Ordering::SeqCst),
            "StrategyBridge: stopped"
        );
    }

    async fn stop_child(&mut self, mut child: Child) {
        if let Ok(Some(status)) = child.try_wait() {
            debug!(session_id = %self.session_id, status = %status, "StrategyBridge: child already exited");
            self.stdin = None;
            return;
        }

        match encode(&ControlMessage::Shutdown) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&self.topics.control, &payload).await {
                    debug!(session_id = %self.session_id, error = %e, "StrategyBridge: shutdown request not delivered");
                }
            }
            Err(e) => debug!(session_id = %self.session_id, error = %e, "StrategyBridge: shutdown request not encoded"),
        }
        // EOF on stdin is the fallback shutdown request
        self.stdin = None;

        match timeout(self.config.graceful_shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(session_id = %self.session_id, status = %status, "StrategyBridge: child exited")
            }
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "StrategyBridge: failed waiting for child")
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "StrategyBridge: child ignored shutdown, killing");
                if let Err(e) = child.start_kill() {
                    warn!(session_id = %self.session_id, error = %e, "StrategyBridge: kill failed");
                }
                if timeout(self.config.worker_join_timeout, child.wait()).await.is_err() {
                    warn!(session_id = %self.session_id, "StrategyBridge: child still running after kill");
                }
            }
        }
    }
}

impl Drop for StrategyBridge {
    fn drop(&mut self) {
        // Children are killed on drop; the workers only need the signal
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn listen(
    mut inbound: BusStream,
    topics: SessionTopics,
    session_id: String,
    ready_tx: mpsc::UnboundedSender<ReadinessEvent>,
    signal_tx: mpsc::UnboundedSender<StrategySignal>,
    signals_received: Arc<AtomicU64>,
    metrics: Option<Arc<Metrics>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.next() => message,
        };
        let Some(message) = message else {
            debug!(session_id = %session_id, "StrategyBridge: inbound subscription closed");
            break;
        };

        if message.topic == topics.ready {
            let _ = ready_tx.send(ReadinessEvent::Channel(decode_ready(&message.payload)));
        } else if message.topic == topics.signal {
            match decode_signal(&message.payload) {
                Ok(signal) => {
                    signals_received.fetch_add(1, Ordering::SeqCst);
                    if let Some(metrics) = &metrics {
                        metrics.bridge_signals_received_total.inc();
                    }
                    if signal_tx.send(signal).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(
                    session_id = %session_id,
                    error = %e,
                    "StrategyBridge: ignoring malformed signal: {}",
                    message.payload
                ),
            }
        }
    }
}
