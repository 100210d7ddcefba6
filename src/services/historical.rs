//! Historical context provider interface and an in-memory implementation.

use crate::models::bar::Bar;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a symbol availability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolAvailability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_available_symbols: Vec<String>,
}

/// Supplies lookback data to one bridge session.
///
/// Each session owns its provider exclusively; providers hold no reference
/// back to the session.
#[async_trait]
pub trait HistoricalContextProvider: Send + Sync {
    async fn start(&mut self) -> Result<(), ProviderError>;

    async fn stop(&mut self) -> Result<(), ProviderError>;

    async fn test_symbol_availability(&self, symbol: &str) -> SymbolAvailability;

    /// Advance the provider's notion of "now" to the simulated bar time
    fn set_simulation_time(&mut self, timestamp: DateTime<Utc>);

    /// Up to `count` bars strictly before the current simulation time
    async fn lookback_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, ProviderError>;

    /// Bars with `start <= date <= end`, oldest first
    async fn bars_between(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, ProviderError>;
}

/// Provider serving bars held in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryContextProvider {
    bars: HashMap<String, Vec<Bar>>,
    simulation_time: Option<DateTime<Utc>>,
    started: bool,
}

impl InMemoryContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bars(mut self, symbol: impl Into<String>, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        self.bars.insert(symbol.into(), bars);
        self
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn simulation_time(&self) -> Option<DateTime<Utc>> {
        self.simulation_time
    }

    fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.bars.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[async_trait]
impl HistoricalContextProvider for InMemoryContextProvider {
    async fn start(&mut self) -> Result<(), ProviderError> {
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProviderError> {
        self.started = false;
        Ok(())
    }

    async fn test_symbol_availability(&self, symbol: &str) -> SymbolAvailability {
        match self.bars.get(symbol).filter(|bars| !bars.is_empty()) {
            Some(bars) => SymbolAvailability {
                available: true,
                date_range: bars
                    .first()
                    .zip(bars.last())
                    .map(|(first, last)| (first.timestamp, last.timestamp)),
                all_available_symbols: self.symbols(),
            },
            None => SymbolAvailability {
                available: false,
                date_range: None,
                all_available_symbols: self.symbols(),
            },
        }
    }

    fn set_simulation_time(&mut self, timestamp: DateTime<Utc>) {
        self.simulation_time = Some(timestamp);
    }

    async fn lookback_bars(&self, symbol: &str, count: usize) -> Result<Vec<Bar>, ProviderError> {
        let Some(bars) = self.bars.get(symbol) else {
            return Ok(Vec::new());
        };
        let eligible: Vec<&Bar> = match self.simulation_time {
            Some(now) => bars.iter().filter(|b| b.timestamp < now).collect(),
            None => bars.iter().collect(),
        };
        let skip = eligible.len().saturating_sub(count);
        let result: Vec<Bar> = eligible.into_iter().skip(skip).cloned().collect();
        debug!(symbol = %symbol, count = result.len(), "InMemoryContextProvider: lookback served");
        Ok(result)
    }

    async fn bars_between(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, ProviderError> {
        Ok(self
            .bars
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| {
                        let date = b.timestamp.date_naive();
                        date >= start && date <= end
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
