//! Unit tests for the in-memory historical context provider

use backtest_orchestrator::models::Bar;
use backtest_orchestrator::services::historical::{
    HistoricalContextProvider, InMemoryContextProvider,
};
use chrono::{Duration, NaiveDate, TimeZone, Utc};

fn daily_bars(symbol: &str, days: i64) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..days)
        .map(|i| {
            let price = 100.0 + i as f64;
            Bar::new(symbol, price, price + 1.0, price - 1.0, price, 10.0, start + Duration::days(i))
        })
        .collect()
}

#[tokio::test]
async fn test_symbol_availability() {
    let provider = InMemoryContextProvider::new()
        .with_bars("BTC", daily_bars("BTC", 10))
        .with_bars("ETH", daily_bars("ETH", 3));

    let btc = provider.test_symbol_availability("BTC").await;
    assert!(btc.available);
    let (first, last) = btc.date_range.unwrap();
    assert_eq!((last - first).num_days(), 9);

    let doge = provider.test_symbol_availability("DOGE").await;
    assert!(!doge.available);
    assert!(doge.date_range.is_none());
    assert_eq!(doge.all_available_symbols, vec!["BTC", "ETH"]);
}

#[tokio::test]
async fn test_start_and_stop() {
    let mut provider = InMemoryContextProvider::new();
    provider.start().await.unwrap();
    assert!(provider.is_started());
    provider.stop().await.unwrap();
    assert!(!provider.is_started());
}

#[tokio::test]
async fn test_lookback_is_relative_to_simulation_time() {
    let bars = daily_bars("BTC", 10);
    let mut provider = InMemoryContextProvider::new().with_bars("BTC", bars.clone());

    assert_eq!(provider.lookback_bars("BTC", 3).await.unwrap().len(), 3);

    provider.set_simulation_time(bars[5].timestamp);
    assert_eq!(provider.simulation_time(), Some(bars[5].timestamp));
    let lookback = provider.lookback_bars("BTC", 3).await.unwrap();
    let closes: Vec<f64> = lookback.iter().map(|b| b.close).collect();
    assert_eq!(closes, vec![102.0, 103.0, 104.0]);

    let all_before = provider.lookback_bars("BTC", 100).await.unwrap();
    assert_eq!(all_before.len(), 5);
    assert!(provider.lookback_bars("ETH", 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bars_between_is_inclusive() {
    let provider = InMemoryContextProvider::new().with_bars("BTC", daily_bars("BTC", 10));
    let bars = provider
        .bars_between(
            "BTC",
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bars.len(), 3);
    assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}
