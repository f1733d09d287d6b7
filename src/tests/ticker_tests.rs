use std::time::Duration;

use tokio::time::timeout;

use crate::ticker::{ForceTicker, IntervalTicker, Ticker};

#[tokio::test(start_paused = true)]
async fn force_ticker_delivers_forced_ticks() {
    let mut ticker = ForceTicker::new();
    let handle = ticker.handle();
    ticker.resume();

    handle.force();
    handle.force();

    timeout(Duration::from_secs(1), ticker.ticks())
        .await
        .expect("first forced tick");
    timeout(Duration::from_secs(1), ticker.ticks())
        .await
        .expect("second forced tick");

    // No third tick was forced.
    assert!(
        timeout(Duration::from_secs(1), ticker.ticks())
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn force_ticker_queues_ticks_while_stopped() {
    let mut ticker = ForceTicker::new();
    let handle = ticker.handle();

    handle.force();
    assert!(
        timeout(Duration::from_secs(1), ticker.ticks())
            .await
            .is_err()
    );

    ticker.resume();
    timeout(Duration::from_secs(1), ticker.ticks())
        .await
        .expect("queued tick delivered after resume");
}

#[tokio::test(start_paused = true)]
async fn interval_ticker_waits_a_full_period() {
    let mut ticker = IntervalTicker::new(Duration::from_secs(60));
    ticker.resume();

    // No tick at resume time.
    assert!(
        timeout(Duration::from_secs(1), ticker.ticks())
            .await
            .is_err()
    );

    timeout(Duration::from_secs(120), ticker.ticks())
        .await
        .expect("tick after one period");
}

#[tokio::test(start_paused = true)]
async fn interval_ticker_pends_while_stopped() {
    let mut ticker = IntervalTicker::new(Duration::from_millis(10));

    assert!(
        timeout(Duration::from_secs(1), ticker.ticks())
            .await
            .is_err()
    );

    ticker.resume();
    timeout(Duration::from_secs(1), ticker.ticks())
        .await
        .expect("tick once resumed");

    ticker.stop();
    assert!(
        timeout(Duration::from_secs(1), ticker.ticks())
            .await
            .is_err()
    );
}
