//! Unit tests for the polling primitives.

use std::cell::Cell;
use std::io;
use std::time::Duration;

use rstest::rstest;
use tokio::time::Instant;

use super::*;

const POLL: Poll = Poll::new(Duration::from_secs(60), Duration::from_secs(10));

#[tokio::test(start_paused = true)]
async fn first_check_runs_without_delay() {
    let start = Instant::now();
    let result = wait_until_ready(POLL, &CancelSignal::never(), || async {
        Ok::<_, io::Error>(true)
    })
    .await;

    assert!(result.is_ok());
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn ready_after_third_check_sleeps_two_intervals() {
    let calls = Cell::new(0_u32);
    let start = Instant::now();
    wait_until_ready(POLL, &CancelSignal::never(), || {
        calls.set(calls.get() + 1);
        let ready = calls.get() == 3;
        async move { Ok::<_, io::Error>(ready) }
    })
    .await
    .expect("poll should succeed");

    assert_eq!(calls.get(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn timeout_is_bounded_by_budget_plus_one_interval() {
    let calls = Cell::new(0_u32);
    let start = Instant::now();
    let err = wait_until_ready(POLL, &CancelSignal::never(), || {
        calls.set(calls.get() + 1);
        async { Ok::<_, io::Error>(false) }
    })
    .await
    .expect_err("poll should time out");

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(start.elapsed() <= POLL.timeout + POLL.interval);
    assert!(start.elapsed() >= POLL.timeout);
    assert_eq!(calls.get(), 7);
    assert!(matches!(err, PollError::Timeout { attempts: 7, .. }));
}

#[tokio::test(start_paused = true)]
async fn hung_check_is_abandoned_at_the_bound() {
    let start = Instant::now();
    let err = wait_until_ready(POLL, &CancelSignal::never(), || async {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok::<_, io::Error>(true)
    })
    .await
    .expect_err("hung check should time out");

    assert!(matches!(err, PollError::Timeout { attempts: 1, .. }), "got {err}");
    assert_eq!(start.elapsed(), POLL.timeout + POLL.interval);
}

#[tokio::test(start_paused = true)]
async fn check_error_aborts_without_further_attempts() {
    let calls = Cell::new(0_u32);
    let start = Instant::now();
    let err = wait_until_ready(POLL, &CancelSignal::never(), || {
        calls.set(calls.get() + 1);
        async { Err::<bool, _>(io::Error::other("instance entered ERROR")) }
    })
    .await
    .expect_err("poll should fail");

    assert_eq!(calls.get(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(!err.is_timeout());
    let source = err.into_check().expect("check error should be preserved");
    assert_eq!(source.to_string(), "instance entered ERROR");
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_sleep() {
    let (canceller, signal) = cancel_pair();
    let calls = Cell::new(0_u32);
    let poll = wait_until_ready(POLL, &signal, || {
        calls.set(calls.get() + 1);
        async { Ok::<_, io::Error>(false) }
    });
    let cancel = async {
        tokio::time::sleep(Duration::from_secs(15)).await;
        canceller.cancel();
    };

    let (result, ()) = tokio::join!(poll, cancel);

    assert!(matches!(result, Err(PollError::Cancelled)));
    assert_eq!(calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelled_signal_prevents_first_check() {
    let (canceller, signal) = cancel_pair();
    canceller.cancel();
    let calls = Cell::new(0_u32);
    let result = wait_until_ready(POLL, &signal, || {
        calls.set(calls.get() + 1);
        async { Ok::<_, io::Error>(true) }
    })
    .await;

    assert!(matches!(result, Err(PollError::Cancelled)));
    assert_eq!(calls.get(), 0);
}

#[rstest]
#[case(0, 1)]
#[case(1, 1)]
#[case(3, 3)]
#[tokio::test(start_paused = true)]
async fn retry_returns_last_error_after_all_attempts(#[case] attempts: u32, #[case] runs: u32) {
    let calls = Cell::new(0_u32);
    let err = retry(attempts, Duration::from_secs(3), &CancelSignal::never(), || {
        calls.set(calls.get() + 1);
        let attempt = calls.get();
        async move { Err::<(), _>(io::Error::other(format!("attempt {attempt}"))) }
    })
    .await
    .expect_err("retry should give up");

    assert_eq!(calls.get(), runs);
    assert_eq!(err.to_string(), format!("attempt {runs}"));
}

#[tokio::test(start_paused = true)]
async fn retry_stops_at_first_success() {
    let calls = Cell::new(0_u32);
    let start = Instant::now();
    let value = retry(10, Duration::from_secs(3), &CancelSignal::never(), || {
        calls.set(calls.get() + 1);
        let attempt = calls.get();
        async move {
            if attempt < 4 {
                Err(io::Error::other("inactive"))
            } else {
                Ok(attempt)
            }
        }
    })
    .await
    .expect("retry should succeed");

    assert_eq!(value, 4);
    assert_eq!(start.elapsed(), Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn poll_for_returns_the_ready_value() {
    let calls = Cell::new(0_u32);
    let value = poll_for(POLL, &CancelSignal::never(), || {
        calls.set(calls.get() + 1);
        let attempt = calls.get();
        async move { Ok::<_, io::Error>((attempt == 2).then_some("10.0.0.7")) }
    })
    .await
    .expect("poll should succeed");

    assert_eq!(value, "10.0.0.7");
}
