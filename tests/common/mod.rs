#![allow(dead_code)]

pub mod schedulers;
pub mod sources;
pub mod strategies;

pub use schedulers::*;
pub use sources::*;

use std::future::Future;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `future`, failing the test instead of hanging
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation did not finish in time")
}

/// Give scheduled block work a chance to run on the current runtime
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}
