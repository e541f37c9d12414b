//! Transaction pool integration tests.

mod pool;
mod sync;

use std::time::Duration;

/// Polls `condition` until it holds, panicking after a few seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within the deadline");
}
