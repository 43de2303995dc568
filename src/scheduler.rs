//! Timed job loops.
//!
//! Each job runs on its own task: optional first-run delay, then run,
//! then wait one interval between runs. A handler error is logged and the
//! loop backs off one extra interval. Every wait observes the shutdown
//! token.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spawns a timed loop named `name` driving `handler`.
pub fn spawn_timed<F, Fut, E>(
    name: String,
    interval: Duration,
    first_delay: Option<Duration>,
    shutdown: CancellationToken,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::fmt::Display + Send,
{
    tokio::spawn(async move {
        if let Some(delay) = first_delay {
            info!(job = %name, delay_secs = delay.as_secs(), interval_secs = interval.as_secs(),
                  "delaying first run");
            if wait(&shutdown, delay).await {
                return;
            }
        }

        loop {
            debug!(job = %name, "loop run");
            if let Err(e) = handler().await {
                warn!(job = %name, error = %e, backoff_secs = interval.as_secs(),
                      "job run failed, backing off one interval");
                if wait(&shutdown, interval).await {
                    break;
                }
            }
            if wait(&shutdown, interval).await {
                break;
            }
        }
        info!(job = %name, "terminating timed loop");
    })
}

/// Sleeps for `duration`, returning true when the shutdown token fired.
async fn wait(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
