//! Worker supervision: spawn, monitor, restart with backoff, and stop
//! the per-source loops and stream consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use intake_model::EmailAccount;

use crate::error::Result;
use crate::mail::ImapFetcher;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Uptime after which the backoff resets to its initial value.
const SUSTAINED_UPTIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub status: String,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Spawns and babysits worker loops. On exit a worker restarts with
/// exponential backoff; on shutdown, in-flight iterations get a grace
/// period before the task is aborted.
pub struct Supervisor {
    cancel: CancellationToken,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    states: Arc<Mutex<HashMap<String, WorkerState>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Token workers observe for shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn states(&self) -> HashMap<String, WorkerState> {
        self.states.lock().unwrap().clone()
    }

    /// Spawn a supervised worker. The factory produces one incarnation
    /// of the loop; each exit (clean or not) triggers a restart until
    /// shutdown.
    pub fn spawn<F, Fut>(&self, name: &str, mut factory: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let states = self.states.clone();
        let name = name.to_owned();

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let name = task_name;
            let mut backoff = INITIAL_BACKOFF;
            let mut restarts = 0u32;

            loop {
                set_state(&states, &name, "running", restarts, None);
                let started = Instant::now();
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = factory() => result,
                };
                if cancel.is_cancelled() {
                    break;
                }

                if started.elapsed() >= SUSTAINED_UPTIME {
                    backoff = INITIAL_BACKOFF;
                }
                let last_error = match result {
                    Ok(()) => {
                        warn!(worker = %name, "worker exited, restarting");
                        None
                    }
                    Err(e) => {
                        error!(worker = %name, error = %e, "worker crashed, restarting");
                        Some(e.to_string())
                    }
                };
                restarts += 1;
                set_state(
                    &states,
                    &name,
                    "backing_off",
                    restarts,
                    last_error,
                );

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            set_state(&states, &name, "stopped", restarts, None);
            info!(worker = %name, "worker stopped");
        });

        self.handles.lock().unwrap().push((name, handle));
    }

    /// Propagate cancellation, wait up to `grace` for in-flight
    /// iterations, then force-terminate stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        info!("supervisor shutting down");
        self.cancel.cancel();

        let handles: Vec<(String, JoinHandle<()>)> =
            std::mem::take(&mut *self.handles.lock().unwrap());
        let deadline = Instant::now() + grace;
        for (name, mut handle) in handles {
            let remaining =
                deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!(worker = %name, "grace period elapsed, aborting");
                handle.abort();
            }
        }
        info!("supervisor stopped");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn set_state(
    states: &Mutex<HashMap<String, WorkerState>>,
    name: &str,
    status: &str,
    restarts: u32,
    last_error: Option<String>,
) {
    states.lock().unwrap().insert(name.to_owned(), WorkerState {
        status: status.to_owned(),
        restarts,
        last_error,
    });
}

/// One incarnation of the per-account IMAP poll loop. Tick errors are
/// absorbed at loop level (transient I/O); only cancellation ends it.
pub async fn imap_account_loop(
    fetcher: Arc<ImapFetcher>,
    account: EmailAccount,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(fetcher.poll_interval());
    ticker
        .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        if let Err(e) = fetcher.poll_account(&account).await {
            error!(
                account = %account.name,
                error = %e,
                "imap poll tick failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn crashed_workers_restart_with_backoff() {
        let supervisor = Supervisor::new();
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        supervisor.spawn("flappy", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::CoreError::Internal("boom".into()))
            }
        });

        // First run + 1s backoff + second run + 2s backoff + third run.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let observed = runs.load(Ordering::SeqCst);
        assert!(
            (3..=4).contains(&observed),
            "expected backoff-paced restarts, saw {observed}"
        );

        let states = supervisor.states();
        assert!(states["flappy"].restarts >= 2);
        supervisor.shutdown(Duration::from_secs(1)).await;
        assert_eq!(supervisor.states()["flappy"].status, "stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_long_running_workers() {
        let supervisor = Supervisor::new();
        let cancel = supervisor.cancel_token();

        supervisor.spawn("steady", move || {
            let cancel = cancel.clone();
            async move {
                cancel.cancelled().await;
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(supervisor.states()["steady"].status, "running");

        supervisor.shutdown(Duration::from_secs(5)).await;
        assert_eq!(supervisor.states()["steady"].status, "stopped");
    }
}
