//! Helpers for joining terminating background workers

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant};
use tracing::{event, Level};

/// A named background task owned by a pool.
pub(crate) struct Worker {
    pub(crate) name: String,
    pub(crate) handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn new(name: impl ToString, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.to_string(),
            handle,
        }
    }
}

/// Waits for every worker to exit, sharing a single `timeout` between them.
///
/// Workers which haven't exited by then are aborted and abandoned.
pub(crate) async fn join_all(workers: Vec<Worker>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for mut worker in workers {
        match tokio::time::timeout_at(deadline, &mut worker.handle).await {
            Ok(result) => log_exit(&worker.name, result),
            Err(_) => {
                event!(
                    Level::WARN,
                    worker = worker.name,
                    "Worker did not stop in time; abandoning it"
                );
                worker.handle.abort();
            }
        }
    }
}

/// Aborts every worker without waiting.
pub(crate) fn abort_all(workers: &[Worker]) {
    for worker in workers {
        worker.handle.abort();
    }
}

fn log_exit(name: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => event!(Level::TRACE, worker = name, "Worker stopped"),
        Err(err) if err.is_cancelled() => {
            event!(Level::DEBUG, worker = name, "Worker was cancelled")
        }
        Err(err) => event!(Level::ERROR, worker = name, err = %err, "Worker failed"),
    }
}
