use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use crate::config::{WorkerConfig, ms};
use crate::queue::{Claim, Task};
use crate::worker::TaskExecutor;

enum Work {
    Plain(Task),
    Claimed(Claim),
}

/// P poll loops feeding at most M concurrent executions.
///
/// A poll loop that has a task in hand waits for an execution permit before
/// polling again, so the queue drains no faster than executions finish.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

#[derive(Clone)]
struct LoopSettings {
    reliable: bool,
    empty_queue_sleep: Duration,
    error_sleep: Duration,
}

impl WorkerPool {
    pub fn start(executor: Arc<TaskExecutor>, config: &WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let max_in_flight = config.max_in_flight.max(1);
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let settings = LoopSettings {
            reliable: config.reliable_poll,
            empty_queue_sleep: ms(config.empty_queue_sleep_ms),
            error_sleep: ms(config.error_sleep_ms),
        };

        if config.recover_on_start {
            let queue = executor.queue().clone();
            tokio::spawn(async move {
                if let Err(e) = queue.recover_waiting_tasks().await {
                    warn!(error = %e, "Startup recovery failed");
                }
            });
        }

        let mut joins = Vec::with_capacity(config.poll_workers);
        for worker_id in 0..config.poll_workers.max(1) {
            let executor = executor.clone();
            let permits = permits.clone();
            let settings = settings.clone();
            let mut rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                poll_loop(worker_id, executor, permits, settings, &mut rx).await;
            }));
        }

        info!(node = %executor.node(), poll_workers = joins.len(), max_in_flight, "Worker pool started");
        Self {
            shutdown_tx,
            joins,
            permits,
            max_in_flight,
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Stops polling and waits until every running execution has finished.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "Poll loop ended abnormally");
            }
        }
        // Holding every permit means nothing is executing any more.
        match self.permits.acquire_many(self.max_in_flight as u32).await {
            Ok(_all) => info!("Worker pool drained"),
            Err(e) => warn!(error = %e, "Permit pool closed before drain"),
        }
    }
}

async fn poll_loop(
    worker_id: usize,
    executor: Arc<TaskExecutor>,
    permits: Arc<Semaphore>,
    settings: LoopSettings,
    shutdown: &mut watch::Receiver<bool>,
) {
    info!(worker_id, "Poll loop started");
    loop {
        // A dropped sender counts as shutdown too.
        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            break;
        }

        let polled = if settings.reliable {
            executor
                .queue()
                .poll_reliable(executor.node().as_str())
                .await
                .map(|claim| claim.map(Work::Claimed))
        } else {
            executor.queue().poll().await.map(|task| task.map(Work::Plain))
        };

        let work = match polled {
            Ok(Some(work)) => work,
            Ok(None) => {
                pause(settings.empty_queue_sleep, shutdown).await;
                continue;
            }
            Err(e) => {
                error!(worker_id, error = %e, "Poll failed");
                pause(settings.error_sleep, shutdown).await;
                continue;
            }
        };

        // Backpressure point. The task is already off the queue, so keep
        // waiting through a shutdown request rather than losing it.
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let executor = executor.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match work {
                Work::Plain(task) => executor.execute(&task).await,
                Work::Claimed(claim) => executor.execute_claim(&claim).await,
            };
        });
    }
    info!(worker_id, "Poll loop stopped");
}

async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}
