use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::config::{CleanupConfig, ms};
use crate::error::Result;
use crate::node::NodeRegistry;
use crate::queue::TaskQueue;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub index_size: usize,
    pub chunks: usize,
    pub scanned: usize,
    pub removed: usize,
}

/// Leader-side sweep of status index entries whose record has expired.
///
/// The paginated view prunes lazily, but entries nobody pages through would
/// pile up forever; this walks the index oldest first in fixed chunks once
/// it grows past `threshold`.
pub struct ActiveCleanup {
    queue: Arc<TaskQueue>,
    config: CleanupConfig,
}

impl ActiveCleanup {
    pub fn new(queue: Arc<TaskQueue>, config: CleanupConfig) -> Self {
        Self { queue, config }
    }

    /// One pass. `None` when the index is below the threshold.
    pub async fn sweep(&self) -> Result<Option<CleanupReport>> {
        let index_size = self.queue.total_status_count().await?;
        if index_size < self.config.threshold {
            return Ok(None);
        }

        let chunk = self.config.chunk_size.max(1);
        let mut report = CleanupReport {
            index_size,
            ..CleanupReport::default()
        };
        let mut cursor = 0;
        for _ in 0..self.config.max_chunks {
            let (scanned, removed) = self.queue.prune_range(cursor, cursor + chunk - 1).await?;
            if scanned == 0 {
                break;
            }
            report.chunks += 1;
            report.scanned += scanned;
            report.removed += removed;
            // Removed members shift the rest of the index down.
            cursor += scanned - removed;
            if scanned < chunk {
                break;
            }
        }
        Ok(Some(report))
    }

    pub fn spawn(self: Arc<Self>, registry: Arc<NodeRegistry>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ms(self.config.interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                if !registry.is_leader() {
                    continue;
                }
                match self.sweep().await {
                    Ok(Some(report)) if report.removed > 0 => info!(
                        index_size = report.index_size,
                        scanned = report.scanned,
                        removed = report.removed,
                        "Status index cleanup"
                    ),
                    Ok(Some(report)) => debug!(scanned = report.scanned, "Status index clean"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Status index cleanup failed"),
                }
            }
            debug!("Cleanup loop stopped");
        })
    }
}
