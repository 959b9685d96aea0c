//! Retention sweep: periodically prunes run metadata and artifact blobs on
//! independent timers (spec §9: 90 days for metadata, 14 for artifacts by
//! default). A run whose artifacts have already been pruned but whose
//! metadata row still exists is expected, not a consistency violation.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::StoreConfig;
use crate::store::Store;

pub struct RetentionSweeper {
    store: Store,
    artifacts: ArtifactStore,
    config: StoreConfig,
}

impl RetentionSweeper {
    pub fn new(store: Store, artifacts: ArtifactStore, config: StoreConfig) -> Self {
        Self { store, artifacts, config }
    }

    /// Runs the sweep once per hour until `shutdown` resolves. An hourly
    /// cadence is frequent enough relative to day-scale retention windows
    /// without adding meaningful load.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "retention sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("retention sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let artifact_cutoff = now - chrono::Duration::days(self.config.artifact_retention_days);
        let run_cutoff = now - chrono::Duration::days(self.config.run_retention_days);

        let stale_runs = self.store.run_ids_finished_before(artifact_cutoff).await?;
        let mut pruned_artifacts = 0u64;
        for (tenant_id, test_id, run_id) in stale_runs {
            self.artifacts.prune_run_dir(tenant_id, test_id, run_id).await?;
            pruned_artifacts += 1;
        }
        if pruned_artifacts > 0 {
            debug!(pruned_artifacts, "retention sweep pruned artifact directories");
        }

        let pruned_runs = self.store.prune_runs_older_than(run_cutoff).await?;
        if pruned_runs > 0 {
            info!(pruned_runs, "retention sweep pruned run metadata rows");
        }

        Ok(())
    }
}
