//! Fan-out Orchestrator: bounded-concurrency sync across every school
//! in a district, or every district. Concurrency is capped with a plain
//! `tokio::sync::Semaphore`, in the spirit of the resilience layer's
//! connection-limiter pattern, but without that type's stats or
//! disabled-mode extras — district fan-out only ever needs the permit.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use crate::context::{CancellationToken, NoopProgressSink, ProgressSink};
use crate::orchestrator::school::SchoolOrchestrator;
use crate::store::OrchestrationStore;
use crate::types::{ProgressSnapshot, SyncSummary};

pub struct DistrictOrchestrator {
    pub orchestration_store: Arc<dyn OrchestrationStore>,
    pub school_orchestrator: Arc<SchoolOrchestrator>,
    pub max_concurrent_schools: usize,
}

impl DistrictOrchestrator {
    pub async fn sync_all_districts(&self, force: bool, cancellation: CancellationToken) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let districts = match self.orchestration_store.list_districts().await {
            Ok(districts) => districts,
            Err(e) => {
                log::error!("failed to list districts: {e:#}");
                return summary;
            }
        };
        for district in districts {
            if cancellation.is_cancelled() {
                log::warn!("sync cancelled before starting district {}", district.district_id);
                break;
            }
            match self.sync_district(&district.district_id, force, cancellation.clone(), None).await {
                Ok(district_summary) => {
                    summary.total_schools += district_summary.total_schools;
                    summary.successful_schools += district_summary.successful_schools;
                    summary.failed_schools += district_summary.failed_schools;
                    summary.total_processed += district_summary.total_processed;
                    summary.total_failed += district_summary.total_failed;
                }
                Err(e) => {
                    log::error!("district {} sync failed: {e:#}", district.district_id);
                }
            }
        }
        summary
    }

    /// Runs every active school in `district_id` with at most
    /// `max_concurrent_schools` running at once. A single school's failure
    /// never stops its siblings — they are folded into that school's
    /// `SyncResult` by [`SchoolOrchestrator::sync_school`] instead.
    pub async fn sync_district(
        &self,
        district_id: &str,
        force: bool,
        cancellation: CancellationToken,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<SyncSummary> {
        let schools = self
            .orchestration_store
            .list_active_schools(district_id)
            .await
            .context("listing active schools")?;
        let total_schools = schools.len().max(1);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_schools.max(1)));
        let mut tasks = Vec::with_capacity(schools.len());

        for (index, school) in schools.into_iter().enumerate() {
            if cancellation.is_cancelled() {
                log::warn!("sync cancelled before starting school {}", school.school_id);
                break;
            }
            let semaphore = semaphore.clone();
            let school_orchestrator = self.school_orchestrator.clone();
            let school_cancellation = cancellation.clone();
            let school_progress: Arc<dyn ProgressSink> = match &progress {
                Some(sink) => Arc::new(RescaledProgressSink { inner: sink.clone(), index, total: total_schools }),
                None => Arc::new(NoopProgressSink),
            };

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                school_orchestrator
                    .sync_school(&school, force, school_progress, school_cancellation)
                    .await
            }));
        }

        let mut summary = SyncSummary::default();
        for task in tasks {
            match task.await {
                Ok(result) => summary.accumulate(&result),
                Err(e) => log::error!("school sync task panicked: {e}"),
            }
        }
        Ok(summary)
    }
}

/// Rescales one school's `0..100` progress into its `1/total` slice of the
/// district-level progress stream.
struct RescaledProgressSink {
    inner: Arc<dyn ProgressSink>,
    index: usize,
    total: usize,
}

impl ProgressSink for RescaledProgressSink {
    fn report(&self, snapshot: ProgressSnapshot) {
        let slice = 100.0 / self.total as f32;
        let base = self.index as f32 * slice;
        let percent = base + (snapshot.percent / 100.0) * slice;
        self.inner.report(ProgressSnapshot { percent, ..snapshot });
    }
}
