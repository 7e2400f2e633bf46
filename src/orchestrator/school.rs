//! Mode Decider & School Orchestrator: chooses Full vs Incremental for one
//! school, runs the reconcilers in the required order, and folds every
//! error into the returned `SyncResult` rather than propagating it —
//! cancellation included.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::associations::AssociationsSync;
use crate::audit::ChangeAuditBuffer;
use crate::client::{ConnectionFactory, DownstreamProcedure, SisClient};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::context::{CancellationToken, ProgressSink, SyncContext, SyncError};
use crate::events::EventProcessor;
use crate::history;
use crate::model::{AttemptStatus, EntityKind, School, SyncAttempt, SyncMode, WarningKind, WarningRow};
use crate::protection::ProtectionTracker;
use crate::reconcile::{SectionReconciler, StudentReconciler, TeacherReconciler, TermReconciler};
use crate::store::OrchestrationStore;
use crate::types::{EventsSummary, KindCounts, ProgressSnapshot, SyncResult};

/// Optional post-sync hook; a failure here is logged and never fails the
/// sync.
#[async_trait]
pub trait SessionCleanupHook: Send + Sync {
    async fn cleanup(&self, school: &School) -> Result<()>;
}

pub struct SchoolOrchestrator {
    pub sis_client: Arc<dyn SisClient>,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub orchestration_store: Arc<dyn OrchestrationStore>,
    pub downstream: Arc<dyn DownstreamProcedure>,
    pub clock: Arc<dyn Clock>,
    pub session_cleanup: Option<Arc<dyn SessionCleanupHook>>,
    pub config: SyncConfig,
}

impl SchoolOrchestrator {
    /// Never returns `Err` — every failure, cancellation included, is
    /// folded into the returned `SyncResult`.
    pub async fn sync_school(
        &self,
        school: &School,
        force: bool,
        progress: Arc<dyn ProgressSink>,
        cancellation: CancellationToken,
    ) -> SyncResult {
        let started_at = self.clock.now();
        let fut = self.sync_school_inner(school, force, progress, cancellation, started_at);
        let outcome = match self.config.per_attempt_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::Error::new(SyncError::Cancelled).context("per-attempt timeout elapsed")),
            },
            None => fut.await,
        };

        if let Some(hook) = &self.session_cleanup {
            if let Err(e) = hook.cleanup(school).await {
                log::warn!("session cleanup failed for school {}: {e:#}", school.school_id);
            }
        }

        match outcome {
            Ok(result) => result,
            Err(e) => {
                log::error!("school {} sync failed: {e:#}", school.school_id);
                SyncResult {
                    school_id: school.school_id.clone(),
                    school_name: school.name.clone(),
                    success: false,
                    error_message: Some(format!("{e:#}")),
                    mode: SyncMode::Full,
                    per_kind: HashMap::new(),
                    warnings: Vec::new(),
                    events_summary: None,
                    started_at,
                    ended_at: self.clock.now(),
                }
            }
        }
    }

    async fn sync_school_inner(
        &self,
        school: &School,
        force: bool,
        progress: Arc<dyn ProgressSink>,
        cancellation: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> Result<SyncResult> {
        check_cancelled(&cancellation)?;

        let local_store = self
            .connection_factory
            .open_school_store(school)
            .await
            .context("opening school store")?
            .into();
        let protection = ProtectionTracker::load(&*local_store)
            .await
            .context("loading protection tracker")?;

        let ctx = SyncContext {
            school: school.clone(),
            local_store,
            orchestration_store: self.orchestration_store.clone(),
            clock: self.clock.clone(),
            progress,
            cancellation,
            attempt_start_time: started_at,
            cursor: None,
            protection: Mutex::new(protection),
        };

        let latest_baseline = self
            .orchestration_store
            .latest_successful_attempt(&school.school_id, EntityKind::Baseline)
            .await
            .context("loading latest baseline attempt")?;

        let mode = if force || school.requires_full_sync || latest_baseline.is_none() {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        };
        log::info!("school {} starting {} sync", school.school_id, mode.as_str());

        let (per_kind, warnings, events_summary) = match mode {
            SyncMode::Full => self.run_full_sync(&ctx).await?,
            SyncMode::Incremental => self.run_incremental_sync(&ctx, latest_baseline.as_ref()).await?,
        };

        log::info!("school {} finished {} sync", school.school_id, mode.as_str());

        Ok(SyncResult {
            school_id: school.school_id.clone(),
            school_name: school.name.clone(),
            success: true,
            error_message: None,
            mode,
            per_kind,
            warnings,
            events_summary,
            started_at,
            ended_at: ctx.now(),
        })
    }

    async fn run_full_sync(
        &self,
        ctx: &SyncContext,
    ) -> Result<(HashMap<EntityKind, KindCounts>, Vec<WarningRow>, Option<EventsSummary>)> {
        let mut audit = ChangeAuditBuffer::new();
        let mut per_kind = HashMap::new();

        per_kind.insert(
            EntityKind::Student,
            self.sync_students(ctx, &mut audit, SyncMode::Full, None, true).await?,
        );
        per_kind.insert(
            EntityKind::Teacher,
            self.sync_teachers(ctx, &mut audit, SyncMode::Full, None, true).await?,
        );
        let (section_counts, section_attempt_id) = self.sync_sections(ctx, &mut audit).await?;
        per_kind.insert(EntityKind::Section, section_counts.clone());
        per_kind.insert(EntityKind::Term, self.sync_terms(ctx, &mut audit).await?);

        audit.flush(ctx.orchestration_store.as_ref()).await;

        let latest_event_id = self
            .sis_client
            .latest_event_id(&ctx.school.upstream_school_id)
            .await
            .context("fetching latest upstream event id")?;
        let mut baseline = history::begin_attempt(
            ctx.orchestration_store.as_ref(),
            &ctx.school.school_id,
            EntityKind::Baseline,
            SyncMode::Full,
            ctx.attempt_start_time,
        )
        .await?;
        baseline.cursor = latest_event_id;
        baseline.cursor_timestamp = Some(ctx.now());
        baseline.last_known_sync_point = Some(ctx.attempt_start_time);
        let baseline_summary = serde_json::to_value(&per_kind).context("serializing baseline summary")?;
        history::finish_attempt(
            ctx.orchestration_store.as_ref(),
            baseline,
            AttemptStatus::Success,
            Some(baseline_summary),
            ctx.now(),
        )
        .await?;
        log::info!("school {} wrote baseline cursor", ctx.school.school_id);

        let mut warnings = ctx
            .orchestration_store
            .list_warnings_for_attempt(&section_attempt_id)
            .await
            .context("loading section warnings")?;

        let enrollment_changed = ctx.protection.lock().await.enrollment_changed();
        if enrollment_changed || section_counts.updated > 0 {
            self.invoke_downstream(ctx, &section_attempt_id, enrollment_changed, &mut warnings)
                .await;
        }

        ctx.orchestration_store
            .clear_requires_full_sync(&ctx.school.school_id)
            .await
            .context("clearing requiresFullSync")?;

        Ok((per_kind, warnings, None))
    }

    async fn run_incremental_sync(
        &self,
        ctx: &SyncContext,
        latest_baseline: Option<&SyncAttempt>,
    ) -> Result<(HashMap<EntityKind, KindCounts>, Vec<WarningRow>, Option<EventsSummary>)> {
        let latest_event = ctx
            .orchestration_store
            .latest_successful_attempt(&ctx.school.school_id, EntityKind::Event)
            .await
            .context("loading latest event attempt")?;

        let cursor_source = match (&latest_event, latest_baseline) {
            (Some(e), Some(b)) if e.started_at >= b.started_at => Some(e),
            (Some(e), None) => Some(e),
            (_, Some(b)) => Some(b),
            (None, None) => None,
        };
        let cursor = cursor_source.and_then(|a| a.cursor.clone()).filter(|c| !c.is_empty());
        let last_known_sync_point = cursor_source.and_then(|a| a.last_known_sync_point);

        let Some(cursor) = cursor else {
            return self.run_incremental_fallback(ctx, last_known_sync_point).await;
        };

        check_cancelled(&ctx.cancellation)?;

        let mut audit = ChangeAuditBuffer::new();
        let attempt = history::begin_attempt(
            ctx.orchestration_store.as_ref(),
            &ctx.school.school_id,
            EntityKind::Event,
            SyncMode::Incremental,
            ctx.attempt_start_time,
        )
        .await?;
        let attempt_id = attempt.attempt_id.clone();

        let events = self
            .sis_client
            .list_events(&ctx.school.upstream_school_id, Some(&cursor), self.config.incremental_event_page_size)
            .await
            .context("listing events")?;
        log::debug!("school {} fetched {} event(s) after cursor {cursor}", ctx.school.school_id, events.len());

        let (dispatch, last_success) = EventProcessor
            .process_batch(ctx, &attempt_id, &mut audit, &events)
            .await
            .context("dispatching event batch")?;

        audit.flush(ctx.orchestration_store.as_ref()).await;

        let mut attempt = attempt;
        let final_cursor = if dispatch.processed > 0 {
            let (id, _) = last_success.expect("processed > 0 implies a last successful event");
            Some(id)
        } else if !events.is_empty() {
            let last_fetched = events.last().expect("events non-empty").id.clone();
            attempt.error_message = Some(format!("{} of {} events failed", dispatch.failed, events.len()));
            Some(last_fetched)
        } else {
            Some(cursor.clone())
        };
        let status = if dispatch.processed > 0 || events.is_empty() {
            AttemptStatus::Success
        } else {
            AttemptStatus::Partial
        };
        attempt.cursor = final_cursor.clone();
        attempt.cursor_timestamp = Some(ctx.now());
        attempt.last_known_sync_point = Some(ctx.attempt_start_time);
        attempt.records_processed = events.len() as i64;
        attempt.records_updated = dispatch.processed;
        attempt.records_failed = dispatch.failed;
        let event_summary = EventsSummary {
            fetched: events.len() as i64,
            processed: dispatch.processed,
            failed: dispatch.failed,
            skipped: dispatch.skipped,
            final_cursor: final_cursor.clone(),
        };
        let summary_blob = serde_json::to_value(&event_summary).context("serializing event summary")?;
        history::finish_attempt(ctx.orchestration_store.as_ref(), attempt, status, Some(summary_blob), ctx.now())
            .await?;

        let mut warnings = ctx
            .orchestration_store
            .list_warnings_for_attempt(&attempt_id)
            .await
            .context("loading event attempt warnings")?;

        let enrollment_changed = ctx.protection.lock().await.enrollment_changed();
        if enrollment_changed {
            self.invoke_downstream(ctx, &attempt_id, enrollment_changed, &mut warnings).await;
        }

        let mut per_kind = HashMap::new();
        per_kind.insert(
            EntityKind::Event,
            KindCounts {
                processed: events.len() as i64,
                updated: dispatch.processed,
                failed: dispatch.failed,
                deleted: 0,
            },
        );

        Ok((per_kind, warnings, Some(event_summary)))
    }

    /// Time-filtered Student+Teacher reconcile, no orphan pass, used when a
    /// school has never established a replay cursor. The
    /// `legacy-full-sync-fallback` feature switches to skipping incremental
    /// entirely and running a full sync instead.
    async fn run_incremental_fallback(
        &self,
        ctx: &SyncContext,
        last_known_sync_point: Option<DateTime<Utc>>,
    ) -> Result<(HashMap<EntityKind, KindCounts>, Vec<WarningRow>, Option<EventsSummary>)> {
        #[cfg(feature = "legacy-full-sync-fallback")]
        {
            log::info!(
                "school {} has no replay cursor; legacy-full-sync-fallback is enabled, running a full sync instead",
                ctx.school.school_id
            );
            return self.run_full_sync(ctx).await;
        }

        #[cfg(not(feature = "legacy-full-sync-fallback"))]
        {
            log::info!(
                "school {} has no replay cursor; falling back to a time-filtered student+teacher reconcile",
                ctx.school.school_id
            );
            let mut audit = ChangeAuditBuffer::new();
            let mut per_kind = HashMap::new();
            per_kind.insert(
                EntityKind::Student,
                self.sync_students(ctx, &mut audit, SyncMode::Incremental, last_known_sync_point, false)
                    .await?,
            );
            per_kind.insert(
                EntityKind::Teacher,
                self.sync_teachers(ctx, &mut audit, SyncMode::Incremental, last_known_sync_point, false)
                    .await?,
            );
            audit.flush(ctx.orchestration_store.as_ref()).await;
            Ok((per_kind, Vec::new(), None))
        }
    }

    async fn sync_students(
        &self,
        ctx: &SyncContext,
        audit: &mut ChangeAuditBuffer,
        mode: SyncMode,
        modified_since: Option<DateTime<Utc>>,
        detect_orphans: bool,
    ) -> Result<KindCounts> {
        check_cancelled(&ctx.cancellation)?;
        let attempt = history::begin_attempt(
            ctx.orchestration_store.as_ref(),
            &ctx.school.school_id,
            EntityKind::Student,
            mode,
            ctx.attempt_start_time,
        )
        .await?;
        let attempt_id = attempt.attempt_id.clone();
        let mut counts = KindCounts::default();
        let records = self
            .sis_client
            .list_students(&ctx.school.upstream_school_id, modified_since)
            .await
            .context("listing students")?;
        for (i, record) in records.iter().enumerate() {
            counts.processed += 1;
            match StudentReconciler.upsert_one(ctx, &attempt_id, audit, record).await {
                Ok(true) => counts.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("student {} failed to reconcile: {e:#}", record.id);
                    counts.failed += 1;
                }
            }
            if (i + 1) % self.config.progress_report_every == 0 {
                self.report_progress(ctx, "students", i + 1, records.len());
            }
        }
        if detect_orphans {
            let orphaned = StudentReconciler
                .detect_orphans(ctx, &attempt_id, audit)
                .await
                .context("detecting student orphans")?;
            counts.deleted += orphaned as i64;
        }
        log::debug!("school {} students: {counts:?}", ctx.school.school_id);
        let mut attempt = attempt;
        attempt.records_processed = counts.processed;
        attempt.records_updated = counts.updated;
        attempt.records_failed = counts.failed;
        let summary_blob = serde_json::to_value(&counts).context("serializing student summary")?;
        history::finish_attempt(
            ctx.orchestration_store.as_ref(),
            attempt,
            Self::attempt_status(&counts),
            Some(summary_blob),
            ctx.now(),
        )
        .await?;
        Ok(counts)
    }

    async fn sync_teachers(
        &self,
        ctx: &SyncContext,
        audit: &mut ChangeAuditBuffer,
        mode: SyncMode,
        modified_since: Option<DateTime<Utc>>,
        detect_orphans: bool,
    ) -> Result<KindCounts> {
        check_cancelled(&ctx.cancellation)?;
        let attempt = history::begin_attempt(
            ctx.orchestration_store.as_ref(),
            &ctx.school.school_id,
            EntityKind::Teacher,
            mode,
            ctx.attempt_start_time,
        )
        .await?;
        let attempt_id = attempt.attempt_id.clone();
        let mut counts = KindCounts::default();
        let records = self
            .sis_client
            .list_teachers(&ctx.school.upstream_school_id, modified_since)
            .await
            .context("listing teachers")?;
        for (i, record) in records.iter().enumerate() {
            counts.processed += 1;
            match TeacherReconciler.upsert_one(ctx, &attempt_id, audit, record).await {
                Ok(true) => counts.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("teacher {} failed to reconcile: {e:#}", record.id);
                    counts.failed += 1;
                }
            }
            if (i + 1) % self.config.progress_report_every == 0 {
                self.report_progress(ctx, "teachers", i + 1, records.len());
            }
        }
        if detect_orphans {
            let orphaned = TeacherReconciler
                .detect_orphans(ctx, &attempt_id, audit)
                .await
                .context("detecting teacher orphans")?;
            counts.deleted += orphaned as i64;
        }
        log::debug!("school {} teachers: {counts:?}", ctx.school.school_id);
        let mut attempt = attempt;
        attempt.records_processed = counts.processed;
        attempt.records_updated = counts.updated;
        attempt.records_failed = counts.failed;
        let summary_blob = serde_json::to_value(&counts).context("serializing teacher summary")?;
        history::finish_attempt(
            ctx.orchestration_store.as_ref(),
            attempt,
            Self::attempt_status(&counts),
            Some(summary_blob),
            ctx.now(),
        )
        .await?;
        Ok(counts)
    }

    async fn sync_sections(&self, ctx: &SyncContext, audit: &mut ChangeAuditBuffer) -> Result<(KindCounts, String)> {
        check_cancelled(&ctx.cancellation)?;
        let attempt = history::begin_attempt(
            ctx.orchestration_store.as_ref(),
            &ctx.school.school_id,
            EntityKind::Section,
            SyncMode::Full,
            ctx.attempt_start_time,
        )
        .await?;
        let attempt_id = attempt.attempt_id.clone();
        let mut counts = KindCounts::default();
        let records = self
            .sis_client
            .list_sections(&ctx.school.upstream_school_id, None)
            .await
            .context("listing sections")?;
        for (i, record) in records.iter().enumerate() {
            counts.processed += 1;
            let result: Result<bool> = async {
                let changed = SectionReconciler.upsert_one(ctx, &attempt_id, audit, record).await?;
                let section = ctx
                    .local_store
                    .find_section_by_upstream_id(&record.id)
                    .await?
                    .context("section vanished immediately after upsert")?;
                AssociationsSync.sync(ctx, &section.id, record).await?;
                Ok(changed)
            }
            .await;
            match result {
                Ok(true) => counts.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("section {} failed to reconcile: {e:#}", record.id);
                    counts.failed += 1;
                }
            }
            if (i + 1) % self.config.progress_report_every == 0 {
                self.report_progress(ctx, "sections", i + 1, records.len());
            }
        }
        let (orphaned, skipped_protected) = SectionReconciler
            .soft_delete_absent_with_protection(ctx, &attempt_id, audit)
            .await
            .context("detecting absent sections")?;
        counts.deleted += orphaned as i64;
        if skipped_protected > 0 {
            log::info!(
                "{skipped_protected} protected section(s) skipped during absence scan for school {}",
                ctx.school.school_id
            );
        }
        log::debug!("school {} sections: {counts:?}", ctx.school.school_id);
        let mut attempt = attempt;
        attempt.records_processed = counts.processed;
        attempt.records_updated = counts.updated;
        attempt.records_failed = counts.failed;
        let summary_blob = serde_json::to_value(&counts).context("serializing section summary")?;
        history::finish_attempt(
            ctx.orchestration_store.as_ref(),
            attempt,
            Self::attempt_status(&counts),
            Some(summary_blob),
            ctx.now(),
        )
        .await?;
        Ok((counts, attempt_id))
    }

    async fn sync_terms(&self, ctx: &SyncContext, audit: &mut ChangeAuditBuffer) -> Result<KindCounts> {
        check_cancelled(&ctx.cancellation)?;
        let attempt = history::begin_attempt(
            ctx.orchestration_store.as_ref(),
            &ctx.school.school_id,
            EntityKind::Term,
            SyncMode::Full,
            ctx.attempt_start_time,
        )
        .await?;
        let attempt_id = attempt.attempt_id.clone();
        let mut counts = KindCounts::default();
        let records = self
            .sis_client
            .list_terms(&ctx.school.upstream_school_id, None)
            .await
            .context("listing terms")?;
        for (i, record) in records.iter().enumerate() {
            counts.processed += 1;
            match TermReconciler.upsert_one(ctx, &attempt_id, audit, record).await {
                Ok(true) => counts.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("term {} failed to reconcile: {e:#}", record.id);
                    counts.failed += 1;
                }
            }
            if (i + 1) % self.config.progress_report_every == 0 {
                self.report_progress(ctx, "terms", i + 1, records.len());
            }
        }
        let orphaned = TermReconciler
            .detect_orphans(ctx, &attempt_id, audit)
            .await
            .context("detecting term orphans")?;
        counts.deleted += orphaned as i64;
        log::debug!("school {} terms: {counts:?}", ctx.school.school_id);
        let mut attempt = attempt;
        attempt.records_processed = counts.processed;
        attempt.records_updated = counts.updated;
        attempt.records_failed = counts.failed;
        let summary_blob = serde_json::to_value(&counts).context("serializing term summary")?;
        history::finish_attempt(
            ctx.orchestration_store.as_ref(),
            attempt,
            Self::attempt_status(&counts),
            Some(summary_blob),
            ctx.now(),
        )
        .await?;
        Ok(counts)
    }

    async fn invoke_downstream(
        &self,
        ctx: &SyncContext,
        attempt_id: &str,
        enrollment_changed: bool,
        warnings: &mut Vec<WarningRow>,
    ) {
        let outcome = self.downstream.run(ctx.local_store.as_ref(), attempt_id, enrollment_changed).await;
        let failure_message = match outcome {
            Ok(outcome) if outcome.success || outcome.skipped => None,
            Ok(outcome) => Some(outcome.error.unwrap_or_else(|| "downstream procedure reported failure".into())),
            Err(e) => Some(format!("{e:#}")),
        };
        let Some(message) = failure_message else {
            log::info!("downstream procedure completed for attempt {attempt_id}");
            return;
        };
        log::warn!("downstream procedure failed for attempt {attempt_id}: {message}");
        let warning = Self::downstream_failure_warning(attempt_id, message, ctx.now());
        if let Err(e) = ctx.orchestration_store.insert_warning(&warning).await {
            log::warn!("failed to persist downstream failure warning: {e:#}");
        }
        warnings.push(warning);
    }

    fn downstream_failure_warning(attempt_id: &str, message: String, at: DateTime<Utc>) -> WarningRow {
        WarningRow {
            warning_id: Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            kind: WarningKind::DownstreamSyncFailed,
            entity_kind: EntityKind::Section,
            entity_id: String::new(),
            upstream_entity_id: String::new(),
            display_name: "downstream procedure".to_string(),
            message,
            affected_protected_refs_json: serde_json::json!([]),
            affected_protected_count: 0,
            acknowledged: false,
            created_at: at,
        }
    }

    fn report_progress(&self, ctx: &SyncContext, operation: &str, done: usize, total: usize) {
        let percent = if total == 0 { 100.0 } else { (done as f32 / total as f32) * 100.0 };
        ctx.report_progress(ProgressSnapshot {
            school_id: ctx.school.school_id.clone(),
            percent,
            operation: operation.to_string(),
            per_kind_counts: HashMap::new(),
        });
    }

    fn attempt_status(counts: &KindCounts) -> AttemptStatus {
        if counts.failed > 0 && counts.failed >= counts.processed {
            AttemptStatus::Failed
        } else if counts.failed > 0 {
            AttemptStatus::Partial
        } else {
            AttemptStatus::Success
        }
    }
}

fn check_cancelled(cancellation: &CancellationToken) -> Result<()> {
    if cancellation.is_cancelled() {
        return Err(anyhow::Error::new(SyncError::Cancelled));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_status_all_success() {
        let counts = KindCounts { processed: 10, updated: 2, failed: 0, deleted: 0 };
        assert_eq!(SchoolOrchestrator::attempt_status(&counts), AttemptStatus::Success);
    }

    #[test]
    fn attempt_status_partial_on_some_failures() {
        let counts = KindCounts { processed: 10, updated: 2, failed: 3, deleted: 0 };
        assert_eq!(SchoolOrchestrator::attempt_status(&counts), AttemptStatus::Partial);
    }

    #[test]
    fn attempt_status_failed_when_everything_fails() {
        let counts = KindCounts { processed: 5, updated: 0, failed: 5, deleted: 0 };
        assert_eq!(SchoolOrchestrator::attempt_status(&counts), AttemptStatus::Failed);
    }
}
