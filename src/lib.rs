//! Multi-tenant SIS roster synchronization core: reconciliation of
//! students, teachers, sections and terms; replay of upstream change
//! events; and bounded-concurrency fan-out across a district's schools.
//!
//! This crate owns the sync logic only. The upstream SIS client, the
//! per-school database connections, and the downstream "workshop" stored
//! procedure are all out of scope — callers implement the traits in
//! [`client`] and hand them to an [`orchestrator::SchoolOrchestrator`].

pub mod associations;
pub mod audit;
pub mod clock;
pub mod client;
pub mod config;
pub mod context;
pub mod events;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod protection;
pub mod reconcile;
pub mod store;
pub mod types;
pub mod validation;

pub use config::{SyncConfig, SyncConfigBuilder};
pub use context::{CancellationToken, ChannelProgressSink, NoopProgressSink, ProgressSink, SyncContext, SyncError};
pub use orchestrator::{DistrictOrchestrator, SchoolOrchestrator, SessionCleanupHook};
pub use types::{EventsSummary, KindCounts, ProgressSnapshot, SyncResult, SyncSummary};
