//! Keeping stored feeds in step with their upstream documents.
//!
//! - [`reconcile`] - merges a parsed snapshot into the store
//! - [`scheduler`] - periodic and manual refresh of one feed

pub mod reconcile;
pub mod scheduler;

pub use reconcile::{
    add_feed_by_url, reconcile, refresh_all, refresh_feed, ReconcileReport, RefreshError,
    RefreshResult, DEFAULT_REFRESH_CONCURRENCY,
};
pub use scheduler::{
    Lifecycle, RefreshEvent, RefreshScheduler, SchedulerState, Trigger, TriggerOutcome,
    DEFAULT_REFRESH_INTERVAL, MIN_REFRESH_INTERVAL,
};
