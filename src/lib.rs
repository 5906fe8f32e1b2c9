//! Core of a pull-based RSS/Atom reader: fetch, parse, reconcile into a
//! transactional store, and refresh on a schedule.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
