//! Lease registry metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
//! Submission, not-found and flush counts are labelled by service; migrations
//! are labelled by the replica the client moved *to*.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

lazy_static! {
    /// Count of applied lease submissions, refreshes and migrations alike
    pub static ref LEASE_UPDATES: IntCounterVec = register_int_counter_vec!(
        "lease_updates",
        "client lease updates",
        &["service"]
    ).unwrap();

    /// Count of submissions that moved a client onto this replica
    pub static ref LEASE_MIGRATIONS: IntCounterVec = register_int_counter_vec!(
        "lease_migrations",
        "client migrations to this replica",
        &["replica"]
    ).unwrap();

    /// Count of submissions with no matching signed credential
    pub static ref LEASE_NOT_FOUND: IntCounterVec = register_int_counter_vec!(
        "lease_not_found",
        "lease submissions for unknown or unsigned credentials",
        &["service"]
    ).unwrap();

    /// Count of ownership flushes, including ones that matched nothing
    pub static ref LEASE_FLUSHES: IntCounterVec = register_int_counter_vec!(
        "lease_flushes",
        "client lease flushes",
        &["service"]
    ).unwrap();

    /// Count of store calls that failed or timed out
    pub static ref LEASE_STORE_ERRORS: IntCounter = register_int_counter!(
        "lease_store_errors",
        "credential store calls that failed or timed out"
    ).unwrap();
}
