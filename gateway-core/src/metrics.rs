#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! process-wide statistics for the gateway
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGauge, register_int_counter_vec, register_int_gauge};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum Outcome {
        updated,
        migrated,
        not_found,
        valid,
        flushed,
        invalid,
        unavailable,
        error,
    }
    pub struct ResponseStats: IntCounter {
        "outcome" => Outcome
    }
}

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// server uptime
    pub static ref UPTIME: IntGauge =
        register_int_gauge!("uptime", "server uptime (seconds)").unwrap();

    pub static ref RESPONSE_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "gateway_responses",
        "gateway responses by outcome",
        &["outcome"]
    )
    .unwrap();

    /// aggregate count of responses by outcome
    pub static ref RESPONSE_COUNT: ResponseStats = ResponseStats::from(&RESPONSE_COUNT_VEC);
}

/// refresh `UPTIME` from `START_TIME`
pub fn update_uptime() {
    UPTIME.set(START_TIME.elapsed().as_secs() as i64);
}
