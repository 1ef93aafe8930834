//! Prometheus metrics for the asset cache and download engine, mirroring
//! this workspace's `pageserver::metrics` module: `Lazy` statics registered
//! at first access, `enum_map`-keyed vectors for per-reason counters.

use enum_map::{Enum, EnumMap};
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

use crate::error::RequesterErrorKind;

pub static DOWNLOADS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "asset_manager_downloads_started_total",
        "Number of artifact downloads started"
    )
    .expect("failed to register metric")
});

pub static DOWNLOADS_SUCCEEDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "asset_manager_downloads_succeeded_total",
        "Number of artifact downloads that reached LOADED"
    )
    .expect("failed to register metric")
});

pub static DOWNLOADS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "asset_manager_downloads_failed_total",
        "Number of artifact downloads that failed, by reason",
        &["reason"]
    )
    .expect("failed to register metric")
});

pub static EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "asset_manager_evictions_total",
        "Number of requesters deleted by free_up_space"
    )
    .expect("failed to register metric")
});

pub static BYTES_EVICTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "asset_manager_bytes_evicted_total",
        "Total bytes freed by eviction"
    )
    .expect("failed to register metric")
});

pub static UPDATE_NOTIFICATIONS_SENT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "asset_manager_update_notifications_sent_total",
        "Number of _Update property publications"
    )
    .expect("failed to register metric")
});

pub static UPDATE_NOTIFICATIONS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "asset_manager_update_notifications_accepted_total",
        "Number of updates accepted via handle_update"
    )
    .expect("failed to register metric")
});

pub static UPDATE_NOTIFICATIONS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "asset_manager_update_notifications_rejected_total",
        "Number of updates rejected, explicitly or by timeout"
    )
    .expect("failed to register metric")
});

pub static ALLOCATED_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "asset_manager_allocated_bytes",
        "Current allocated_bytes tracked by the storage manager"
    )
    .expect("failed to register metric")
});

/// Enum-mapped failure-reason counters, keyed the same way as
/// `LayerImplMetrics`'s `EnumMap`-backed counters in this workspace.
pub struct FailureReasonCounters {
    reasons: EnumMap<RequesterErrorKindKey, IntCounter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
enum RequesterErrorKindKey {
    ConnectionFailed,
    CheckFailed,
    NotFound,
    Unauthorized,
    Forbidden,
    ChecksumMismatch,
    UnpackFailure,
    InsufficientSpace,
    CatastrophicFailure,
}

impl RequesterErrorKindKey {
    fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection_failed",
            Self::CheckFailed => "check_failed",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::UnpackFailure => "unpack_failure",
            Self::InsufficientSpace => "insufficient_space",
            Self::CatastrophicFailure => "catastrophic_failure",
        }
    }

    fn from_kind(kind: RequesterErrorKind) -> Self {
        match kind {
            RequesterErrorKind::ConnectionFailed => Self::ConnectionFailed,
            RequesterErrorKind::CheckFailed => Self::CheckFailed,
            RequesterErrorKind::NotFound => Self::NotFound,
            RequesterErrorKind::Unauthorized => Self::Unauthorized,
            RequesterErrorKind::Forbidden => Self::Forbidden,
            RequesterErrorKind::ChecksumMismatch => Self::ChecksumMismatch,
            RequesterErrorKind::UnpackFailure => Self::UnpackFailure,
            RequesterErrorKind::InsufficientSpace => Self::InsufficientSpace,
            RequesterErrorKind::CatastrophicFailure => Self::CatastrophicFailure,
        }
    }
}

pub static DOWNLOAD_FAILURE_REASONS: Lazy<FailureReasonCounters> = Lazy::new(|| {
    let reasons = EnumMap::from_fn(|key: RequesterErrorKindKey| {
        DOWNLOADS_FAILED.with_label_values(&[key.as_str()])
    });
    FailureReasonCounters { reasons }
});

impl FailureReasonCounters {
    pub fn record(&self, kind: RequesterErrorKind) {
        self.reasons[RequesterErrorKindKey::from_kind(kind)].inc();
    }
}
