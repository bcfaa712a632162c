//! Error taxonomy surfaced by metering.

use crate::params::{AccountId, QuorumId};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Stable classification of a metering failure, suitable as a log or metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The batch carried no blob certificates.
    BatchEmpty,
    /// A blob certificate had no header.
    BlobHeaderNil,
    /// Global payment parameters were unavailable or incomplete.
    PaymentParamsFailed,
    /// The reservation lookup failed or was cancelled.
    ReservationLookupFailed,
    /// No reservation exists for the account in the quorum.
    ReservationNotFound,
    /// The reservation is not active at the receive time.
    ReservationInactive,
    /// The requested period is not admissible at the receive time.
    ReservationPeriodInvalid,
    /// The bin was already saturated before the update.
    BinAlreadyFull,
    /// The update exceeds twice the bin limit.
    UsageExceedsLimit,
    /// The overflow would land past the reservation's last period.
    OverflowWindowLimit,
    /// The overflow would saturate the next bin.
    OverflowPeriodLimit,
}

impl ErrorCode {
    /// Snake-case label for the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchEmpty => "batch_empty",
            Self::BlobHeaderNil => "blob_header_nil",
            Self::PaymentParamsFailed => "payment_params_failed",
            Self::ReservationLookupFailed => "reservation_lookup_failed",
            Self::ReservationNotFound => "reservation_not_found",
            Self::ReservationInactive => "reservation_inactive",
            Self::ReservationPeriodInvalid => "reservation_period_invalid",
            Self::BinAlreadyFull => "bin_already_full",
            Self::UsageExceedsLimit => "usage_exceeds_limit",
            Self::OverflowWindowLimit => "overflow_window_limit",
            Self::OverflowPeriodLimit => "overflow_period_limit",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by batch metering.
///
/// Every failure is returned only after all usage committed by the failing
/// call has been rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct MeterError {
    /// Classification of the failure.
    pub code: ErrorCode,
    /// Human readable detail.
    pub message: String,
    /// Offending account, when known.
    pub account: Option<AccountId>,
    /// Offending quorum, when known.
    pub quorum: Option<QuorumId>,
}

impl MeterError {
    /// Builds an error without account context.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            account: None,
            quorum: None,
        }
    }

    /// Attaches the offending account.
    pub fn with_account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }

    /// Attaches the offending quorum.
    pub fn with_quorum(mut self, quorum: QuorumId) -> Self {
        self.quorum = Some(quorum);
        self
    }
}

/// Failure reported by a [`PaymentParamsProvider`](crate::PaymentParamsProvider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The backing chain or cache could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// Filesystem failure while reading provider state.
    #[error("provider io error: {0}")]
    Io(String),
    /// Provider state could not be decoded.
    #[error("provider decode error: {0}")]
    Decode(String),
}
