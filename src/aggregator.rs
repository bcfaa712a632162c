//! Conversion of a batch into per-account, per-quorum usage deltas.

use crate::batch::Batch;
use crate::error::{ErrorCode, MeterError};
use crate::params::{
    reservation_period_by_nanos, symbols_charged, AccountId, PaymentGlobalParams, QuorumId,
};
use std::collections::HashMap;

/// Usage to charge against one account's reservation in one quorum and period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsageUpdate {
    /// Paying account.
    pub account: AccountId,
    /// Quorum charged.
    pub quorum: QuorumId,
    /// Start second of the bin charged.
    pub period: u64,
    /// Quantized symbols charged.
    pub usage: u64,
}

/// Turns `batch` into usage deltas, summing entries that share an
/// `(account, quorum, period)` key. The returned order is unspecified.
pub fn aggregate(
    batch: &Batch,
    params: &PaymentGlobalParams,
) -> Result<Vec<UsageUpdate>, MeterError> {
    if batch.is_empty() {
        return Err(MeterError::new(
            ErrorCode::BatchEmpty,
            "batch contains no blob certificates",
        ));
    }

    let mut totals: HashMap<(AccountId, QuorumId, u64), u64> = HashMap::new();
    for (idx, cert) in batch.blob_certificates.iter().enumerate() {
        let header = cert.blob_header.as_ref().ok_or_else(|| {
            MeterError::new(
                ErrorCode::BlobHeaderNil,
                format!("blob certificate {idx} has no header"),
            )
        })?;
        let account = header.payment.account_id;
        for &quorum in &header.quorum_numbers {
            let config = params.quorum_config(quorum).ok_or_else(|| {
                MeterError::new(
                    ErrorCode::PaymentParamsFailed,
                    format!("no protocol config for quorum {quorum}"),
                )
                .with_account(account)
                .with_quorum(quorum)
            })?;
            if config.reservation_window == 0 {
                return Err(MeterError::new(
                    ErrorCode::PaymentParamsFailed,
                    format!("quorum {quorum} has a zero reservation window"),
                )
                .with_quorum(quorum));
            }
            let period =
                reservation_period_by_nanos(header.payment.timestamp, config.reservation_window);
            let charged = symbols_charged(header.length, config.min_num_symbols);
            let entry = totals.entry((account, quorum, period)).or_insert(0);
            *entry = entry.saturating_add(charged);
        }
    }

    Ok(totals
        .into_iter()
        .map(|((account, quorum, period), usage)| UsageUpdate {
            account,
            quorum,
            period,
            usage,
        })
        .collect())
}
