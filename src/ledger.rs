//! In-memory period records and the undo log used to apply them.
//!
//! Every account owns a small ring of [`PeriodRecord`]s per quorum. A slot is
//! addressed by `(period / window) % RING_SIZE`, so memory per account and
//! quorum stays fixed no matter how many periods elapse. Accounts live in a
//! sharded map; each account has its own lock, and a caller never holds more
//! than one account lock at a time.

use crate::error::{ErrorCode, MeterError};
use crate::params::{AccountId, QuorumId, ReservedPayment};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Number of period slots kept per account and quorum: the current period,
/// one period of overflow headroom, and one of clock-skew tolerance.
pub const RING_SIZE: usize = 3;

/// Usage recorded for the period currently occupying a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodRecord {
    /// Start second of the period held by the slot.
    pub index: u64,
    /// Symbols charged in that period.
    pub usage: u64,
}

type PeriodRing = [Option<PeriodRecord>; RING_SIZE];

/// Usage rings for one account, keyed by quorum.
#[derive(Debug, Default)]
pub struct AccountUsage {
    quorums: RwLock<HashMap<QuorumId, PeriodRing>>,
}

fn slot_index(period: u64, window: u64) -> usize {
    ((period / window) % RING_SIZE as u64) as usize
}

/// Process-wide registry of account usage.
#[derive(Debug, Default)]
pub struct UsageLedger {
    accounts: DashMap<AccountId, Arc<AccountUsage>>,
}

impl UsageLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the usage state for `account`, creating it on first reference.
    pub fn account(&self, account: AccountId) -> Arc<AccountUsage> {
        self.accounts.entry(account).or_default().value().clone()
    }

    /// Number of accounts that have been referenced so far.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Usage recorded for `(account, quorum, period)`; zero when the slot is
    /// empty or holds a different period.
    pub fn usage(&self, account: AccountId, quorum: QuorumId, period: u64, window: u64) -> u64 {
        if window == 0 {
            return 0;
        }
        let Some(state) = self.accounts.get(&account).map(|entry| entry.value().clone()) else {
            return 0;
        };
        let quorums = state.quorums.read();
        quorums
            .get(&quorum)
            .and_then(|ring| ring[slot_index(period, window)])
            .filter(|record| record.index == period)
            .map(|record| record.usage)
            .unwrap_or(0)
    }

    /// All populated records for `(account, quorum)`, ordered by period.
    pub fn records(&self, account: AccountId, quorum: QuorumId) -> Vec<PeriodRecord> {
        let Some(state) = self.accounts.get(&account).map(|entry| entry.value().clone()) else {
            return Vec::new();
        };
        let quorums = state.quorums.read();
        let mut records: Vec<PeriodRecord> = quorums
            .get(&quorum)
            .map(|ring| ring.iter().flatten().copied().collect())
            .unwrap_or_default();
        records.sort_by_key(|record| record.index);
        records
    }

    /// Starts a transaction whose mutations are undone unless committed.
    pub fn begin(&self) -> UsageTxn<'_> {
        UsageTxn {
            ledger: self,
            entries: Vec::new(),
        }
    }

    fn restore(&self, entry: &UndoEntry) {
        let state = self.account(entry.account);
        let mut quorums = state.quorums.write();
        let Some(ring) = quorums.get_mut(&entry.quorum) else {
            return;
        };
        let current = ring[entry.slot];
        match current {
            Some(record) if record.index == entry.period => ring[entry.slot] = entry.previous,
            current => debug!(
                account = %entry.account,
                quorum = entry.quorum,
                period = entry.period,
                slot_period = ?current.map(|r| r.index),
                "skipping rollback of a slot already taken by a newer period"
            ),
        }
    }
}

/// One mutated slot and the record it held before the mutation.
#[derive(Debug, Clone, Copy)]
struct UndoEntry {
    account: AccountId,
    quorum: QuorumId,
    slot: usize,
    period: u64,
    previous: Option<PeriodRecord>,
}

/// Undo log over a [`UsageLedger`].
///
/// Mutations are applied immediately; [`UsageTxn::rollback`] (or dropping the
/// transaction without [`UsageTxn::commit`]) replays the log in reverse,
/// re-acquiring each account lock individually.
#[derive(Debug)]
pub struct UsageTxn<'a> {
    ledger: &'a UsageLedger,
    entries: Vec<UndoEntry>,
}

impl UsageTxn<'_> {
    /// Number of slot mutations recorded so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing has been mutated.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps every mutation made through this transaction.
    pub fn commit(mut self) {
        self.entries.clear();
    }

    /// Undoes every mutation made through this transaction, newest first.
    pub fn rollback(&mut self) {
        if !self.entries.is_empty() {
            debug!(entries = self.entries.len(), "rolling back usage");
        }
        while let Some(entry) = self.entries.pop() {
            self.ledger.restore(&entry);
        }
    }

    /// Charges `delta` symbols to `(account, quorum, period)` under the
    /// account's write lock, borrowing at most one bin ahead.
    ///
    /// Returns the usage the period held before the charge. On error the
    /// ledger is left exactly as it was before the call.
    pub fn increment(
        &mut self,
        account: AccountId,
        quorum: QuorumId,
        period: u64,
        delta: u64,
        window: u64,
        reservation: &ReservedPayment,
    ) -> Result<u64, MeterError> {
        let fail = |code: ErrorCode, message: String| {
            MeterError::new(code, message)
                .with_account(account)
                .with_quorum(quorum)
        };
        if window == 0 {
            return Err(fail(
                ErrorCode::PaymentParamsFailed,
                "zero reservation window".to_string(),
            ));
        }

        let state = self.ledger.account(account);
        let mut quorums = state.quorums.write();
        let ring = quorums.entry(quorum).or_insert([None; RING_SIZE]);

        let bin_limit = reservation.bin_limit(window);
        let slot = slot_index(period, window);
        let before = ring[slot];
        let prev_usage = match before {
            Some(record) if record.index == period => record.usage,
            Some(record) if record.index > period => {
                return Err(fail(
                    ErrorCode::ReservationPeriodInvalid,
                    format!("period {period} superseded by period {}", record.index),
                ));
            }
            _ => 0,
        };
        let summed = prev_usage.checked_add(delta);
        let new_usage = summed.unwrap_or(u64::MAX);
        ring[slot] = Some(PeriodRecord {
            index: period,
            usage: new_usage,
        });

        if new_usage <= bin_limit {
            self.entries.push(UndoEntry {
                account,
                quorum,
                slot,
                period,
                previous: before,
            });
            return Ok(prev_usage);
        }

        if prev_usage >= bin_limit {
            ring[slot] = before;
            return Err(fail(
                ErrorCode::BinAlreadyFull,
                format!("bin for period {period} already holds {prev_usage} of {bin_limit}"),
            ));
        }

        if summed.is_none() || new_usage > bin_limit.saturating_mul(2) {
            ring[slot] = before;
            return Err(fail(
                ErrorCode::UsageExceedsLimit,
                format!("usage {delta} on top of {prev_usage} exceeds twice the bin limit {bin_limit}"),
            ));
        }

        let end_period = reservation.end_period(window);
        let next_period = match period.checked_add(window) {
            Some(next) if next < end_period => next,
            _ => {
                ring[slot] = before;
                return Err(fail(
                    ErrorCode::OverflowWindowLimit,
                    format!("overflow from period {period} would pass reservation end period {end_period}"),
                ));
            }
        };

        let overflow = new_usage - bin_limit;
        ring[slot] = Some(PeriodRecord {
            index: period,
            usage: bin_limit,
        });
        let next_slot = slot_index(next_period, window);
        let next_before = ring[next_slot];
        let next_prev = match next_before {
            Some(record) if record.index == next_period => record.usage,
            Some(record) if record.index > next_period => u64::MAX,
            _ => 0,
        };
        let next_usage = next_prev.saturating_add(overflow);
        if next_usage > bin_limit {
            ring[slot] = before;
            ring[next_slot] = next_before;
            return Err(fail(
                ErrorCode::OverflowPeriodLimit,
                format!("overflow of {overflow} would exceed the limit of period {next_period}"),
            ));
        }
        ring[next_slot] = Some(PeriodRecord {
            index: next_period,
            usage: next_usage,
        });

        self.entries.push(UndoEntry {
            account,
            quorum,
            slot,
            period,
            previous: before,
        });
        self.entries.push(UndoEntry {
            account,
            quorum,
            slot: next_slot,
            period: next_period,
            previous: next_before,
        });
        Ok(prev_usage)
    }
}

impl Drop for UsageTxn<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: u64 = 300;

    fn account(byte: u8) -> AccountId {
        AccountId::new([byte; 20])
    }

    fn reservation(rate: u64) -> ReservedPayment {
        ReservedPayment {
            symbols_per_second: rate,
            start_timestamp: 0,
            end_timestamp: 100_000,
        }
    }

    #[test]
    fn zero_rate_rejects_any_usage() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        let err = txn
            .increment(account(1), 0, 900, 1, WINDOW, &reservation(0))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BinAlreadyFull);
        assert_eq!(ledger.usage(account(1), 0, 900, WINDOW), 0);
    }

    #[test]
    fn exact_limit_commits() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        let prev = txn
            .increment(account(1), 0, 900, 300, WINDOW, &reservation(1))
            .unwrap();
        txn.commit();
        assert_eq!(prev, 0);
        assert_eq!(ledger.usage(account(1), 0, 900, WINDOW), 300);
    }

    #[test]
    fn full_bin_rejects_and_keeps_usage() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        txn.increment(account(1), 0, 900, 300, WINDOW, &reservation(1))
            .unwrap();
        let err = txn
            .increment(account(1), 0, 900, 2, WINDOW, &reservation(1))
            .unwrap_err();
        txn.commit();
        assert_eq!(err.code, ErrorCode::BinAlreadyFull);
        assert_eq!(ledger.usage(account(1), 0, 900, WINDOW), 300);
    }

    #[test]
    fn double_limit_spills_into_next_bin() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        txn.increment(account(1), 0, 900, 600, WINDOW, &reservation(1))
            .unwrap();
        assert_eq!(txn.len(), 2);
        txn.commit();
        assert_eq!(ledger.usage(account(1), 0, 900, WINDOW), 300);
        assert_eq!(ledger.usage(account(1), 0, 1_200, WINDOW), 300);
    }

    #[test]
    fn more_than_double_limit_is_rejected() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        let err = txn
            .increment(account(1), 0, 900, 601, WINDOW, &reservation(1))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UsageExceedsLimit);
        assert!(txn.is_empty());
        assert!(ledger.records(account(1), 0).is_empty());
    }

    #[test]
    fn overflow_past_reservation_end_is_rejected() {
        let ledger = UsageLedger::new();
        let short = ReservedPayment {
            symbols_per_second: 1,
            start_timestamp: 0,
            end_timestamp: 1_100,
        };
        let mut txn = ledger.begin();
        let err = txn
            .increment(account(1), 0, 900, 301, WINDOW, &short)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OverflowWindowLimit);
        assert!(ledger.records(account(1), 0).is_empty());
    }

    #[test]
    fn overflow_into_busy_bin_reverts_both() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        txn.increment(account(1), 0, 1_200, 250, WINDOW, &reservation(1))
            .unwrap();
        txn.increment(account(1), 0, 900, 200, WINDOW, &reservation(1))
            .unwrap();
        let err = txn
            .increment(account(1), 0, 900, 200, WINDOW, &reservation(1))
            .unwrap_err();
        txn.commit();
        assert_eq!(err.code, ErrorCode::OverflowPeriodLimit);
        assert_eq!(ledger.usage(account(1), 0, 900, WINDOW), 200);
        assert_eq!(ledger.usage(account(1), 0, 1_200, WINDOW), 250);
    }

    #[test]
    fn rollback_restores_exact_state() {
        let ledger = UsageLedger::new();
        let mut seed = ledger.begin();
        seed.increment(account(1), 0, 900, 100, WINDOW, &reservation(1))
            .unwrap();
        seed.commit();
        let before = ledger.records(account(1), 0);

        let mut txn = ledger.begin();
        txn.increment(account(1), 0, 900, 400, WINDOW, &reservation(1))
            .unwrap();
        txn.increment(account(1), 0, 1_200, 50, WINDOW, &reservation(1))
            .unwrap();
        txn.increment(account(2), 1, 900, 10, WINDOW, &reservation(1))
            .unwrap();
        txn.rollback();

        assert_eq!(ledger.records(account(1), 0), before);
        assert!(ledger.records(account(2), 1).is_empty());
    }

    #[test]
    fn dropping_uncommitted_txn_rolls_back() {
        let ledger = UsageLedger::new();
        {
            let mut txn = ledger.begin();
            txn.increment(account(1), 0, 900, 10, WINDOW, &reservation(1))
                .unwrap();
        }
        assert_eq!(ledger.usage(account(1), 0, 900, WINDOW), 0);
    }

    #[test]
    fn ring_keeps_only_ring_size_periods() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        for step in 0..=RING_SIZE as u64 {
            txn.increment(account(1), 0, step * WINDOW, 5, WINDOW, &reservation(1))
                .unwrap();
        }
        txn.commit();
        let records = ledger.records(account(1), 0);
        assert_eq!(records.len(), RING_SIZE);
        assert_eq!(records[0].index, WINDOW);
        assert_eq!(ledger.usage(account(1), 0, 0, WINDOW), 0);
        assert_eq!(ledger.usage(account(1), 0, RING_SIZE as u64 * WINDOW, WINDOW), 5);
    }

    #[test]
    fn superseded_period_is_rejected() {
        let ledger = UsageLedger::new();
        let mut txn = ledger.begin();
        txn.increment(account(1), 0, RING_SIZE as u64 * WINDOW, 5, WINDOW, &reservation(1))
            .unwrap();
        let err = txn
            .increment(account(1), 0, 0, 5, WINDOW, &reservation(1))
            .unwrap_err();
        txn.commit();
        assert_eq!(err.code, ErrorCode::ReservationPeriodInvalid);
        assert_eq!(ledger.usage(account(1), 0, RING_SIZE as u64 * WINDOW, WINDOW), 5);
    }

    proptest! {
        #[test]
        fn committed_bins_never_exceed_limit(
            rate in 0u64..8,
            charges in proptest::collection::vec((0u64..4, 1u64..5_000), 1..40),
        ) {
            let ledger = UsageLedger::new();
            let reservation = reservation(rate);
            let limit = reservation.bin_limit(WINDOW);
            let mut txn = ledger.begin();
            for (step, delta) in charges {
                let _ = txn.increment(account(1), 0, step * WINDOW, delta, WINDOW, &reservation);
            }
            txn.commit();
            for record in ledger.records(account(1), 0) {
                prop_assert!(record.usage <= limit);
            }
        }
    }
}
