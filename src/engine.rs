//! Batch admission against per-account reservations.

use crate::aggregator::{aggregate, UsageUpdate};
use crate::batch::Batch;
use crate::config::{ConfigError, MeterConfig};
use crate::error::{ErrorCode, MeterError};
use crate::ledger::{UsageLedger, UsageTxn};
use crate::params::{reservation_period, AccountId, PaymentGlobalParams, QuorumId, ReservedPayment};
use crate::provider::PaymentParamsProvider;
use crate::refresher::spawn_refresher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cancellation signal for a metering call; the call is cancelled once the
/// channel holds `true`.
pub type CancelSignal = watch::Receiver<bool>;

/// A signal that never fires.
pub fn uncancellable() -> CancelSignal {
    let (_tx, rx) = watch::channel(false);
    rx
}

async fn cancelled(mut signal: CancelSignal) {
    loop {
        let fired = *signal.borrow_and_update();
        if fired {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn unix_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Returns true when `period` may be charged at `now`: it must be the current
/// or the previous period, and lie inside the reservation's periods.
pub fn is_valid_reservation_period(
    reservation: &ReservedPayment,
    period: u64,
    now: u64,
    window: u64,
) -> bool {
    let current = reservation_period(now, window);
    let is_recent = period == current || current.checked_sub(window) == Some(period);
    let within_reservation =
        reservation.start_period(window) <= period && period < reservation.end_period(window);
    is_recent && within_reservation
}

/// Reservation meter for a validator node.
///
/// `meter_batch` may be called concurrently for distinct batches. Each call
/// either charges every update of the batch or leaves usage untouched.
pub struct Meterer {
    config: MeterConfig,
    provider: Arc<dyn PaymentParamsProvider>,
    ledger: UsageLedger,
    refresher_started: AtomicBool,
}

impl Meterer {
    /// Builds a meter over `provider` with empty usage.
    pub fn new(
        config: MeterConfig,
        provider: Arc<dyn PaymentParamsProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            ledger: UsageLedger::new(),
            refresher_started: AtomicBool::new(false),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Usage recorded so far.
    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Spawns the background refresher. Returns `None` if this meter already
    /// started one.
    pub fn start_refresher(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self
            .refresher_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("payment state refresher already running");
            return None;
        }
        Some(spawn_refresher(
            self.provider.clone(),
            self.config.refresh_interval,
            shutdown,
        ))
    }

    /// Charges the usage of `batch`, received at `received_at`, against the
    /// submitting accounts' reservations.
    pub async fn meter_batch(
        &self,
        batch: &Batch,
        received_at: SystemTime,
        cancel: &CancelSignal,
    ) -> Result<(), MeterError> {
        let batch_id = batch.header.digest();
        let result = async {
            let params = self.global_params()?;
            let updates = aggregate(batch, &params)?;
            self.admit_with_params(&updates, &params, received_at, cancel)
                .await
                .map(|()| updates.len())
        }
        .await;
        match result {
            Ok(updates) => {
                debug!(batch = %batch_id, updates, "batch usage admitted");
                Ok(())
            }
            Err(err) => {
                warn!(
                    batch = %batch_id,
                    code = %err.code,
                    account = ?err.account,
                    quorum = ?err.quorum,
                    "batch usage rejected: {}",
                    err.message
                );
                Err(err)
            }
        }
    }

    /// Charges pre-aggregated `updates`, all or nothing.
    pub async fn admit(
        &self,
        updates: &[UsageUpdate],
        received_at: SystemTime,
        cancel: &CancelSignal,
    ) -> Result<(), MeterError> {
        let params = self.global_params()?;
        self.admit_with_params(updates, &params, received_at, cancel)
            .await
    }

    fn global_params(&self) -> Result<PaymentGlobalParams, MeterError> {
        self.provider.payment_global_params().map_err(|err| {
            MeterError::new(
                ErrorCode::PaymentParamsFailed,
                format!("failed to load payment params: {err}"),
            )
        })
    }

    async fn admit_with_params(
        &self,
        updates: &[UsageUpdate],
        params: &PaymentGlobalParams,
        received_at: SystemTime,
        cancel: &CancelSignal,
    ) -> Result<(), MeterError> {
        let now = unix_secs(received_at);
        let mut by_account: BTreeMap<AccountId, Vec<&UsageUpdate>> = BTreeMap::new();
        for update in updates {
            by_account.entry(update.account).or_default().push(update);
        }

        let mut txn = self.ledger.begin();
        for (account, account_updates) in &by_account {
            let quorums: Vec<QuorumId> = account_updates
                .iter()
                .map(|update| update.quorum)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let reservations = match self.lookup(*account, &quorums, cancel).await {
                Ok(reservations) => reservations,
                Err(err) => {
                    txn.rollback();
                    return Err(err);
                }
            };
            for update in account_updates {
                if let Err(err) = apply(&mut txn, update, &reservations, params, now) {
                    txn.rollback();
                    return Err(err);
                }
            }
        }
        txn.commit();
        Ok(())
    }

    async fn lookup(
        &self,
        account: AccountId,
        quorums: &[QuorumId],
        cancel: &CancelSignal,
    ) -> Result<HashMap<QuorumId, ReservedPayment>, MeterError> {
        let fail = |message: String| {
            MeterError::new(ErrorCode::ReservationLookupFailed, message).with_account(account)
        };
        tokio::select! {
            biased;
            _ = cancelled(cancel.clone()) => Err(fail("reservation lookup cancelled".to_string())),
            result = self.provider.reserved_payments(account, quorums) => {
                result.map_err(|err| fail(format!("failed to look up reservations: {err}")))
            }
        }
    }
}

fn apply(
    txn: &mut UsageTxn<'_>,
    update: &UsageUpdate,
    reservations: &HashMap<QuorumId, ReservedPayment>,
    params: &PaymentGlobalParams,
    now: u64,
) -> Result<(), MeterError> {
    let fail = |code: ErrorCode, message: String| {
        MeterError::new(code, message)
            .with_account(update.account)
            .with_quorum(update.quorum)
    };
    let window = match params.quorum_config(update.quorum) {
        Some(config) if config.reservation_window > 0 => config.reservation_window,
        _ => {
            return Err(fail(
                ErrorCode::PaymentParamsFailed,
                format!("no usable protocol config for quorum {}", update.quorum),
            ))
        }
    };
    let reservation = reservations.get(&update.quorum).ok_or_else(|| {
        fail(
            ErrorCode::ReservationNotFound,
            format!("no reservation for quorum {}", update.quorum),
        )
    })?;
    if !reservation.is_active(now) {
        return Err(fail(
            ErrorCode::ReservationInactive,
            format!(
                "reservation covers [{}, {}], received at {now}",
                reservation.start_timestamp, reservation.end_timestamp
            ),
        ));
    }
    if !is_valid_reservation_period(reservation, update.period, now, window) {
        return Err(fail(
            ErrorCode::ReservationPeriodInvalid,
            format!("period {} is not chargeable at {now}", update.period),
        ));
    }
    let prev = txn.increment(
        update.account,
        update.quorum,
        update.period,
        update.usage,
        window,
        reservation,
    )?;
    debug!(
        account = %update.account,
        quorum = update.quorum,
        period = update.period,
        prev,
        usage = update.usage,
        "usage charged"
    );
    Ok(())
}

impl std::fmt::Debug for Meterer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meterer")
            .field("config", &self.config)
            .field("accounts", &self.ledger.account_count())
            .finish()
    }
}
