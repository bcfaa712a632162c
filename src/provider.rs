//! Source of payment parameters and reservations.
//!
//! The node normally backs [`PaymentParamsProvider`] with a cache of on-chain
//! payment vault state. [`SnapshotPaymentState`] serves the same data from a
//! JSON snapshot so the meter can run without a chain connection.

use crate::error::ProviderError;
use crate::params::{AccountId, PaymentGlobalParams, QuorumId, QuorumProtocolConfig, ReservedPayment};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Payment state consumed by the meter.
#[async_trait]
pub trait PaymentParamsProvider: Send + Sync {
    /// Cached global payment parameters.
    fn payment_global_params(&self) -> Result<PaymentGlobalParams, ProviderError>;

    /// Reservations held by `account` in each of `quorums`. Quorums without a
    /// reservation are absent from the result.
    async fn reserved_payments(
        &self,
        account: AccountId,
        quorums: &[QuorumId],
    ) -> Result<HashMap<QuorumId, ReservedPayment>, ProviderError>;

    /// Refreshes cached on-chain state.
    async fn refresh_onchain_state(&self) -> Result<(), ProviderError>;
}

/// Reservation entry of a [`PaymentSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReservation {
    /// Account holding the reservation.
    pub account: AccountId,
    /// Quorum the reservation applies to.
    pub quorum: QuorumId,
    /// Reservation terms.
    #[serde(flatten)]
    pub reservation: ReservedPayment,
}

/// Serialized payment state.
///
/// ```json
/// {
///   "quorums": { "0": { "min_num_symbols": 32, "reservation_window": 300 } },
///   "reservations": [
///     { "account": "0x…", "quorum": 0, "symbols_per_second": 4,
///       "start_timestamp": 0, "end_timestamp": 4102444800 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    /// Protocol constants keyed by quorum.
    #[serde(default)]
    pub quorums: BTreeMap<QuorumId, QuorumProtocolConfig>,
    /// Reservations keyed by account and quorum.
    #[serde(default)]
    pub reservations: Vec<SnapshotReservation>,
}

impl PaymentSnapshot {
    /// Loads a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ProviderError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| ProviderError::Io(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&contents).map_err(|err| ProviderError::Decode(err.to_string()))
    }
}

#[derive(Debug, Default)]
struct SnapshotIndex {
    params: PaymentGlobalParams,
    reservations: HashMap<AccountId, HashMap<QuorumId, ReservedPayment>>,
}

impl From<PaymentSnapshot> for SnapshotIndex {
    fn from(snapshot: PaymentSnapshot) -> Self {
        let mut reservations: HashMap<AccountId, HashMap<QuorumId, ReservedPayment>> =
            HashMap::new();
        for entry in snapshot.reservations {
            reservations
                .entry(entry.account)
                .or_default()
                .insert(entry.quorum, entry.reservation);
        }
        Self {
            params: PaymentGlobalParams {
                quorum_configs: snapshot.quorums,
            },
            reservations,
        }
    }
}

/// In-process provider serving a [`PaymentSnapshot`].
///
/// When built with [`SnapshotPaymentState::from_path`], every refresh re-reads
/// the file; a failed refresh keeps the previous snapshot.
#[derive(Debug)]
pub struct SnapshotPaymentState {
    path: Option<PathBuf>,
    state: RwLock<SnapshotIndex>,
}

impl SnapshotPaymentState {
    /// Serves a fixed snapshot.
    pub fn new(snapshot: PaymentSnapshot) -> Self {
        Self {
            path: None,
            state: RwLock::new(snapshot.into()),
        }
    }

    /// Serves the snapshot stored at `path`, reloading it on refresh.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let path = path.into();
        let snapshot = PaymentSnapshot::load(&path)?;
        Ok(Self {
            path: Some(path),
            state: RwLock::new(snapshot.into()),
        })
    }

    /// Replaces the served snapshot.
    pub fn replace(&self, snapshot: PaymentSnapshot) {
        *self.state.write() = snapshot.into();
    }
}

#[async_trait]
impl PaymentParamsProvider for SnapshotPaymentState {
    fn payment_global_params(&self) -> Result<PaymentGlobalParams, ProviderError> {
        Ok(self.state.read().params.clone())
    }

    async fn reserved_payments(
        &self,
        account: AccountId,
        quorums: &[QuorumId],
    ) -> Result<HashMap<QuorumId, ReservedPayment>, ProviderError> {
        let state = self.state.read();
        let Some(held) = state.reservations.get(&account) else {
            return Ok(HashMap::new());
        };
        Ok(quorums
            .iter()
            .filter_map(|quorum| held.get(quorum).map(|r| (*quorum, *r)))
            .collect())
    }

    async fn refresh_onchain_state(&self) -> Result<(), ProviderError> {
        if let Some(path) = &self.path {
            let snapshot = PaymentSnapshot::load(path)?;
            self.replace(snapshot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("{tag}_{nanos}.json"))
    }

    fn snapshot(rate: u64) -> PaymentSnapshot {
        let mut quorums = BTreeMap::new();
        quorums.insert(
            0,
            QuorumProtocolConfig {
                min_num_symbols: 32,
                reservation_window: 300,
            },
        );
        PaymentSnapshot {
            quorums,
            reservations: vec![SnapshotReservation {
                account: AccountId::new([1; 20]),
                quorum: 0,
                reservation: ReservedPayment {
                    symbols_per_second: rate,
                    start_timestamp: 0,
                    end_timestamp: 10_000,
                },
            }],
        }
    }

    #[tokio::test]
    async fn lookup_returns_only_held_quorums() {
        let provider = SnapshotPaymentState::new(snapshot(4));
        let held = provider
            .reserved_payments(AccountId::new([1; 20]), &[0, 1])
            .await
            .unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[&0].symbols_per_second, 4);

        let none = provider
            .reserved_payments(AccountId::new([2; 20]), &[0])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn refresh_reloads_snapshot_file() {
        let path = temp_path("payment_snapshot");
        fs::write(&path, serde_json::to_string(&snapshot(4)).unwrap()).unwrap();
        let provider = SnapshotPaymentState::from_path(&path).unwrap();
        assert_eq!(
            provider.payment_global_params().unwrap().quorum_config(0),
            Some(&QuorumProtocolConfig {
                min_num_symbols: 32,
                reservation_window: 300,
            })
        );

        fs::write(&path, serde_json::to_string(&snapshot(9)).unwrap()).unwrap();
        provider.refresh_onchain_state().await.unwrap();
        let held = provider
            .reserved_payments(AccountId::new([1; 20]), &[0])
            .await
            .unwrap();
        assert_eq!(held[&0].symbols_per_second, 9);

        fs::write(&path, "not json").unwrap();
        let err = provider.refresh_onchain_state().await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
        let held = provider
            .reserved_payments(AccountId::new([1; 20]), &[0])
            .await
            .unwrap();
        assert_eq!(held[&0].symbols_per_second, 9);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_snapshot_file_is_io_error() {
        let err = SnapshotPaymentState::from_path(temp_path("absent")).unwrap_err();
        assert!(matches!(err, ProviderError::Io(_)));
    }
}
