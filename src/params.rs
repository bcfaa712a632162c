//! Protocol parameters, reservation records, and the period arithmetic shared
//! by the aggregator and the admission engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a quorum (replication/signing group).
pub type QuorumId = u8;

/// Length in bytes of an account address.
pub const ACCOUNT_ID_LENGTH: usize = 20;

/// Address of a paying account.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AccountId(pub [u8; ACCOUNT_ID_LENGTH]);

impl AccountId {
    /// Wraps raw address bytes.
    pub const fn new(bytes: [u8; ACCOUNT_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    pub fn as_bytes(&self) -> &[u8; ACCOUNT_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({self})")
    }
}

/// Failure to parse an [`AccountId`] from its hex form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountIdError {
    /// Input was not valid hex.
    #[error("invalid account hex: {0}")]
    Hex(String),
    /// Decoded address had the wrong length.
    #[error("invalid account length {0}, expected 20 bytes")]
    Length(usize),
}

impl FromStr for AccountId {
    type Err = AccountIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let bytes = hex::decode(trimmed).map_err(|err| AccountIdError::Hex(err.to_string()))?;
        let array: [u8; ACCOUNT_ID_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AccountIdError::Length(bytes.len()))?;
        Ok(Self(array))
    }
}

impl Serialize for AccountId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-quorum protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumProtocolConfig {
    /// Quantization granularity; every blob is charged a multiple of this.
    pub min_num_symbols: u64,
    /// Bin width in seconds.
    pub reservation_window: u64,
}

/// Capacity purchased by an account within one quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedPayment {
    /// Sustained rate granted by the reservation.
    pub symbols_per_second: u64,
    /// First second (unix) at which the reservation is usable.
    pub start_timestamp: u64,
    /// Last second (unix) at which the reservation is usable.
    pub end_timestamp: u64,
}

impl ReservedPayment {
    /// Symbols admissible in a single bin of `window` seconds.
    pub fn bin_limit(&self, window: u64) -> u64 {
        self.symbols_per_second.saturating_mul(window)
    }

    /// Returns true when `now` (unix seconds) lies inside the reservation.
    pub fn is_active(&self, now: u64) -> bool {
        self.start_timestamp <= now && now <= self.end_timestamp
    }

    /// Period containing the start of the reservation.
    pub fn start_period(&self, window: u64) -> u64 {
        reservation_period(self.start_timestamp, window)
    }

    /// Period containing the expiry of the reservation.
    pub fn end_period(&self, window: u64) -> u64 {
        reservation_period(self.end_timestamp, window)
    }
}

/// Global payment parameters published on chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentGlobalParams {
    /// Protocol constants keyed by quorum.
    pub quorum_configs: BTreeMap<QuorumId, QuorumProtocolConfig>,
}

impl PaymentGlobalParams {
    /// Protocol constants for `quorum`, if published.
    pub fn quorum_config(&self, quorum: QuorumId) -> Option<&QuorumProtocolConfig> {
        self.quorum_configs.get(&quorum)
    }
}

/// Start second of the bin containing `timestamp`.
///
/// Periods are identified by their first second, so consecutive periods
/// differ by exactly `window`. A zero window collapses everything to 0.
pub fn reservation_period(timestamp: u64, window: u64) -> u64 {
    if window == 0 {
        return 0;
    }
    timestamp / window * window
}

/// [`reservation_period`] for a payment timestamp expressed in unix nanoseconds.
pub fn reservation_period_by_nanos(timestamp_ns: i64, window: u64) -> u64 {
    if timestamp_ns < 0 {
        return 0;
    }
    reservation_period(timestamp_ns as u64 / 1_000_000_000, window)
}

/// Symbols charged for a blob of `num_symbols`, rounded up to a multiple of
/// `min_num_symbols` and never below it.
pub fn symbols_charged(num_symbols: u64, min_num_symbols: u64) -> u64 {
    if num_symbols <= min_num_symbols {
        return min_num_symbols;
    }
    if min_num_symbols == 0 {
        return num_symbols;
    }
    num_symbols
        .div_ceil(min_num_symbols)
        .saturating_mul(min_num_symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charged_symbols_round_up_to_granularity() {
        assert_eq!(symbols_charged(97, 32), 128);
        assert_eq!(symbols_charged(128, 32), 128);
        assert_eq!(symbols_charged(129, 32), 160);
        assert_eq!(symbols_charged(1, 32), 32);
        assert_eq!(symbols_charged(0, 32), 32);
        assert_eq!(symbols_charged(97, 0), 97);
    }

    #[test]
    fn periods_align_to_window_start() {
        assert_eq!(reservation_period(0, 300), 0);
        assert_eq!(reservation_period(299, 300), 0);
        assert_eq!(reservation_period(300, 300), 300);
        assert_eq!(reservation_period(1_000, 300), 900);
        assert_eq!(reservation_period(1_000, 0), 0);
        assert_eq!(reservation_period_by_nanos(1_000_000_000_000, 300), 900);
        assert_eq!(reservation_period_by_nanos(-5, 300), 0);
    }

    #[test]
    fn reservation_activity_is_inclusive() {
        let reservation = ReservedPayment {
            symbols_per_second: 4,
            start_timestamp: 100,
            end_timestamp: 200,
        };
        assert!(!reservation.is_active(99));
        assert!(reservation.is_active(100));
        assert!(reservation.is_active(200));
        assert!(!reservation.is_active(201));
        assert_eq!(reservation.bin_limit(60), 240);
        assert_eq!(reservation.end_period(60), 180);
    }

    #[test]
    fn account_id_hex_roundtrip() {
        let account = AccountId::new([0xab; ACCOUNT_ID_LENGTH]);
        let text = account.to_string();
        assert!(text.starts_with("0x"));
        assert_eq!(text.parse::<AccountId>().unwrap(), account);
        assert_eq!(text[2..].parse::<AccountId>().unwrap(), account);
        assert_eq!("0x1234".parse::<AccountId>(), Err(AccountIdError::Length(2)));
        assert!(matches!("zz".parse::<AccountId>(), Err(AccountIdError::Hex(_))));

        let json = serde_json::to_string(&account).unwrap();
        let back: AccountId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, account);
    }
}
