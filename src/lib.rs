#![deny(missing_docs)]

//! # reservation_meter
//!
//! **reservation_meter** decides whether a data-availability validator may
//! store and sign a batch of blobs, given the bandwidth reservations the
//! submitting accounts purchased on chain.
//!
//! ## Model
//!
//! * Each quorum publishes a [`QuorumProtocolConfig`]: a quantization
//!   granularity (`min_num_symbols`) and a bin width in seconds
//!   (`reservation_window`).
//! * Each account holds a [`ReservedPayment`] per quorum. Its bin limit is
//!   `symbols_per_second * reservation_window`.
//! * The [`aggregate`] step turns a [`Batch`] into [`UsageUpdate`]s, one per
//!   `(account, quorum, period)`.
//! * The [`Meterer`] charges those updates against a [`UsageLedger`] of
//!   fixed-size period rings. A charge that overruns its bin may borrow from
//!   the next bin only, and never by more than one full bin.
//! * Admission is all or nothing: the first failing update rolls back every
//!   charge the batch already made, across all accounts.
//!
//! Usage counters live in memory only and reset when the process restarts.
//!
//! ## Usage
//!
//! ```rust
//! use reservation_meter::{
//!     uncancellable, AccountId, MeterConfig, Meterer, PaymentSnapshot, QuorumProtocolConfig,
//!     ReservedPayment, SnapshotPaymentState, SnapshotReservation, UsageUpdate,
//! };
//! use std::sync::Arc;
//! use std::time::{Duration, UNIX_EPOCH};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let account = AccountId::new([7; 20]);
//! let mut snapshot = PaymentSnapshot::default();
//! snapshot.quorums.insert(
//!     0,
//!     QuorumProtocolConfig { min_num_symbols: 32, reservation_window: 300 },
//! );
//! snapshot.reservations.push(SnapshotReservation {
//!     account,
//!     quorum: 0,
//!     reservation: ReservedPayment {
//!         symbols_per_second: 1,
//!         start_timestamp: 0,
//!         end_timestamp: 10_000,
//!     },
//! });
//!
//! let meter = Meterer::new(
//!     MeterConfig::default(),
//!     Arc::new(SnapshotPaymentState::new(snapshot)),
//! )
//! .unwrap();
//! let received_at = UNIX_EPOCH + Duration::from_secs(1_000);
//! let update = UsageUpdate { account, quorum: 0, period: 900, usage: 300 };
//!
//! meter.admit(&[update], received_at, &uncancellable()).await.unwrap();
//! assert!(meter.admit(&[update], received_at, &uncancellable()).await.is_err());
//! assert_eq!(meter.ledger().usage(account, 0, 900, 300), 300);
//! # }
//! ```

pub mod aggregator;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod params;
pub mod provider;
pub mod refresher;

pub use aggregator::{aggregate, UsageUpdate};
pub use batch::{Batch, BatchHeader, BlobCertificate, BlobHeader, PaymentMetadata};
pub use config::{ConfigError, MeterConfig, ENV_REFRESH_INTERVAL_MS};
pub use engine::{is_valid_reservation_period, uncancellable, CancelSignal, Meterer};
pub use error::{ErrorCode, MeterError, ProviderError};
pub use ledger::{AccountUsage, PeriodRecord, UsageLedger, UsageTxn, RING_SIZE};
pub use params::{
    reservation_period, reservation_period_by_nanos, symbols_charged, AccountId, AccountIdError,
    PaymentGlobalParams, QuorumId, QuorumProtocolConfig, ReservedPayment,
};
pub use provider::{
    PaymentParamsProvider, PaymentSnapshot, SnapshotPaymentState, SnapshotReservation,
};
pub use refresher::spawn_refresher;
