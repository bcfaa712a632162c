//! Batch payloads handed to the meter after signature and format validation.

use crate::params::{AccountId, QuorumId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Header identifying a batch of blob certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    /// Merkle root over the batch's blob certificates.
    pub batch_root: [u8; 32],
    /// Chain block number the batch's operator state refers to.
    pub reference_block_number: u64,
}

impl BatchHeader {
    /// Hex SHA-256 over the canonical header fields.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.batch_root);
        hasher.update(self.reference_block_number.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Payment details attached to a blob by its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    /// Account paying for the blob.
    pub account_id: AccountId,
    /// Submission time in unix nanoseconds.
    pub timestamp: i64,
    /// Cumulative on-demand payment; zero when the blob rides a reservation.
    #[serde(default)]
    pub cumulative_payment: u128,
}

/// Header describing one blob submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeader {
    /// Blob format version.
    #[serde(default)]
    pub version: u16,
    /// Quorums the blob is dispersed to.
    pub quorum_numbers: Vec<QuorumId>,
    /// Length of the blob in symbols.
    pub length: u64,
    /// Payment details for the blob.
    pub payment: PaymentMetadata,
}

/// Certificate for a blob included in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobCertificate {
    /// Blob header; `None` when the certificate arrived without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_header: Option<BlobHeader>,
    /// Relays holding the blob.
    #[serde(default)]
    pub relay_keys: Vec<u32>,
}

/// Batch of blob certificates awaiting acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch header.
    pub header: BatchHeader,
    /// Certificates of the blobs in the batch.
    pub blob_certificates: Vec<BlobCertificate>,
}

impl Batch {
    /// Returns true when the batch carries no certificates.
    pub fn is_empty(&self) -> bool {
        self.blob_certificates.is_empty()
    }
}
