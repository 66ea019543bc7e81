//! WAL record types and framing.

use crate::error::{DbError, DbResult};
use crate::segment::SegmentRecord;
use crate::types::{SequenceNumber, TransactionId};

/// Magic bytes opening every WAL frame.
pub const WAL_MAGIC: [u8; 4] = *b"SWAL";

/// magic (4) + type (1) + payload length (4)
pub(crate) const HEADER_SIZE: usize = 9;
pub(crate) const CRC_SIZE: usize = 4;

/// Kind of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Start of a transaction.
    Begin = 1,
    /// One segment record staged by a transaction.
    Write = 2,
    /// The transaction committed.
    Commit = 3,
    /// Everything up to the sequence is in the segment log.
    Checkpoint = 4,
}

impl WalRecordType {
    /// Parses the type byte.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Write),
            3 => Some(Self::Commit),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// A WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Start of a transaction.
    Begin {
        /// Transaction ID.
        txid: TransactionId,
    },
    /// A staged segment record.
    Write {
        /// Transaction ID.
        txid: TransactionId,
        /// The record to apply on commit.
        record: SegmentRecord,
    },
    /// The transaction committed with `sequence`.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Commit sequence.
        sequence: SequenceNumber,
    },
    /// Checkpoint marker.
    Checkpoint {
        /// Last sequence persisted to segments.
        sequence: SequenceNumber,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Write { .. } => WalRecordType::Write,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::Checkpoint { .. } => WalRecordType::Checkpoint,
        }
    }

    /// Encodes the record into a complete frame.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            Self::Begin { txid } => payload.extend_from_slice(&txid.as_u64().to_le_bytes()),
            Self::Write { txid, record } => {
                payload.extend_from_slice(&txid.as_u64().to_le_bytes());
                payload.extend_from_slice(&record.encode()?);
            }
            Self::Commit { txid, sequence } => {
                payload.extend_from_slice(&txid.as_u64().to_le_bytes());
                payload.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
            Self::Checkpoint { sequence } => {
                payload.extend_from_slice(&sequence.as_u64().to_le_bytes());
            }
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| DbError::invalid_argument("WAL record too large"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&WAL_MAGIC);
        frame.push(self.record_type() as u8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Decodes the frame at the start of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds only part of a frame (torn tail)
    /// and the frame length otherwise.
    ///
    /// # Errors
    ///
    /// `Corruption` for a bad magic or type, `ChecksumMismatch` for a bad CRC.
    pub fn decode(data: &[u8]) -> DbResult<Option<(Self, usize)>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }
        if data[..4] != WAL_MAGIC {
            return Err(DbError::corruption("bad WAL magic"));
        }
        let record_type = WalRecordType::from_byte(data[4])
            .ok_or_else(|| DbError::corruption(format!("unknown WAL record type {}", data[4])))?;
        let len = u32::from_le_bytes(fixed(&data[5..9])?) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if data.len() < total {
            return Ok(None);
        }

        let stored = u32::from_le_bytes(fixed(&data[HEADER_SIZE + len..total])?);
        let computed = crc32fast::hash(&data[..HEADER_SIZE + len]);
        if stored != computed {
            return Err(DbError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let payload = &data[HEADER_SIZE..HEADER_SIZE + len];
        let u64_at = |at: usize| -> DbResult<u64> {
            let bytes = payload
                .get(at..at + 8)
                .ok_or_else(|| DbError::corruption("short WAL payload"))?;
            Ok(u64::from_le_bytes(fixed(bytes)?))
        };
        let record = match record_type {
            WalRecordType::Begin => Self::Begin {
                txid: TransactionId::new(u64_at(0)?),
            },
            WalRecordType::Write => Self::Write {
                txid: TransactionId::new(u64_at(0)?),
                record: SegmentRecord::decode(payload.get(8..).unwrap_or_default())?,
            },
            WalRecordType::Commit => Self::Commit {
                txid: TransactionId::new(u64_at(0)?),
                sequence: SequenceNumber::new(u64_at(8)?),
            },
            WalRecordType::Checkpoint => Self::Checkpoint {
                sequence: SequenceNumber::new(u64_at(0)?),
            },
        };
        Ok(Some((record, total)))
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> DbResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| DbError::corruption("short WAL field"))
}
