//! Segment record format.

use crate::error::{DbError, DbResult};
use crate::types::{CollectionId, Revision, SequenceNumber};
use serde_json::{Map, Value};

/// Flags stored with a segment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// A live document.
    pub const NONE: Self = Self(0);
    /// The document was deleted; the record keeps its revision and expiration.
    pub const TOMBSTONE: Self = Self(0x01);
    /// Every earlier record for the key is void.
    pub const PURGED: Self = Self(0x04);

    /// Creates flags from the raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// True if the tombstone bit is set.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        self.0 & Self::TOMBSTONE.0 != 0
    }

    /// True if the purge bit is set.
    #[must_use]
    pub const fn is_purge(self) -> bool {
        self.0 & Self::PURGED.0 != 0
    }
}

/// One stored version of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Document id.
    pub doc_id: String,
    /// Record flags.
    pub flags: RecordFlags,
    /// Sequence of the commit that wrote the record.
    pub sequence: SequenceNumber,
    /// Document revision after the write.
    pub revision: Revision,
    /// Expiration in Unix milliseconds.
    pub expiration: Option<u64>,
    /// CBOR-encoded body; empty for tombstones and purges.
    pub payload: Vec<u8>,
}

impl SegmentRecord {
    /// len (4) + collection (4) + flags (1) + sequence (8) + revision (8)
    /// + expiration (8) + id_len (2)
    const HEADER_SIZE: usize = 35;
    const CRC_SIZE: usize = 4;

    /// A live document version.
    #[must_use]
    pub fn document(
        collection_id: CollectionId,
        doc_id: impl Into<String>,
        sequence: SequenceNumber,
        revision: Revision,
        expiration: Option<u64>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            collection_id,
            doc_id: doc_id.into(),
            flags: RecordFlags::NONE,
            sequence,
            revision,
            expiration,
            payload,
        }
    }

    /// A deletion marker.
    #[must_use]
    pub fn tombstone(
        collection_id: CollectionId,
        doc_id: impl Into<String>,
        sequence: SequenceNumber,
        revision: Revision,
        expiration: Option<u64>,
    ) -> Self {
        Self {
            collection_id,
            doc_id: doc_id.into(),
            flags: RecordFlags::TOMBSTONE,
            sequence,
            revision,
            expiration,
            payload: Vec::new(),
        }
    }

    /// A purge marker.
    #[must_use]
    pub fn purge(
        collection_id: CollectionId,
        doc_id: impl Into<String>,
        sequence: SequenceNumber,
    ) -> Self {
        Self {
            collection_id,
            doc_id: doc_id.into(),
            flags: RecordFlags::PURGED,
            sequence,
            revision: Revision(0),
            expiration: None,
            payload: Vec::new(),
        }
    }

    /// True for deletion markers.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags.is_tombstone()
    }

    /// True for purge markers.
    #[must_use]
    pub fn is_purge(&self) -> bool {
        self.flags.is_purge()
    }

    /// Number of bytes `encode` produces.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.doc_id.len() + self.payload.len() + Self::CRC_SIZE
    }

    /// Encodes the record.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the document id is longer than `u16::MAX` bytes.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let id_len = u16::try_from(self.doc_id.len())
            .map_err(|_| DbError::invalid_argument("document id too long"))?;
        let total = self.encoded_size();
        let record_len = u32::try_from(total)
            .map_err(|_| DbError::invalid_argument("document body too large"))?;

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&record_len.to_le_bytes());
        buf.extend_from_slice(&self.collection_id.as_u32().to_le_bytes());
        buf.push(self.flags.as_byte());
        buf.extend_from_slice(&self.sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.revision.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.expiration.unwrap_or(0).to_le_bytes());
        buf.extend_from_slice(&id_len.to_le_bytes());
        buf.extend_from_slice(self.doc_id.as_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Reads the total record length from the first four bytes of `data`.
    pub(crate) fn peek_len(data: &[u8]) -> Option<usize> {
        let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes) as usize)
    }

    /// Decodes one record from the start of `data`.
    ///
    /// # Errors
    ///
    /// `Corruption` for a truncated or malformed record, `ChecksumMismatch`
    /// if the CRC does not match.
    pub fn decode(data: &[u8]) -> DbResult<Self> {
        let record_len = Self::peek_len(data)
            .ok_or_else(|| DbError::corruption("segment record too short"))?;
        if record_len < Self::HEADER_SIZE + Self::CRC_SIZE || data.len() < record_len {
            return Err(DbError::corruption("incomplete segment record"));
        }
        let data = &data[..record_len];

        let body_end = record_len - Self::CRC_SIZE;
        let stored_crc = u32::from_le_bytes(le_array(&data[body_end..])?);
        let computed_crc = crc32fast::hash(&data[..body_end]);
        if stored_crc != computed_crc {
            return Err(DbError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let collection_id = CollectionId::new(u32::from_le_bytes(le_array(&data[4..8])?));
        let flags = RecordFlags::from_byte(data[8]);
        let sequence = SequenceNumber::new(u64::from_le_bytes(le_array(&data[9..17])?));
        let revision = Revision(u64::from_le_bytes(le_array(&data[17..25])?));
        let expiration = match u64::from_le_bytes(le_array(&data[25..33])?) {
            0 => None,
            ms => Some(ms),
        };
        let id_len = u16::from_le_bytes(le_array(&data[33..35])?) as usize;

        let id_end = Self::HEADER_SIZE + id_len;
        if id_end > body_end {
            return Err(DbError::corruption("document id overruns record"));
        }
        let doc_id = std::str::from_utf8(&data[Self::HEADER_SIZE..id_end])
            .map_err(|_| DbError::corruption("document id is not UTF-8"))?
            .to_owned();

        Ok(Self {
            collection_id,
            doc_id,
            flags,
            sequence,
            revision,
            expiration,
            payload: data[id_end..body_end].to_vec(),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> DbResult<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| DbError::corruption("short field in segment record"))
}

/// Encodes a document body as CBOR.
pub(crate) fn encode_body(body: &Map<String, Value>) -> DbResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(body, &mut buf).map_err(|e| DbError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR document body. An empty payload is an empty body.
pub(crate) fn decode_body(payload: &[u8]) -> DbResult<Map<String, Value>> {
    if payload.is_empty() {
        return Ok(Map::new());
    }
    ciborium::from_reader(payload).map_err(|e| DbError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> SegmentRecord {
        let body = json!({"x": 1, "tags": ["a", "b"], "nested": {"f": 1.5}});
        SegmentRecord::document(
            CollectionId::new(3),
            "doc-1",
            SequenceNumber::new(12),
            Revision(12),
            Some(1_700_000_000_000),
            encode_body(body.as_object().unwrap()).unwrap(),
        )
    }

    #[test]
    fn document_record_roundtrip() {
        let record = sample();
        let bytes = record.encode().unwrap();
        assert_eq!(bytes.len(), record.encoded_size());
        assert_eq!(SegmentRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn body_survives_cbor() {
        let record = sample();
        let body = decode_body(&record.payload).unwrap();
        assert_eq!(Value::Object(body), json!({"x": 1, "tags": ["a", "b"], "nested": {"f": 1.5}}));
        assert!(decode_body(&[]).unwrap().is_empty());
    }

    #[test]
    fn markers_keep_their_flags() {
        let t = SegmentRecord::tombstone(CollectionId::new(1), "a", SequenceNumber(4), Revision(4), None);
        let p = SegmentRecord::purge(CollectionId::new(1), "a", SequenceNumber(5));
        let t2 = SegmentRecord::decode(&t.encode().unwrap()).unwrap();
        let p2 = SegmentRecord::decode(&p.encode().unwrap()).unwrap();
        assert!(t2.is_tombstone() && !t2.is_purge());
        assert!(p2.is_purge() && !p2.is_tombstone());
        assert_eq!(t2.expiration, None);
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut bytes = sample().encode().unwrap();
        bytes[20] ^= 0xFF;
        assert!(matches!(
            SegmentRecord::decode(&bytes),
            Err(DbError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncated_record_is_corruption() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            SegmentRecord::decode(&bytes[..bytes.len() - 1]),
            Err(DbError::Corruption { .. })
        ));
    }
}
