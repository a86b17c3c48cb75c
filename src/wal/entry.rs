//! Binary, self-describing, checksummed log record format (component C1).
//!
//! # Layout
//!
//! ```text
//! header (36 bytes, little-endian):
//!   lsn:          u64  bytes 0..8
//!   txn_id:       u64  bytes 8..16
//!   op_type:      u32  bytes 16..20
//!   timestamp:    i64  bytes 20..28
//!   payload_len:  u32  bytes 28..32
//!   checksum:     u32  bytes 32..36
//! payload:
//!   key_len:       u32, key bytes
//!   value_len:     u32, value bytes
//!   old_value_len: u32, old_value bytes
//! ```
//!
//! The checksum is CRC-32 (IEEE) computed over header bytes `0..32`
//! concatenated with the payload (everything past byte 36). Decoders never
//! perform I/O; they operate purely on in-memory slices.

use crate::error::WalError;

/// Log Sequence Number. Monotonic, 1-based, never reused.
pub type LSN = u64;

/// Transaction identifier. Opaque to the log beyond grouping entries.
pub type TxnId = u64;

/// Size in bytes of the fixed header.
pub const HEADER_SIZE: usize = 36;

/// The five record kinds a log entry may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Insert = 0,
    Update = 1,
    Delete = 2,
    Commit = 3,
    Abort = 4,
}

impl OpType {
    fn from_u32(value: u32) -> Result<Self, WalError> {
        match value {
            0 => Ok(OpType::Insert),
            1 => Ok(OpType::Update),
            2 => Ok(OpType::Delete),
            3 => Ok(OpType::Commit),
            4 => Ok(OpType::Abort),
            other => Err(WalError::invalid_txn(format!(
                "op_type {other} is outside the enumerated set"
            ))),
        }
    }

    /// Insert, Update, and Delete carry a key and are subject to undo.
    pub fn is_data_op(self) -> bool {
        matches!(self, OpType::Insert | OpType::Update | OpType::Delete)
    }

    /// Commit and Abort terminate a transaction.
    pub fn is_terminal(self) -> bool {
        matches!(self, OpType::Commit | OpType::Abort)
    }
}

/// A single durable log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: LSN,
    pub txn_id: TxnId,
    pub op_type: OpType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub old_value: Vec<u8>,
    /// Wall-clock seconds at append time. Advisory only — never used for
    /// ordering or recovery decisions.
    pub timestamp: i64,
    /// CRC-32 (IEEE) over the rest of the record. Populated by [`encode`]
    /// and recomputed (and checked) by [`decode`].
    pub checksum: u32,
}

impl LogEntry {
    fn new(
        txn_id: TxnId,
        op_type: OpType,
        key: Vec<u8>,
        value: Vec<u8>,
        old_value: Vec<u8>,
    ) -> Self {
        Self {
            lsn: 0,
            txn_id,
            op_type,
            key,
            value,
            old_value,
            timestamp: chrono::Utc::now().timestamp(),
            checksum: 0,
        }
    }

    pub fn insert(txn_id: TxnId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(txn_id, OpType::Insert, key.into(), value.into(), Vec::new())
    }

    pub fn update(
        txn_id: TxnId,
        key: impl Into<Vec<u8>>,
        new_value: impl Into<Vec<u8>>,
        old_value: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(
            txn_id,
            OpType::Update,
            key.into(),
            new_value.into(),
            old_value.into(),
        )
    }

    pub fn delete(txn_id: TxnId, key: impl Into<Vec<u8>>, old_value: impl Into<Vec<u8>>) -> Self {
        Self::new(
            txn_id,
            OpType::Delete,
            key.into(),
            Vec::new(),
            old_value.into(),
        )
    }

    pub fn commit(txn_id: TxnId) -> Self {
        Self::new(txn_id, OpType::Commit, Vec::new(), Vec::new(), Vec::new())
    }

    pub fn abort(txn_id: TxnId) -> Self {
        Self::new(txn_id, OpType::Abort, Vec::new(), Vec::new(), Vec::new())
    }

    /// The inverse record the recovery engine writes to undo this entry.
    /// Only meaningful for data ops; panics are avoided by returning `None`
    /// for Commit/Abort, which are never undone directly.
    pub fn undo_of(&self) -> Option<LogEntry> {
        match self.op_type {
            OpType::Insert => Some(LogEntry::delete(
                self.txn_id,
                self.key.clone(),
                self.value.clone(),
            )),
            OpType::Update => Some(LogEntry::update(
                self.txn_id,
                self.key.clone(),
                self.old_value.clone(),
                self.value.clone(),
            )),
            OpType::Delete => Some(LogEntry::insert(
                self.txn_id,
                self.key.clone(),
                self.old_value.clone(),
            )),
            OpType::Commit | OpType::Abort => None,
        }
    }
}

fn payload_bytes(entry: &LogEntry) -> Vec<u8> {
    let mut payload = Vec::with_capacity(
        12 + entry.key.len() + entry.value.len() + entry.old_value.len(),
    );
    payload.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
    payload.extend_from_slice(&entry.key);
    payload.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
    payload.extend_from_slice(&entry.value);
    payload.extend_from_slice(&(entry.old_value.len() as u32).to_le_bytes());
    payload.extend_from_slice(&entry.old_value);
    payload
}

fn compute_checksum(header_without_checksum: &[u8; 32], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_without_checksum);
    hasher.update(payload);
    hasher.finalize()
}

/// Serialize `entry` into its on-disk byte representation, stamping the
/// checksum field as it goes.
pub fn encode(entry: &LogEntry) -> Vec<u8> {
    let payload = payload_bytes(entry);
    let payload_len = payload.len() as u32;

    let mut header_without_checksum = [0u8; 32];
    header_without_checksum[0..8].copy_from_slice(&entry.lsn.to_le_bytes());
    header_without_checksum[8..16].copy_from_slice(&entry.txn_id.to_le_bytes());
    header_without_checksum[16..20].copy_from_slice(&(entry.op_type as u32).to_le_bytes());
    header_without_checksum[20..28].copy_from_slice(&entry.timestamp.to_le_bytes());
    header_without_checksum[28..32].copy_from_slice(&payload_len.to_le_bytes());

    let checksum = compute_checksum(&header_without_checksum, &payload);

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header_without_checksum);
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Read the `payload_len` declared by a header, without validating the
/// checksum or parsing the payload. Used by the reader to find record
/// boundaries cheaply.
pub fn peek_record_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let payload_len = u32::from_le_bytes(bytes[28..32].try_into().unwrap()) as usize;
    Some(HEADER_SIZE + payload_len)
}

/// Deserialize a record previously produced by [`encode`], verifying its
/// checksum. Never performs I/O.
pub fn decode(bytes: &[u8]) -> Result<LogEntry, WalError> {
    if bytes.len() < HEADER_SIZE {
        return Err(WalError::malformed(format!(
            "buffer of {} bytes is shorter than the {}-byte header",
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let lsn = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let txn_id = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let op_type_raw = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let timestamp = i64::from_le_bytes(bytes[20..28].try_into().unwrap());
    let payload_len = u32::from_le_bytes(bytes[28..32].try_into().unwrap()) as usize;
    let stored_checksum = u32::from_le_bytes(bytes[32..36].try_into().unwrap());

    if bytes.len() < HEADER_SIZE + payload_len {
        return Err(WalError::malformed(format!(
            "declared payload_len {} runs past the end of a {}-byte buffer",
            payload_len,
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];

    let mut header_without_checksum = [0u8; 32];
    header_without_checksum.copy_from_slice(&bytes[0..32]);
    let computed = compute_checksum(&header_without_checksum, payload);
    if computed != stored_checksum {
        return Err(WalError::ChecksumMismatch {
            lsn: Some(lsn),
            offset: 0,
            detail: format!("stored {stored_checksum:#010x}, computed {computed:#010x}"),
        });
    }

    let op_type = OpType::from_u32(op_type_raw)?;

    let mut cursor = 0usize;
    let key = read_length_prefixed(payload, &mut cursor)?;
    let value = read_length_prefixed(payload, &mut cursor)?;
    let old_value = read_length_prefixed(payload, &mut cursor)?;

    Ok(LogEntry {
        lsn,
        txn_id,
        op_type,
        key,
        value,
        old_value,
        timestamp,
        checksum: stored_checksum,
    })
}

fn read_length_prefixed(payload: &[u8], cursor: &mut usize) -> Result<Vec<u8>, WalError> {
    if payload.len() < *cursor + 4 {
        return Err(WalError::malformed("payload truncated before a length prefix"));
    }
    let len = u32::from_le_bytes(payload[*cursor..*cursor + 4].try_into().unwrap()) as usize;
    *cursor += 4;
    if payload.len() < *cursor + len {
        return Err(WalError::malformed("payload truncated before its declared field"));
    }
    let field = payload[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(field)
}
