//! Master Protocol
//!
//! Binary encoding of the requests a slave sends to its master and of the
//! response envelope that carries piggybacked transactions. Each message
//! travels as one checksummed frame.
//!
//! ```text
//! request:  [type u8][store id, checked types][cursor, cursor types][payload]
//! response: [0][varint n][n x (resource, tx i64, master i32, len u32, data)][payload]
//!           [1][code u8][message]
//! copy:     [1][path][len u64][bytes] ... [0]   then the response frame
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::cursor::ReplicationCursor;
use super::types::{IdAllocation, IdType, LockResult, LockStatus, ResourceTx};
use crate::error::{Error, Result};
use crate::store::{StoreId, TxRecord};

/// Request types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    AllocateIds = 0,
    CreateRelationshipType = 1,
    AcquireNodeWriteLock = 2,
    AcquireNodeReadLock = 3,
    AcquireRelationshipWriteLock = 4,
    AcquireRelationshipReadLock = 5,
    Commit = 6,
    PullUpdates = 7,
    FinishTx = 8,
    GetMasterIdForTx = 9,
    CopyStore = 255,
}

impl RequestType {
    /// Parse a wire code
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => RequestType::AllocateIds,
            1 => RequestType::CreateRelationshipType,
            2 => RequestType::AcquireNodeWriteLock,
            3 => RequestType::AcquireNodeReadLock,
            4 => RequestType::AcquireRelationshipWriteLock,
            5 => RequestType::AcquireRelationshipReadLock,
            6 => RequestType::Commit,
            7 => RequestType::PullUpdates,
            8 => RequestType::FinishTx,
            9 => RequestType::GetMasterIdForTx,
            255 => RequestType::CopyStore,
            other => return Err(Error::Protocol(format!("Unknown request type {}", other))),
        })
    }

    /// Whether the request carries a replication cursor
    pub fn includes_cursor(self) -> bool {
        !matches!(self, RequestType::AllocateIds | RequestType::GetMasterIdForTx)
    }

    /// Whether the server verifies the store identity first
    pub fn checks_store(self) -> bool {
        !matches!(self, RequestType::CopyStore | RequestType::GetMasterIdForTx)
    }

    /// Whether the request may block on the lock manager
    pub fn is_lock(self) -> bool {
        matches!(
            self,
            RequestType::AcquireNodeWriteLock
                | RequestType::AcquireNodeReadLock
                | RequestType::AcquireRelationshipWriteLock
                | RequestType::AcquireRelationshipReadLock
        )
    }
}

/// Error codes carried by an error response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Internal = 0,
    StoreMismatch = 1,
    TxNotFound = 2,
    NotServed = 3,
    Protocol = 4,
    ShuttingDown = 5,
    TxManagerNotOk = 6,
}

impl ErrorCode {
    fn from_code(code: u8) -> Self {
        match code {
            1 => ErrorCode::StoreMismatch,
            2 => ErrorCode::TxNotFound,
            3 => ErrorCode::NotServed,
            4 => ErrorCode::Protocol,
            5 => ErrorCode::ShuttingDown,
            6 => ErrorCode::TxManagerNotOk,
            _ => ErrorCode::Internal,
        }
    }
}

/// Fixed-width and length-prefixed writes
pub struct WireWriter {
    buf: BytesMut,
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl WireWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    /// LEB128 unsigned varint
    pub fn varint(&mut self, mut v: u64) -> &mut Self {
        while v >= 0x80 {
            self.buf.put_u8((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        self.buf.put_u8(v as u8);
        self
    }

    /// Varint length followed by UTF-8 bytes
    pub fn string(&mut self, s: &str) -> &mut Self {
        self.varint(s.len() as u64);
        self.buf.put_slice(s.as_bytes());
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.put_slice(b);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked reads over a message body
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Protocol(format!(
                "Message truncated: needed {} more bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::Protocol("Varint too long".into()))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.varint()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::Protocol(format!("Invalid string: {}", e)))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Everything not read yet
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

/// A decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request type
    pub kind: RequestType,
    /// Store identity the requester expects, for checked types
    pub store_id: Option<StoreId>,
    /// Requester cursor, for cursor types
    pub cursor: Option<ReplicationCursor>,
    /// Type-specific payload
    pub payload: Bytes,
}

impl Request {
    /// Build a request; the store id and cursor are dropped for types
    /// that do not carry them
    pub fn new(kind: RequestType, store_id: Option<StoreId>, cursor: &ReplicationCursor, payload: Bytes) -> Self {
        Self {
            kind,
            store_id: if kind.checks_store() { store_id } else { None },
            cursor: kind.includes_cursor().then(|| cursor.clone()),
            payload,
        }
    }

    /// Encode to a message body
    pub fn encode(&self) -> Result<Bytes> {
        let mut w = WireWriter::new();
        w.u8(self.kind as u8);

        if self.kind.checks_store() {
            let store_id = self
                .store_id
                .ok_or_else(|| Error::Protocol(format!("{:?} needs a store id", self.kind)))?;
            w.bytes(&store_id.to_bytes());
        }

        if self.kind.includes_cursor() {
            let cursor = self
                .cursor
                .as_ref()
                .ok_or_else(|| Error::Protocol(format!("{:?} needs a cursor", self.kind)))?;
            encode_cursor(&mut w, cursor);
        }

        w.bytes(&self.payload);
        Ok(w.finish())
    }

    /// Decode a message body
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let kind = RequestType::from_code(r.u8()?)?;

        let store_id = if kind.checks_store() {
            Some(StoreId::from_bytes(r.take(StoreId::SIZE)?)?)
        } else {
            None
        };

        let cursor = if kind.includes_cursor() {
            Some(decode_cursor(&mut r)?)
        } else {
            None
        };

        Ok(Self {
            kind,
            store_id,
            cursor,
            payload: Bytes::copy_from_slice(r.rest()),
        })
    }
}

fn encode_cursor(w: &mut WireWriter, cursor: &ReplicationCursor) {
    w.i64(cursor.session_id).i32(cursor.machine_id).i64(cursor.event_id);
    w.varint(cursor.txs().len() as u64);
    for (resource, tx) in cursor.txs() {
        w.string(resource).i64(*tx);
    }
}

fn decode_cursor(r: &mut WireReader<'_>) -> Result<ReplicationCursor> {
    let session_id = r.i64()?;
    let machine_id = r.i32()?;
    let event_id = r.i64()?;
    let count = r.varint()? as usize;
    let mut txs = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let resource = r.string()?;
        let tx = r.i64()?;
        txs.push((resource, tx));
    }
    Ok(ReplicationCursor::new(session_id, machine_id, event_id, txs))
}

/// Encode a successful response envelope
pub fn encode_response(transactions: &[ResourceTx], payload: &[u8]) -> Result<Bytes> {
    let mut w = WireWriter::new();
    w.u8(0);
    w.varint(transactions.len() as u64);
    for entry in transactions {
        let len = u32::try_from(entry.tx.data.len())
            .map_err(|_| Error::Protocol("Transaction too large".into()))?;
        w.string(&entry.resource)
            .i64(entry.tx.tx_id)
            .i32(entry.tx.master_id)
            .u32(len)
            .bytes(&entry.tx.data);
    }
    w.bytes(payload);
    Ok(w.finish())
}

/// Encode an error response
pub fn encode_error(error: &Error) -> Bytes {
    let (code, message) = match error {
        Error::StoreMismatch { expected, actual } => {
            (ErrorCode::StoreMismatch, format!("{}\n{}", expected, actual))
        }
        Error::TxNotFound { resource, tx_id } => (ErrorCode::TxNotFound, format!("{}\n{}", resource, tx_id)),
        Error::Protocol(m) => (ErrorCode::Protocol, m.clone()),
        Error::ShuttingDown | Error::StoreClosed => (ErrorCode::ShuttingDown, error.to_string()),
        Error::TxManagerNotOk(m) => (ErrorCode::TxManagerNotOk, m.clone()),
        Error::Remote { code, message } if *code == ErrorCode::NotServed as u8 => {
            (ErrorCode::NotServed, message.clone())
        }
        other => (ErrorCode::Internal, other.to_string()),
    };

    let mut w = WireWriter::new();
    w.u8(1).u8(code as u8).string(&message);
    w.finish()
}

/// Error returned for a request a server does not serve
pub fn not_served(kind: RequestType) -> Error {
    Error::Remote {
        code: ErrorCode::NotServed as u8,
        message: format!("{:?} is not served here", kind),
    }
}

/// Decode a response envelope into its transactions and payload
pub fn decode_response(body: &[u8]) -> Result<(Vec<ResourceTx>, Bytes)> {
    let mut r = WireReader::new(body);
    match r.u8()? {
        0 => {}
        1 => {
            let code = ErrorCode::from_code(r.u8()?);
            let message = r.string()?;
            return Err(remote_error(code, message));
        }
        other => return Err(Error::Protocol(format!("Unknown response status {}", other))),
    }

    let count = r.varint()? as usize;
    let mut transactions = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let resource = r.string()?;
        let tx_id = r.i64()?;
        let master_id = r.i32()?;
        let len = r.u32()? as usize;
        let data = r.take(len)?.to_vec();
        transactions.push(ResourceTx {
            resource,
            tx: TxRecord::new(tx_id, master_id, data),
        });
    }

    Ok((transactions, Bytes::copy_from_slice(r.rest())))
}

fn remote_error(code: ErrorCode, message: String) -> Error {
    match code {
        ErrorCode::StoreMismatch => {
            let (expected, actual) = message.split_once('\n').unwrap_or((&message, ""));
            Error::StoreMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }
        }
        ErrorCode::TxNotFound => {
            let parsed = message
                .split_once('\n')
                .and_then(|(resource, tx)| Some((resource.to_string(), tx.parse().ok()?)));
            match parsed {
                Some((resource, tx_id)) => Error::TxNotFound { resource, tx_id },
                None => Error::Remote {
                    code: code as u8,
                    message,
                },
            }
        }
        ErrorCode::Protocol => Error::Protocol(message),
        ErrorCode::TxManagerNotOk => Error::TxManagerNotOk(message),
        _ => Error::Remote {
            code: code as u8,
            message,
        },
    }
}

/// Encode an id allocation payload
pub fn encode_id_allocation(allocation: &IdAllocation) -> Bytes {
    let mut w = WireWriter::new();
    w.u32(allocation.defragmented_ids.len() as u32);
    for id in &allocation.defragmented_ids {
        w.i64(*id);
    }
    w.i64(allocation.range_start)
        .u32(allocation.range_length)
        .i64(allocation.highest_id_in_use)
        .i64(allocation.defrag_count);
    w.finish()
}

/// Decode an id allocation payload
pub fn decode_id_allocation(payload: &[u8]) -> Result<IdAllocation> {
    let mut r = WireReader::new(payload);
    let count = r.u32()? as usize;
    let mut defragmented_ids = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        defragmented_ids.push(r.i64()?);
    }
    Ok(IdAllocation {
        defragmented_ids,
        range_start: r.i64()?,
        range_length: r.u32()?,
        highest_id_in_use: r.i64()?,
        defrag_count: r.i64()?,
    })
}

/// Encode a lock result payload
pub fn encode_lock_result(result: &LockResult) -> Bytes {
    let mut w = WireWriter::new();
    w.u8(result.status as u8);
    if result.status == LockStatus::Deadlock {
        w.string(result.message.as_deref().unwrap_or(""));
    }
    w.finish()
}

/// Decode a lock result payload
pub fn decode_lock_result(payload: &[u8]) -> Result<LockResult> {
    let mut r = WireReader::new(payload);
    let status = LockStatus::from_code(r.u8()?)?;
    let message = if status == LockStatus::Deadlock {
        Some(r.string()?)
    } else {
        None
    };
    Ok(LockResult { status, message })
}

/// Encode a list of entity ids
pub fn encode_ids(ids: &[i64]) -> Bytes {
    let mut w = WireWriter::new();
    w.varint(ids.len() as u64);
    for id in ids {
        w.i64(*id);
    }
    w.finish()
}

/// Decode a list of entity ids
pub fn decode_ids(payload: &[u8]) -> Result<Vec<i64>> {
    let mut r = WireReader::new(payload);
    let count = r.varint()? as usize;
    let mut ids = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        ids.push(r.i64()?);
    }
    Ok(ids)
}

/// Encode a commit payload
pub fn encode_commit(resource: &str, data: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(data.len()).map_err(|_| Error::Protocol("Transaction too large".into()))?;
    let mut w = WireWriter::new();
    w.string(resource).u32(len).bytes(data);
    Ok(w.finish())
}

/// Decode a commit payload
pub fn decode_commit(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut r = WireReader::new(payload);
    let resource = r.string()?;
    let len = r.u32()? as usize;
    Ok((resource, r.take(len)?.to_vec()))
}

/// Encode an id type payload
pub fn encode_id_type(id_type: IdType) -> Bytes {
    Bytes::copy_from_slice(&[id_type.code()])
}

/// Decode an id type payload
pub fn decode_id_type(payload: &[u8]) -> Result<IdType> {
    IdType::from_code(WireReader::new(payload).u8()?)
}

/// Encode a string payload
pub fn encode_string(s: &str) -> Bytes {
    let mut w = WireWriter::new();
    w.string(s);
    w.finish()
}

/// Decode a string payload
pub fn decode_string(payload: &[u8]) -> Result<String> {
    WireReader::new(payload).string()
}

/// Encode a big-endian i32 payload
pub fn encode_i32(v: i32) -> Bytes {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

/// Decode a big-endian i32 payload
pub fn decode_i32(payload: &[u8]) -> Result<i32> {
    WireReader::new(payload).i32()
}

/// Encode a big-endian i64 payload
pub fn encode_i64(v: i64) -> Bytes {
    Bytes::copy_from_slice(&v.to_be_bytes())
}

/// Decode a big-endian i64 payload
pub fn decode_i64(payload: &[u8]) -> Result<i64> {
    WireReader::new(payload).i64()
}

/// One frame of a store copy stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyFrame {
    /// A store file
    File { path: String, data: Vec<u8> },
    /// No more files; the response frame follows
    End,
}

impl CopyFrame {
    /// Encode to a message body
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        match self {
            CopyFrame::File { path, data } => {
                w.u8(1).string(path).u64(data.len() as u64).bytes(data);
            }
            CopyFrame::End => {
                w.u8(0);
            }
        }
        w.finish()
    }

    /// Decode a message body
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        match r.u8()? {
            0 => Ok(CopyFrame::End),
            1 => {
                let path = r.string()?;
                let len = usize::try_from(r.u64()?)
                    .map_err(|_| Error::Protocol("Copied file too large".into()))?;
                Ok(CopyFrame::File {
                    path,
                    data: r.take(len)?.to_vec(),
                })
            }
            other => Err(Error::Protocol(format!("Unknown copy frame {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor() -> ReplicationCursor {
        ReplicationCursor::new(
            1_700_000_000_000,
            3,
            12,
            vec![("graph".to_string(), 41), ("index".to_string(), 2)],
        )
    }

    #[test]
    fn test_request_layout_per_type() {
        let store_id = StoreId::new();

        let allocate = Request::new(RequestType::AllocateIds, Some(store_id), &cursor(), encode_id_type(IdType::Node));
        let body = allocate.encode().unwrap();
        // type + store id + payload, no cursor
        assert_eq!(body.len(), 1 + StoreId::SIZE + 1);
        assert_eq!(Request::decode(&body).unwrap(), allocate);

        let lookup = Request::new(RequestType::GetMasterIdForTx, Some(store_id), &cursor(), encode_i64(41));
        let body = lookup.encode().unwrap();
        assert_eq!(body.len(), 1 + 8);
        let decoded = Request::decode(&body).unwrap();
        assert!(decoded.store_id.is_none() && decoded.cursor.is_none());

        let copy = Request::new(RequestType::CopyStore, Some(store_id), &cursor(), Bytes::new());
        let decoded = Request::decode(&copy.encode().unwrap()).unwrap();
        assert!(decoded.store_id.is_none());
        assert_eq!(decoded.cursor, Some(cursor()));
    }

    #[test]
    fn test_response_envelope() {
        let txs = vec![
            ResourceTx {
                resource: "graph".into(),
                tx: TxRecord::new(42, 1, b"create".to_vec()),
            },
            ResourceTx {
                resource: "graph".into(),
                tx: TxRecord::new(43, 1, Vec::new()),
            },
        ];
        let body = encode_response(&txs, &encode_i64(43)).unwrap();
        let (decoded, payload) = decode_response(&body).unwrap();
        assert_eq!(decoded, txs);
        assert_eq!(decode_i64(&payload).unwrap(), 43);
    }

    #[test]
    fn test_error_responses_keep_their_kind() {
        let body = encode_error(&Error::StoreMismatch {
            expected: "a".into(),
            actual: "b".into(),
        });
        assert!(matches!(
            decode_response(&body),
            Err(Error::StoreMismatch { expected, actual }) if expected == "a" && actual == "b"
        ));

        let body = encode_error(&Error::TxNotFound {
            resource: "graph".into(),
            tx_id: 100,
        });
        assert!(matches!(
            decode_response(&body),
            Err(Error::TxNotFound { tx_id: 100, .. })
        ));

        let body = encode_error(&not_served(RequestType::Commit));
        assert!(matches!(decode_response(&body), Err(Error::Remote { code: 3, .. })));
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut w = WireWriter::new();
            w.varint(value);
            let bytes = w.finish();
            assert_eq!(WireReader::new(&bytes).varint().unwrap(), value);
        }
    }

    #[test]
    fn test_truncated_message() {
        let body = encode_commit("graph", b"payload").unwrap();
        assert!(decode_commit(&body[..body.len() - 2]).is_err());
        assert!(Request::decode(&[RequestType::Commit as u8, 0, 0]).is_err());
    }

    #[test]
    fn test_lock_result_payload() {
        let deadlock = LockResult::deadlock("tx 1 waits for tx 2");
        assert_eq!(decode_lock_result(&encode_lock_result(&deadlock)).unwrap(), deadlock);
        let ok = LockResult::ok();
        assert_eq!(encode_lock_result(&ok).len(), 1);
    }

    #[test]
    fn test_copy_frames() {
        let file = CopyFrame::File {
            path: "graph.log.0".into(),
            data: vec![1, 2, 3],
        };
        assert_eq!(CopyFrame::decode(&file.encode()).unwrap(), file);
        assert_eq!(CopyFrame::decode(&CopyFrame::End.encode()).unwrap(), CopyFrame::End);
    }
}
