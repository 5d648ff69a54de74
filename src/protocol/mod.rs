//! Wire protocol between collectors, the manager and workers
//!
//! Every exchange is a [`Message`]: a numeric code plus an encoded payload.
//! Payloads are built with [`WireWriter`] in a single streaming pass and
//! parsed with the bounds-checked [`WireReader`]; field order is fixed per
//! message type.
//!
//! # Messages
//!
//! | Code | Direction | Payload |
//! |---|---|---|
//! | `Register` | worker → manager | pool token |
//! | `Request` | collector → manager | batch of [`ItemValue`] records |
//! | `Request` | manager → worker | [`TaskRequest`] |
//! | `Result` | worker → manager | [`TaskResult`] |
//! | `QueueSize` | manager → client | `u64` queued value count |
//! | `TestRequest` | client → manager → worker | [`TestRequest`] |
//! | `TestResult` | worker → manager → client | [`TestResult`] |
//!
//! A frame on a byte stream is `u32` code, `u32` payload length, payload.

pub mod codec;

pub use codec::{WireReader, WireWriter};

use crate::error::DecodeError;
use crate::types::{
    ErrorHandler, HistoryEntry, ItemFlags, ItemState, ItemValue, LogMeta, Step, StepResult,
    Timespec, ValueType,
};
use crate::variant::Variant;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size: code + payload length
pub const FRAME_HEADER_LEN: usize = 8;

/// Message type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageCode {
    Register = 1,
    Request = 2,
    Result = 3,
    QueueSize = 4,
    TestRequest = 5,
    TestResult = 6,
}

impl MessageCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(MessageCode::Register),
            2 => Some(MessageCode::Request),
            3 => Some(MessageCode::Result),
            4 => Some(MessageCode::QueueSize),
            5 => Some(MessageCode::TestRequest),
            6 => Some(MessageCode::TestResult),
            _ => None,
        }
    }
}

/// A coded, encoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: MessageCode,
    pub data: Bytes,
}

impl Message {
    pub fn new(code: MessageCode, data: Bytes) -> Self {
        Self { code, data }
    }

    /// Payload of a message that must carry `code`
    pub fn expect(&self, code: MessageCode) -> Result<&[u8], DecodeError> {
        if self.code != code {
            return Err(DecodeError::UnexpectedCode(self.code as u32));
        }
        Ok(&self.data)
    }

    /// Serialize as a stream frame
    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.data.len());
        buf.put_u32_le(self.code as u32);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the message
    /// and the number of bytes consumed.
    pub fn from_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = WireReader::new(&buf[..FRAME_HEADER_LEN]);
        let raw_code = header.u32()?;
        let len = header.u32()? as usize;
        let code = MessageCode::from_u32(raw_code).ok_or(DecodeError::UnexpectedCode(raw_code))?;
        let end = FRAME_HEADER_LEN + len;
        if buf.len() < end {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..end]);
        Ok(Some((Message { code, data }, end)))
    }
}

// ==================== Registration / queue size ====================

pub fn pack_register(pool_token: u64) -> Message {
    let mut w = WireWriter::with_capacity(8);
    w.put_u64(pool_token);
    Message::new(MessageCode::Register, w.finish())
}

pub fn unpack_register(msg: &Message) -> Result<u64, DecodeError> {
    let mut r = WireReader::new(msg.expect(MessageCode::Register)?);
    let token = r.u64()?;
    r.finish()?;
    Ok(token)
}

pub fn pack_queue_size(size: u64) -> Message {
    let mut w = WireWriter::with_capacity(8);
    w.put_u64(size);
    Message::new(MessageCode::QueueSize, w.finish())
}

pub fn unpack_queue_size(msg: &Message) -> Result<u64, DecodeError> {
    let mut r = WireReader::new(msg.expect(MessageCode::QueueSize)?);
    let size = r.u64()?;
    r.finish()?;
    Ok(size)
}

// ==================== Ingested values ====================

fn put_marker<T>(w: &mut WireWriter, field: Option<T>, put: impl FnOnce(&mut WireWriter, T)) {
    match field {
        None => w.put_u8(0),
        Some(v) => {
            w.put_u8(1);
            put(w, v);
        }
    }
}

fn read_marker<T>(
    r: &mut WireReader<'_>,
    read: impl FnOnce(&mut WireReader<'_>) -> Result<T, DecodeError>,
) -> Result<Option<T>, DecodeError> {
    match r.u8()? {
        0 => Ok(None),
        _ => read(r).map(Some),
    }
}

fn put_item_value(w: &mut WireWriter, value: &ItemValue) {
    w.put_u64(value.itemid);
    w.put_u8(value.value_type.code());
    w.put_u8(value.flags.0);
    w.put_u8(value.state as u8);
    w.put_str(value.error.as_deref());
    put_marker(w, value.ts, |w, ts| w.put_ts(ts));
    put_marker(w, (!value.value.is_none()).then_some(&value.value), |w, v| {
        w.put_variant(v)
    });
    put_marker(w, value.log.as_ref(), |w, log| {
        w.put_u64(log.lastlogsize);
        w.put_i32(log.mtime);
        w.put_str(log.source.as_deref());
        w.put_i32(log.timestamp);
        w.put_i32(log.severity);
        w.put_i32(log.logeventid);
    });
}

fn read_item_value(r: &mut WireReader<'_>) -> Result<ItemValue, DecodeError> {
    let itemid = r.u64()?;
    let code = r.u8()?;
    let value_type = ValueType::from_code(code).ok_or(DecodeError::UnknownValueType(code))?;
    let flags = ItemFlags(r.u8()?);
    let code = r.u8()?;
    let state = ItemState::from_code(code).ok_or(DecodeError::UnknownItemState(code))?;
    let error = r.str()?;
    let ts = read_marker(r, |r| r.ts())?;
    let value = read_marker(r, |r| r.variant())?.unwrap_or_default();
    let log = read_marker(r, |r| {
        Ok(LogMeta {
            lastlogsize: r.u64()?,
            mtime: r.i32()?,
            source: r.str()?,
            timestamp: r.i32()?,
            severity: r.i32()?,
            logeventid: r.i32()?,
        })
    })?;
    Ok(ItemValue {
        itemid,
        value_type,
        flags,
        state,
        value,
        error,
        ts,
        log,
    })
}

/// Append one item value record to a batch under construction
pub fn pack_item_value_into(w: &mut WireWriter, value: &ItemValue) {
    put_item_value(w, value);
}

pub fn pack_item_values(values: &[ItemValue]) -> Message {
    let mut w = WireWriter::new();
    for value in values {
        put_item_value(&mut w, value);
    }
    Message::new(MessageCode::Request, w.finish())
}

pub fn unpack_item_values(msg: &Message) -> Result<Vec<ItemValue>, DecodeError> {
    let mut r = WireReader::new(msg.expect(MessageCode::Request)?);
    let mut values = Vec::new();
    while r.remaining() > 0 {
        values.push(read_item_value(&mut r)?);
    }
    Ok(values)
}

// ==================== Tasks ====================

/// Work sent to a worker: one value and the steps to run on it
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub itemid: u64,
    pub value_type: ValueType,
    pub ts: Option<Timespec>,
    pub value: Variant,
    pub history: Vec<HistoryEntry>,
    pub steps: Vec<Step>,
}

impl TaskRequest {
    pub fn encode(&self) -> Message {
        let mut w = WireWriter::new();
        w.put_u64(self.itemid);
        w.put_u8(self.value_type.code());
        put_marker(&mut w, self.ts, |w, ts| w.put_ts(ts));
        w.put_variant(&self.value);
        w.put_history(&self.history);
        w.put_steps(&self.steps);
        Message::new(MessageCode::Request, w.finish())
    }

    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(msg.expect(MessageCode::Request)?);
        let itemid = r.u64()?;
        let code = r.u8()?;
        let value_type = ValueType::from_code(code).ok_or(DecodeError::UnknownValueType(code))?;
        let ts = read_marker(&mut r, |r| r.ts())?;
        let value = r.variant()?;
        let history = r.history()?;
        let steps = r.steps()?;
        r.finish()?;
        Ok(Self {
            itemid,
            value_type,
            ts,
            value,
            history,
            steps,
        })
    }
}

/// Outcome of a task
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskResult {
    pub value: Variant,
    pub history: Vec<HistoryEntry>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn encode(&self) -> Message {
        let mut w = WireWriter::new();
        w.put_variant(&self.value);
        w.put_history(&self.history);
        w.put_str(self.error.as_deref());
        Message::new(MessageCode::Result, w.finish())
    }

    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(msg.expect(MessageCode::Result)?);
        let value = r.variant()?;
        let history = r.history()?;
        let error = r.str()?;
        r.finish()?;
        Ok(Self {
            value,
            history,
            error,
        })
    }
}

// ==================== Test mode ====================

/// Ad-hoc run of a step list against a literal value
#[derive(Debug, Clone, PartialEq)]
pub struct TestRequest {
    pub value_type: ValueType,
    pub value: String,
    pub ts: Timespec,
    pub history: Vec<HistoryEntry>,
    pub steps: Vec<Step>,
}

impl TestRequest {
    pub fn encode(&self) -> Message {
        let mut w = WireWriter::new();
        w.put_u8(self.value_type.code());
        w.put_str(Some(&self.value));
        w.put_ts(self.ts);
        w.put_history(&self.history);
        w.put_steps(&self.steps);
        Message::new(MessageCode::TestRequest, w.finish())
    }

    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(msg.expect(MessageCode::TestRequest)?);
        let code = r.u8()?;
        let value_type = ValueType::from_code(code).ok_or(DecodeError::UnknownValueType(code))?;
        let value = r.str_or_empty()?;
        let ts = r.ts()?;
        let history = r.history()?;
        let steps = r.steps()?;
        r.finish()?;
        Ok(Self {
            value_type,
            value,
            ts,
            history,
            steps,
        })
    }
}

/// Per-step outcomes of a test run
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TestResult {
    pub results: Vec<StepResult>,
    pub history: Vec<HistoryEntry>,
    pub error: Option<String>,
}

impl TestResult {
    pub fn encode(&self) -> Message {
        let mut w = WireWriter::new();
        w.put_i32(self.results.len() as i32);
        for result in &self.results {
            w.put_variant(&result.value);
            w.put_str(result.error.as_deref());
            w.put_u8(result.action.code());
        }
        w.put_history(&self.history);
        w.put_str(self.error.as_deref());
        Message::new(MessageCode::TestResult, w.finish())
    }

    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(msg.expect(MessageCode::TestResult)?);
        let count = r.count()?;
        let mut results = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            let value = r.variant()?;
            let error = r.str()?;
            let code = r.u8()?;
            let action =
                ErrorHandler::from_code(code).ok_or(DecodeError::UnknownErrorHandler(code))?;
            results.push(StepResult {
                value,
                error,
                action,
            });
        }
        let history = r.history()?;
        let error = r.str()?;
        r.finish()?;
        Ok(Self {
            results,
            history,
            error,
        })
    }
}
