//! Streaming little-endian writer and checked reader for wire records.
//!
//! Field shapes:
//!
//! | Field | Encoding |
//! |---|---|
//! | string | `u32` length including a zero terminator, bytes, `0`; length `0` means absent |
//! | binary | `u32` length, bytes |
//! | variant | `u8` tag, payload (none: nothing, ui64/dbl: 8 bytes, str/bin as above) |
//! | timestamp | `i32` seconds, `i32` nanoseconds |
//! | history entry | `i32` step index, variant, timestamp |
//! | step | `u8` type, string params, `u8` error handler, string handler params |
//! | list | `i32` count followed by the elements |

use crate::error::DecodeError;
use crate::types::{ErrorHandler, HistoryEntry, Step, StepType, Timespec};
use crate::variant::{Variant, VariantKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Append-only record writer
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn put_str(&mut self, s: Option<&str>) {
        match s {
            None => self.put_u32(0),
            Some(s) => {
                self.put_u32(s.len() as u32 + 1);
                self.buf.put_slice(s.as_bytes());
                self.buf.put_u8(0);
            }
        }
    }

    pub fn put_bin(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    pub fn put_ts(&mut self, ts: Timespec) {
        self.put_i32(ts.sec);
        self.put_i32(ts.ns);
    }

    pub fn put_variant(&mut self, value: &Variant) {
        self.put_u8(value.kind() as u8);
        match value {
            Variant::None => {}
            Variant::Str(s) => self.put_str(Some(s)),
            Variant::Dbl(d) => self.put_f64(*d),
            Variant::Ui64(u) => self.put_u64(*u),
            Variant::Bin(b) => self.put_bin(b),
        }
    }

    pub fn put_history(&mut self, history: &[HistoryEntry]) {
        self.put_i32(history.len() as i32);
        for entry in history {
            self.put_i32(entry.index);
            self.put_variant(&entry.value);
            self.put_ts(entry.ts);
        }
    }

    pub fn put_steps(&mut self, steps: &[Step]) {
        self.put_i32(steps.len() as i32);
        for step in steps {
            self.put_u8(step.step_type.code());
            self.put_str(Some(&step.params));
            self.put_u8(step.error_handler.code());
            self.put_str(Some(&step.error_handler_params));
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked reader over an encoded record
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            buf: data,
            total: data.len(),
        }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn offset(&self) -> usize {
        self.total - self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                offset: self.offset(),
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn f64(&mut self) -> Result<f64, DecodeError> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_le())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(len)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn str(&mut self) -> Result<Option<String>, DecodeError> {
        let len = self.u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.take(len)?;
        let (text, terminator) = raw.split_at(len - 1);
        if terminator[0] != 0 {
            return Err(DecodeError::MissingTerminator);
        }
        String::from_utf8(text.to_vec())
            .map(Some)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Read a string field, treating an absent string as empty
    pub fn str_or_empty(&mut self) -> Result<String, DecodeError> {
        Ok(self.str()?.unwrap_or_default())
    }

    pub fn bin(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn ts(&mut self) -> Result<Timespec, DecodeError> {
        let sec = self.i32()?;
        let ns = self.i32()?;
        Ok(Timespec { sec, ns })
    }

    pub fn variant(&mut self) -> Result<Variant, DecodeError> {
        let tag = self.u8()?;
        let kind = VariantKind::from_tag(tag).ok_or(DecodeError::UnknownVariant(tag))?;
        Ok(match kind {
            VariantKind::None => Variant::None,
            VariantKind::Str => Variant::Str(self.str_or_empty()?),
            VariantKind::Dbl => Variant::Dbl(self.f64()?),
            VariantKind::Ui64 => Variant::Ui64(self.u64()?),
            VariantKind::Bin => Variant::Bin(self.bin()?),
        })
    }

    /// Read an `i32` element count
    pub fn count(&mut self) -> Result<usize, DecodeError> {
        let count = self.i32()?;
        if count < 0 {
            return Err(DecodeError::InvalidCount(count));
        }
        Ok(count as usize)
    }

    pub fn history(&mut self) -> Result<Vec<HistoryEntry>, DecodeError> {
        let count = self.count()?;
        let mut history = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let index = self.i32()?;
            let value = self.variant()?;
            let ts = self.ts()?;
            history.push(HistoryEntry { index, value, ts });
        }
        Ok(history)
    }

    pub fn steps(&mut self) -> Result<Vec<Step>, DecodeError> {
        let count = self.count()?;
        let mut steps = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let code = self.u8()?;
            let step_type = StepType::from_code(code).ok_or(DecodeError::UnknownStepType(code))?;
            let params = self.str_or_empty()?;
            let code = self.u8()?;
            let error_handler =
                ErrorHandler::from_code(code).ok_or(DecodeError::UnknownErrorHandler(code))?;
            let error_handler_params = self.str_or_empty()?;
            steps.push(Step {
                step_type,
                params,
                error_handler,
                error_handler_params,
            });
        }
        Ok(steps)
    }

    /// Fail if anything is left after a complete message
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
