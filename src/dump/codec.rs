//! Stable wire encoding for [`ForensicDump`].
//!
//! Layout, all multi-byte integers big-endian:
//!
//! ```text
//! offset  size   field
//! 0       4      magic = "MDMP"
//! 4       2      version (currently 1)
//! 6       1      memory_codec (0=none, 1=deflate)
//! 7       1      flags (bit0 = memory_truncated)
//! 8       8      fuel_consumed
//! 16      8      fuel_remaining
//! 24      8      wall_time_ns
//! 32      8      captured_at_ns
//! 40      —      cause_tlv
//! ...     —      function_tlv, args_tlv, requested_caps_tlv, granted_caps_tlv
//! ...     —      globals_tlv
//! ...     —      memory_tlv (own 4-byte length prefix; compressed bytes can
//!                exceed the 65,535-byte ceiling of the generic TLVs above)
//! end     4      crc32 (IEEE) of all preceding bytes
//! ```
//!
//! A generic TLV is a 1-byte tag identifying the field, a 2-byte big-endian
//! length, then that many payload bytes. `memory_tlv` is the one exception:
//! it carries its own 4-byte length because compressed memory routinely
//! exceeds what a `u16` can address.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::capability::{Capability, CapabilitySet};
use crate::dump::{Cause, ForensicDump, TrapKind};
use crate::value::{Value, ValueType};

const MAGIC: &[u8; 4] = b"MDMP";
const VERSION: u16 = 1;

const MEMORY_CODEC_NONE: u8 = 0;
const MEMORY_CODEC_DEFLATE: u8 = 1;

const FLAG_MEMORY_TRUNCATED: u8 = 0b0000_0001;

const TAG_CAUSE: u8 = 0;
const TAG_FUNCTION: u8 = 1;
const TAG_ARGS: u8 = 2;
const TAG_REQUESTED_CAPS: u8 = 3;
const TAG_GRANTED_CAPS: u8 = 4;
const TAG_GLOBALS: u8 = 5;

const CAUSE_FUEL_EXHAUSTED: u8 = 0;
const CAUSE_TRAP: u8 = 1;
const CAUSE_TIMEOUT: u8 = 2;
const CAUSE_HOST_DENIED: u8 = 3;
const CAUSE_INSTANTIATION_FAILED: u8 = 4;
const CAUSE_INVALID_MODULE: u8 = 5;

/// A dump failed to encode or decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DumpFormatError {
    #[error("input too short: expected at least {expected} more bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("bad magic bytes")]
    InvalidMagic,
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u16),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unrecognized memory codec tag: {0}")]
    UnknownMemoryCodec(u8),
    #[error("unrecognized cause tag: {0}")]
    UnknownCause(u8),
    #[error("unrecognized trap kind tag: {0}")]
    UnknownTrapKind(u8),
    #[error("unrecognized capability tag: {0}")]
    UnknownCapability(u8),
    #[error("unrecognized value type tag: {0}")]
    UnknownValueType(u8),
    #[error("unexpected TLV tag: expected {expected}, found {found}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("failed to inflate compressed memory: {0}")]
    Inflate(String),
}

/// Encode a dump into the stable wire format, compressing memory pages with
/// deflate when non-empty.
pub fn encode(dump: &ForensicDump) -> Vec<u8> {
    let mut body = Vec::new();

    body.extend_from_slice(&dump.fuel_consumed.to_be_bytes());
    body.extend_from_slice(&dump.fuel_remaining.to_be_bytes());
    body.extend_from_slice(&dump.wall_time_ns.to_be_bytes());
    body.extend_from_slice(&dump.captured_at_ns.to_be_bytes());

    write_tlv(&mut body, TAG_CAUSE, &encode_cause(&dump.cause));
    write_tlv(&mut body, TAG_FUNCTION, dump.function.as_bytes());
    write_tlv(&mut body, TAG_ARGS, &encode_values(&dump.args));
    write_tlv(&mut body, TAG_REQUESTED_CAPS, &encode_capabilities(&dump.requested_capabilities));
    write_tlv(&mut body, TAG_GRANTED_CAPS, &encode_capabilities(&dump.granted_capabilities));
    write_tlv(&mut body, TAG_GLOBALS, &encode_values(&dump.globals));

    let memory_codec = if dump.memory_pages.is_empty() { MEMORY_CODEC_NONE } else { MEMORY_CODEC_DEFLATE };
    let memory_payload = match memory_codec {
        MEMORY_CODEC_DEFLATE => deflate(&dump.memory_pages),
        _ => Vec::new(),
    };
    body.extend_from_slice(&(dump.memory_pages.len() as u32).to_be_bytes());
    body.extend_from_slice(&(memory_payload.len() as u32).to_be_bytes());
    body.extend_from_slice(&memory_payload);

    let mut out = Vec::with_capacity(8 + body.len() + 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.push(memory_codec);
    out.push(if dump.memory_truncated { FLAG_MEMORY_TRUNCATED } else { 0 });
    out.extend_from_slice(&body);

    let checksum = crc32fast::hash(&out);
    out.extend_from_slice(&checksum.to_be_bytes());
    out
}

/// Decode a dump, rejecting unknown magic/version, truncated input, or a bad checksum.
pub fn decode(bytes: &[u8]) -> Result<ForensicDump, DumpFormatError> {
    if bytes.len() < 4 {
        return Err(DumpFormatError::Truncated { expected: 4, found: bytes.len() });
    }
    if bytes.len() < 8 {
        return Err(DumpFormatError::Truncated { expected: 8, found: bytes.len() });
    }
    let (checksummed, trailer) = bytes.split_at(bytes.len() - 4);
    let expected_crc = u32::from_be_bytes(trailer.try_into().map_err(|_| DumpFormatError::Truncated {
        expected: 4,
        found: trailer.len(),
    })?);
    if crc32fast::hash(checksummed) != expected_crc {
        return Err(DumpFormatError::ChecksumMismatch);
    }

    let mut r = Reader::new(checksummed);
    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(DumpFormatError::InvalidMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(DumpFormatError::UnsupportedVersion(version));
    }
    let memory_codec = r.u8()?;
    let flags = r.u8()?;
    let memory_truncated = flags & FLAG_MEMORY_TRUNCATED != 0;

    let fuel_consumed = r.u64()?;
    let fuel_remaining = r.u64()?;
    let wall_time_ns = r.u64()?;
    let captured_at_ns = r.u64()?;

    let cause_bytes = r.tlv(TAG_CAUSE)?;
    let cause = decode_cause(cause_bytes)?;

    let function_bytes = r.tlv(TAG_FUNCTION)?;
    let function = String::from_utf8(function_bytes.to_vec()).map_err(|_| DumpFormatError::InvalidUtf8)?;

    let args = decode_values(r.tlv(TAG_ARGS)?)?;
    let requested_capabilities = decode_capabilities(r.tlv(TAG_REQUESTED_CAPS)?)?;
    let granted_capabilities = decode_capabilities(r.tlv(TAG_GRANTED_CAPS)?)?;
    let globals = decode_values(r.tlv(TAG_GLOBALS)?)?;

    let original_len = r.u32()? as usize;
    let compressed_len = r.u32()? as usize;
    let memory_payload = r.take(compressed_len)?;
    let memory_pages = match memory_codec {
        MEMORY_CODEC_NONE => Vec::new(),
        MEMORY_CODEC_DEFLATE => inflate(memory_payload, original_len)?,
        other => return Err(DumpFormatError::UnknownMemoryCodec(other)),
    };

    Ok(ForensicDump {
        cause,
        fuel_consumed,
        fuel_remaining,
        wall_time_ns,
        memory_pages,
        memory_truncated,
        globals,
        requested_capabilities,
        granted_capabilities,
        function,
        args,
        captured_at_ns,
    })
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

fn encode_cause(cause: &Cause) -> Vec<u8> {
    let mut buf = Vec::new();
    match cause {
        Cause::FuelExhausted => buf.push(CAUSE_FUEL_EXHAUSTED),
        Cause::Trap { kind, message } => {
            buf.push(CAUSE_TRAP);
            buf.push(kind.tag());
            let message_bytes = message.as_bytes();
            buf.extend_from_slice(&(message_bytes.len() as u16).to_be_bytes());
            buf.extend_from_slice(message_bytes);
        }
        Cause::Timeout => buf.push(CAUSE_TIMEOUT),
        Cause::HostDenied { capability } => {
            buf.push(CAUSE_HOST_DENIED);
            buf.push(capability.tag());
        }
        Cause::InstantiationFailed { reason } => {
            buf.push(CAUSE_INSTANTIATION_FAILED);
            let reason_bytes = reason.as_bytes();
            buf.extend_from_slice(&(reason_bytes.len() as u16).to_be_bytes());
            buf.extend_from_slice(reason_bytes);
        }
        Cause::InvalidModule => buf.push(CAUSE_INVALID_MODULE),
    }
    buf
}

fn decode_cause(bytes: &[u8]) -> Result<Cause, DumpFormatError> {
    let mut r = Reader::new(bytes);
    match r.u8()? {
        CAUSE_FUEL_EXHAUSTED => Ok(Cause::FuelExhausted),
        CAUSE_TRAP => {
            let kind_tag = r.u8()?;
            let kind = TrapKind::from_tag(kind_tag).ok_or(DumpFormatError::UnknownTrapKind(kind_tag))?;
            let len = r.u16()? as usize;
            let message = String::from_utf8(r.take(len)?.to_vec()).map_err(|_| DumpFormatError::InvalidUtf8)?;
            Ok(Cause::Trap { kind, message })
        }
        CAUSE_TIMEOUT => Ok(Cause::Timeout),
        CAUSE_HOST_DENIED => {
            let cap_tag = r.u8()?;
            let capability = Capability::from_tag(cap_tag).ok_or(DumpFormatError::UnknownCapability(cap_tag))?;
            Ok(Cause::HostDenied { capability })
        }
        CAUSE_INSTANTIATION_FAILED => {
            let len = r.u16()? as usize;
            let reason = String::from_utf8(r.take(len)?.to_vec()).map_err(|_| DumpFormatError::InvalidUtf8)?;
            Ok(Cause::InstantiationFailed { reason })
        }
        CAUSE_INVALID_MODULE => Ok(Cause::InvalidModule),
        other => Err(DumpFormatError::UnknownCause(other)),
    }
}

fn encode_value(buf: &mut Vec<u8>, value: Value) {
    buf.push(value.type_tag().tag());
    match value {
        Value::I32(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::I64(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::F32(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::F64(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
    }
}

fn encode_values(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for value in values {
        encode_value(&mut buf, *value);
    }
    buf
}

fn decode_values(bytes: &[u8]) -> Result<Vec<Value>, DumpFormatError> {
    let mut r = Reader::new(bytes);
    let count = r.u16()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_tag = r.u8()?;
        let ty = ValueType::from_tag(type_tag).ok_or(DumpFormatError::UnknownValueType(type_tag))?;
        let value = match ty {
            ValueType::I32 => Value::I32(i32::from_be_bytes(r.take(4)?.try_into().unwrap_or_default())),
            ValueType::I64 => Value::I64(i64::from_be_bytes(r.take(8)?.try_into().unwrap_or_default())),
            ValueType::F32 => Value::F32(f32::from_bits(u32::from_be_bytes(r.take(4)?.try_into().unwrap_or_default()))),
            ValueType::F64 => Value::F64(f64::from_bits(u64::from_be_bytes(r.take(8)?.try_into().unwrap_or_default()))),
        };
        values.push(value);
    }
    Ok(values)
}

fn encode_capabilities(set: &CapabilitySet) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(set.len() as u8);
    for capability in set.iter() {
        buf.push(capability.tag());
    }
    buf
}

fn decode_capabilities(bytes: &[u8]) -> Result<CapabilitySet, DumpFormatError> {
    let mut r = Reader::new(bytes);
    let count = r.u8()?;
    let mut atoms = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = r.u8()?;
        atoms.push(Capability::from_tag(tag).ok_or(DumpFormatError::UnknownCapability(tag))?);
    }
    Ok(CapabilitySet::from_atoms(atoms))
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    // In-memory writers never fail; a write error here would indicate a bug.
    encoder.write_all(data).unwrap_or_default();
    encoder.finish().unwrap_or_default()
}

fn inflate(data: &[u8], original_len: usize) -> Result<Vec<u8>, DumpFormatError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(original_len);
    decoder.read_to_end(&mut out).map_err(|e| DumpFormatError::Inflate(e.to_string()))?;
    Ok(out)
}

/// Minimal forward-only byte cursor used by [`decode`].
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DumpFormatError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < len {
            return Err(DumpFormatError::Truncated { expected: len, found: remaining });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DumpFormatError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DumpFormatError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap_or_default()))
    }

    fn u32(&mut self) -> Result<u32, DumpFormatError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap_or_default()))
    }

    fn u64(&mut self) -> Result<u64, DumpFormatError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap_or_default()))
    }

    /// Read a generic tag+len+payload TLV, verifying the tag matches `expected`.
    fn tlv(&mut self, expected: u8) -> Result<&'a [u8], DumpFormatError> {
        let found = self.u8()?;
        if found != expected {
            return Err(DumpFormatError::UnexpectedTag { expected, found });
        }
        let len = self.u16()? as usize;
        self.take(len)
    }
}
