//! Binary envelope for records stored in the log.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! | version u16 | kind u8 | value type u8 | intent u8 | rejection type u8 |
//! | key i64 | source position i64 | producer id i32 | timestamp i64 |
//! | request id i64 | request stream id i32 |
//! | reason len u32 | reason utf-8 | payload len u32 | payload json |
//! ```
//!
//! A request id of `-1` encodes "no request metadata"; a rejection type of
//! `0` encodes "not rejected". The position is not part of the envelope: the
//! log assigns it on append.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, WriteError};
use crate::record::{
    Intent, Record, RecordKind, RecordMetadata, Rejection, RejectionType, RequestMetadata,
    ValueType,
};

/// Envelope version written by this build. Entries with a higher version are
/// refused by [`decode`].
pub const PROTOCOL_VERSION: u16 = 1;

const FIXED_HEADER_LEN: usize = 2 + 4 + 8 + 8 + 4 + 8 + 8 + 4;
const NO_REQUEST: i64 = -1;

/// A record that has not been assigned a position yet.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrittenRecord {
    /// Entity key, or [`UNSET_KEY`](crate::record::UNSET_KEY).
    pub key: i64,
    /// Position of the causing record, or
    /// [`UNSET_POSITION`](crate::record::UNSET_POSITION).
    pub source_record_position: i64,
    /// Envelope metadata.
    pub metadata: RecordMetadata,
    /// Payload.
    pub value: serde_json::Value,
}

/// Encode a record envelope.
///
/// # Errors
///
/// Returns [`WriteError::Encode`] if the payload cannot be serialized, or
/// [`WriteError::FieldTooLong`] if the payload or rejection reason exceeds
/// 4 GiB.
pub fn encode(record: &UnwrittenRecord) -> Result<Bytes, WriteError> {
    let payload = serde_json::to_vec(&record.value)?;
    let meta = &record.metadata;
    let reason = meta
        .rejection
        .as_ref()
        .map(|r| r.reason.as_bytes())
        .unwrap_or_default();

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + 8 + reason.len() + payload.len());
    buf.put_u16(meta.protocol_version);
    buf.put_u8(meta.kind.code());
    buf.put_u8(meta.intent.value_type().code());
    buf.put_u8(meta.intent.code());
    buf.put_u8(meta.rejection.as_ref().map_or(0, |r| r.rejection_type.code()));
    buf.put_i64(record.key);
    buf.put_i64(record.source_record_position);
    buf.put_i32(meta.producer_id);
    buf.put_i64(meta.timestamp);
    match meta.request {
        Some(req) => {
            buf.put_i64(req.request_id);
            buf.put_i32(req.request_stream_id);
        }
        None => {
            buf.put_i64(NO_REQUEST);
            buf.put_i32(-1);
        }
    }
    put_len_prefixed(&mut buf, "rejection reason", reason)?;
    put_len_prefixed(&mut buf, "payload", &payload)?;
    Ok(buf.freeze())
}

/// Decode the envelope of the entry stored at `position`.
///
/// The version check runs before anything else is read, so an entry from a
/// newer protocol is reported as [`DecodeError::UnsupportedVersion`] even if
/// its remaining layout changed.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing the first field that could not be
/// read.
pub fn decode(position: i64, mut buf: &[u8]) -> Result<Record, DecodeError> {
    ensure(&buf, 2)?;
    let version = buf.get_u16();
    if version > PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion {
            found: version,
            supported: PROTOCOL_VERSION,
        });
    }

    ensure(&buf, FIXED_HEADER_LEN - 2)?;
    let kind_code = buf.get_u8();
    let kind = RecordKind::from_code(kind_code).ok_or(DecodeError::UnknownRecordKind(kind_code))?;
    let value_type_code = buf.get_u8();
    let value_type = ValueType::from_code(value_type_code)
        .ok_or(DecodeError::UnknownValueType(value_type_code))?;
    let intent_code = buf.get_u8();
    let intent =
        Intent::from_parts(value_type, intent_code).ok_or(DecodeError::UnknownIntent {
            value_type: value_type_code,
            code: intent_code,
        })?;
    let rejection_code = buf.get_u8();
    let rejection_type = match rejection_code {
        0 => None,
        code => Some(RejectionType::from_code(code).ok_or(DecodeError::UnknownRejectionType(code))?),
    };
    let key = buf.get_i64();
    let source_record_position = buf.get_i64();
    let producer_id = buf.get_i32();
    let timestamp = buf.get_i64();
    let request_id = buf.get_i64();
    let request_stream_id = buf.get_i32();

    let reason = String::from_utf8(get_len_prefixed(&mut buf)?.to_vec())?;
    let value = serde_json::from_slice(get_len_prefixed(&mut buf)?)?;

    Ok(Record {
        position,
        key,
        source_record_position,
        metadata: RecordMetadata {
            kind,
            intent,
            rejection: rejection_type.map(|rejection_type| Rejection {
                rejection_type,
                reason,
            }),
            request: (request_id != NO_REQUEST).then_some(RequestMetadata {
                request_id,
                request_stream_id,
            }),
            producer_id,
            timestamp,
            protocol_version: version,
        },
        value,
    })
}

fn put_len_prefixed(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<(), WriteError> {
    let len = u32::try_from(data.len()).map_err(|_| WriteError::FieldTooLong {
        field,
        len: data.len(),
    })?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

fn get_len_prefixed<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let remaining: &'a [u8] = *buf;
    let (data, rest) = remaining.split_at(len);
    *buf = rest;
    Ok(data)
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}
