//! Yjs sync protocol framing and parsing.
//!
//! Pure functions over bytes; no I/O. A frame is a `message_type` byte
//! followed by a payload. Sync frames carry a sub-type byte and a single
//! length-prefixed byte string; awareness frames carry a single
//! length-prefixed byte string. Length prefixes are unsigned LEB128.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{Error, Result};

/// Top-level message type (first byte of a frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Sync protocol (sync step 1/2, updates)
    Sync = 0,
    /// Awareness protocol (cursors, presence)
    Awareness = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            _ => Err(Error::MalformedFrame("unknown message type")),
        }
    }
}

/// Sync sub-type (second byte when the frame is [`MessageType::Sync`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMessageType {
    /// A peer announces its state vector to request missing updates
    SyncStep1 = 0,
    /// Differential update answering a step 1
    SyncStep2 = 1,
    /// Incremental update
    Update = 2,
}

impl TryFrom<u8> for SyncMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SyncMessageType::SyncStep1),
            1 => Ok(SyncMessageType::SyncStep2),
            2 => Ok(SyncMessageType::Update),
            _ => Err(Error::MalformedFrame("unknown sync message type")),
        }
    }
}

/// A fully parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SyncStep1 { state_vector: Vec<u8> },
    SyncStep2 { update: Vec<u8> },
    Update { update: Vec<u8> },
    Awareness { update: Vec<u8> },
}

/// A varint longer than this encodes more than 64 bits.
const MAX_VAR_UINT_BYTES: usize = 10;

/// Encode a variable-length unsigned integer (unsigned LEB128).
pub fn write_var_uint(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Decode a variable-length unsigned integer, advancing the cursor.
pub fn read_var_uint(data: &mut &[u8]) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut count = 0;
    loop {
        if data.is_empty() {
            return Err(Error::MalformedFrame("truncated varint"));
        }
        let byte = data[0];
        *data = &data[1..];
        count += 1;
        if count > MAX_VAR_UINT_BYTES {
            return Err(Error::MalformedFrame("varint overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Encode a length-prefixed byte string.
pub fn write_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_var_uint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Decode a length-prefixed byte string, advancing the cursor.
pub fn read_var_bytes<'a>(data: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_var_uint(data)? as usize;
    if data.len() < len {
        return Err(Error::MalformedFrame("truncated payload"));
    }
    let (payload, rest) = data.split_at(len);
    *data = rest;
    Ok(payload)
}

fn sync_frame(sub_type: SyncMessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len() + 5);
    out.push(MessageType::Sync as u8);
    out.push(sub_type as u8);
    write_var_bytes(payload, &mut out);
    out
}

/// Frame a step-1 message carrying a state vector.
pub fn create_sync_step1(state_vector: &[u8]) -> Vec<u8> {
    sync_frame(SyncMessageType::SyncStep1, state_vector)
}

/// Frame a step-2 message carrying a differential update.
pub fn create_sync_step2(update: &[u8]) -> Vec<u8> {
    sync_frame(SyncMessageType::SyncStep2, update)
}

/// Frame an incremental update.
pub fn create_update(update: &[u8]) -> Vec<u8> {
    sync_frame(SyncMessageType::Update, update)
}

/// Frame an awareness update.
pub fn create_awareness(update: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + update.len() + 5);
    out.push(MessageType::Awareness as u8);
    write_var_bytes(update, &mut out);
    out
}

/// Parse a whole frame.
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    if frame.is_empty() {
        return Err(Error::MalformedFrame("empty frame"));
    }
    let message_type = MessageType::try_from(frame[0])?;
    let mut rest = &frame[1..];

    match message_type {
        MessageType::Sync => {
            if rest.is_empty() {
                return Err(Error::MalformedFrame("missing sync sub-type"));
            }
            let sub_type = SyncMessageType::try_from(rest[0])?;
            rest = &rest[1..];
            let payload = read_var_bytes(&mut rest)?.to_vec();
            Ok(match sub_type {
                SyncMessageType::SyncStep1 => Message::SyncStep1 {
                    state_vector: payload,
                },
                SyncMessageType::SyncStep2 => Message::SyncStep2 { update: payload },
                SyncMessageType::Update => Message::Update { update: payload },
            })
        }
        MessageType::Awareness => {
            let payload = read_var_bytes(&mut rest)?.to_vec();
            Ok(Message::Awareness { update: payload })
        }
    }
}

/// Encode the document's state vector.
pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

/// Encode the update that brings a replica at `state_vector` up to date
/// with `doc`. An empty state vector yields the full history.
pub fn encode_state_as_update(doc: &Doc, state_vector: &[u8]) -> Result<Vec<u8>> {
    let sv = StateVector::decode_v1(state_vector).map_err(|e| Error::Crdt(e.to_string()))?;
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&sv))
}

/// Apply raw update bytes to the document.
pub fn apply_update(doc: &Doc, update: &[u8]) -> Result<()> {
    let update = Update::decode_v1(update).map_err(|e| Error::Crdt(e.to_string()))?;
    doc.transact_mut()
        .apply_update(update)
        .map_err(|e| Error::Crdt(e.to_string()))
}

/// Handle the payload of a sync frame (everything after the
/// [`MessageType::Sync`] byte) against a document.
///
/// A step 1 produces a step-2 reply for the requesting peer; a step 2 or
/// update is applied and produces no reply.
pub fn handle_sync(payload: &[u8], doc: &Doc) -> Result<Option<Vec<u8>>> {
    if payload.is_empty() {
        return Err(Error::MalformedFrame("missing sync sub-type"));
    }
    let sub_type = SyncMessageType::try_from(payload[0])?;
    let mut rest = &payload[1..];
    let body = read_var_bytes(&mut rest)?;

    match sub_type {
        SyncMessageType::SyncStep1 => {
            let diff = encode_state_as_update(doc, body)?;
            Ok(Some(create_sync_step2(&diff)))
        }
        SyncMessageType::SyncStep2 | SyncMessageType::Update => {
            apply_update(doc, body)?;
            Ok(None)
        }
    }
}
