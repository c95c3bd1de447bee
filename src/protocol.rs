// Copyright 2020 Joyent, Inc.

//! Fast message framing for the event stream service. Nothing in this module
//! is needed for normal use of the server or client; it is public so that
//! handcrafted RPC requests can be issued against a running server.

use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use crc16::*;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

// Byte offsets of the Fast packet fields. The layout is fixed by the
// protocol: version, type, and status bytes, then big-endian message id,
// CRC16 of the payload, payload length, and the JSON payload itself.
const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0x7;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

/// The size of a Fast message header
pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_2: u8 = 0x2;
const FP_VERSION_CURRENT: u8 = FP_VERSION_2;

// Message ids are allocated sequentially from a circular 31-bit space.
const FP_MSGID_MASK: u32 = 0x7fff_ffff;

/// Allocator for Fast message ids. Every RPC request on a connection gets a
/// fresh id from `next_id`, which walks the circular 31-bit id space and can
/// be shared freely between tasks.
#[derive(Default)]
pub struct FastMessageId(AtomicU32);

impl FastMessageId {
    /// Creates a new FastMessageId
    pub fn new() -> Self {
        FastMessageId(AtomicU32::new(0x0))
    }

    /// Returns the next Fast message id, wrapping within the circular 31-bit
    /// message id space.
    pub fn next_id(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) & FP_MSGID_MASK
    }
}

/// Why a buffer could not be decoded as a Fast message.
#[derive(Debug)]
pub enum FastParseError {
    /// The buffer ends before the message does. Carries the number of bytes
    /// that were available; reading more data may complete the message.
    NotEnoughBytes(usize),
    /// The buffer holds something other than a well-formed Fast message.
    IOError(Error),
}

impl From<io::Error> for FastParseError {
    fn from(error: io::Error) -> Self {
        FastParseError::IOError(error)
    }
}

impl From<FastParseError> for Error {
    fn from(pfr: FastParseError) -> Self {
        match pfr {
            FastParseError::NotEnoughBytes(have) => Error::new(
                ErrorKind::UnexpectedEof,
                format!("incomplete Fast message ({} bytes available)", have),
            ),
            FastParseError::IOError(e) => e,
        }
    }
}

/// The failure payload carried by a Fast `ERROR` message: a short error name
/// plus a human-readable message. The validation diagnostics the event
/// stream server produces travel in the `message` field.
#[derive(Debug, Deserialize, Serialize)]
pub struct FastMessageServerError {
    pub name: String,
    pub message: String,
}

impl FastMessageServerError {
    pub fn new(name: &str, message: &str) -> Self {
        FastMessageServerError {
            name: String::from(name),
            message: String::from(message),
        }
    }
}

impl From<FastMessageServerError> for Error {
    fn from(err: FastMessageServerError) -> Self {
        Error::new(ErrorKind::Other, format!("{}: {}", err.name, err.message))
    }
}

/// Wire encoding of a Fast payload. JSON is the only encoding the protocol
/// defines.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone)]
pub enum FastMessageType {
    Json = 1,
}

/// The role a Fast message plays within an RPC call: `Data` carries a
/// request or a batch of emitted values, `End` completes the call, and
/// `Error` fails it.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone)]
pub enum FastMessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

/// The `m` portion of a Fast payload: the RPC method the message belongs to
/// and a microsecond timestamp taken when the message was built.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct FastMessageMetaData {
    pub uts: u64,
    pub name: String,
}

impl FastMessageMetaData {
    pub fn new(method: String) -> FastMessageMetaData {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let uts =
            elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros());

        FastMessageMetaData { uts, name: method }
    }
}

/// A Fast payload: method metadata under `m` and JSON data under `d`. For a
/// request, `d` is the argument array; for an event stream frame, an array
/// of emitted records; for an error, a [`FastMessageServerError`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct FastMessageData {
    pub m: FastMessageMetaData,
    pub d: Value,
}

impl FastMessageData {
    pub fn new(method: String, d: Value) -> FastMessageData {
        FastMessageData {
            m: FastMessageMetaData::new(method),
            d,
        }
    }
}

/// A single Fast protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct FastMessage {
    pub msg_type: FastMessageType,
    pub status: FastMessageStatus,
    /// Identifier correlating the message with the RPC call it belongs to.
    pub id: u32,
    pub data: FastMessageData,
}

impl FastMessage {
    /// Decode the leading Fast message in `buf`, returning it along with the
    /// number of bytes it occupied. `NotEnoughBytes` means the buffer holds
    /// only a prefix of a message and more data must be read first.
    pub fn parse(buf: &[u8]) -> Result<(FastMessage, usize), FastParseError> {
        if buf.len() < FP_HEADER_SZ {
            return Err(FastParseError::NotEnoughBytes(buf.len()));
        }

        let msg_type = FastMessageType::from_u8(buf[FP_OFF_TYPE])
            .ok_or_else(|| malformed("unknown Fast message type"))?;
        let status = FastMessageStatus::from_u8(buf[FP_OFF_STATUS])
            .ok_or_else(|| malformed("unknown Fast message status"))?;
        let id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
        let expected_crc =
            BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4])
                as usize;

        let frame_len = FP_HEADER_SZ + data_len;
        if buf.len() < frame_len {
            return Err(FastParseError::NotEnoughBytes(buf.len()));
        }

        let payload = &buf[FP_OFF_DATA..frame_len];
        if u32::from(State::<ARC>::calculate(payload)) != expected_crc {
            return Err(malformed("Fast payload failed its CRC check"));
        }
        let data = decode_payload(payload)?;

        let msg = FastMessage {
            msg_type,
            status,
            id,
            data,
        };

        Ok((msg, frame_len))
    }

    /// A `DATA` message: an RPC request, or a batch of values emitted for
    /// one.
    pub fn data(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Data,
            id: msg_id,
            data,
        }
    }

    /// An `END` message completing the call `msg_id`, carrying the empty
    /// value batch the protocol requires.
    pub fn end(msg_id: u32, method: String) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            data: FastMessageData::new(method, Value::Array(vec![])),
        }
    }

    /// An `ERROR` message failing the call `msg_id`.
    pub fn error(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Error,
            id: msg_id,
            data,
        }
    }
}

fn malformed(reason: &str) -> FastParseError {
    FastParseError::IOError(Error::new(ErrorKind::InvalidData, reason))
}

fn decode_payload(payload: &[u8]) -> Result<FastMessageData, FastParseError> {
    let text = str::from_utf8(payload)
        .map_err(|_| malformed("Fast payload is not valid UTF-8"))?;
    serde_json::from_str(text)
        .map_err(|_| malformed("Fast payload is not valid JSON"))
}

/// This type implements the functions necessary for the Fast protocol framing.
pub struct FastRpc;

impl Decoder for FastRpc {
    type Item = FastMessage;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastMessage>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        match FastMessage::parse(buf) {
            Ok((parsed_msg, consumed)) => {
                buf.advance(consumed);
                Ok(Some(parsed_msg))
            }
            Err(FastParseError::NotEnoughBytes(_)) => {
                // Not enough bytes available yet so we need to return
                // Ok(None) to let the Framed instance know to read more
                // data before calling this function again.
                Ok(None)
            }
            Err(err) => {
                let msg = format!(
                    "failed to parse Fast message: {}",
                    Error::from(err)
                );
                Err(Error::new(ErrorKind::Other, msg))
            }
        }
    }
}

impl Encoder<FastMessage> for FastRpc {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: FastMessage,
        buf: &mut BytesMut,
    ) -> Result<(), io::Error> {
        encode_msg(&item, buf)
    }
}

/// Encode a `FastMessage` into a byte buffer.
pub(crate) fn encode_msg(
    msg: &FastMessage,
    buf: &mut BytesMut,
) -> Result<(), Error> {
    let msg_type_u8 = msg.msg_type.to_u8().ok_or_else(|| {
        Error::new(ErrorKind::InvalidInput, "message type is not encodable")
    })?;
    let status_u8 = msg.status.to_u8().ok_or_else(|| {
        Error::new(ErrorKind::InvalidInput, "message status is not encodable")
    })?;
    let data_str = serde_json::to_string(&msg.data).map_err(|e| {
        Error::new(
            ErrorKind::InvalidData,
            format!("failed to encode Fast payload as JSON: {}", e),
        )
    })?;
    let data_len = data_str.len();

    buf.reserve(FP_HEADER_SZ + data_len);
    buf.put_u8(FP_VERSION_CURRENT);
    buf.put_u8(msg_type_u8);
    buf.put_u8(status_u8);
    buf.put_u32(msg.id);
    buf.put_u32(u32::from(State::<ARC>::calculate(data_str.as_bytes())));
    buf.put_u32(data_len as u32);
    buf.put_slice(data_str.as_bytes());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};
    use rand::distributions::Alphanumeric;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use serde_json::json;

    use crate::message::{Event, SyncRecord, PROTOCOL_VERSION, SYNC_NAME};

    fn ident<G: Gen>(g: &mut G) -> String {
        let len = 1 + (g.gen::<u8>() % 16) as usize;
        (0..len).map(|_| g.sample(Alphanumeric)).collect()
    }

    fn event_value<G: Gen>(g: &mut G) -> Value {
        match g.gen_range(0, 4) {
            0 => Value::Null,
            1 => Value::Bool(false),
            2 => Value::String(ident(g)),
            _ => json!({ "enabled": g.gen::<bool>(), "seq": g.gen::<u32>() }),
        }
    }

    fn event_frame<G: Gen>(g: &mut G) -> Value {
        let names = ["update_name", "informational", "heartbeat"];
        let event = Event {
            id: if g.gen::<bool>() {
                Some(u64::from(g.gen::<u32>()))
            } else {
                None
            },
            name: names.choose(g).unwrap().to_string(),
            value: event_value(g),
            req_id: Some(ident(g)),
            server_id: Some(ident(g)),
        };
        serde_json::to_value(&event).unwrap()
    }

    fn sync_frame<G: Gen>(g: &mut G) -> Value {
        let sync = SyncRecord {
            name: SYNC_NAME.to_string(),
            last_req_id: if g.gen::<bool>() { Some(ident(g)) } else { None },
            last_id: if g.gen::<bool>() {
                Some(u64::from(g.gen::<u32>()))
            } else {
                None
            },
            server_id: ident(g),
            version: PROTOCOL_VERSION,
        };
        serde_json::to_value(&sync).unwrap()
    }

    impl Arbitrary for FastMessageStatus {
        fn arbitrary<G: Gen>(g: &mut G) -> FastMessageStatus {
            match g.gen_range(0, 3) {
                0 => FastMessageStatus::Data,
                1 => FastMessageStatus::End,
                _ => FastMessageStatus::Error,
            }
        }
    }

    impl Arbitrary for FastMessageData {
        // The payload shapes this crate puts on the wire: subscribe and ping
        // requests, event and sync frames, and error payloads.
        fn arbitrary<G: Gen>(g: &mut G) -> FastMessageData {
            let (method, d) = match g.gen_range(0, 5) {
                0 => (
                    "messages",
                    json!([{
                        "client_id": ident(g),
                        "version": PROTOCOL_VERSION,
                    }]),
                ),
                1 => ("ping", json!([{ "req_id": ident(g) }])),
                2 => ("messages", Value::Array(vec![event_frame(g)])),
                3 => ("messages", Value::Array(vec![sync_frame(g)])),
                _ => (
                    "messages",
                    json!({ "name": "FastError", "message": ident(g) }),
                ),
            };
            FastMessageData::new(method.to_string(), d)
        }
    }

    impl Arbitrary for FastMessage {
        fn arbitrary<G: Gen>(g: &mut G) -> FastMessage {
            FastMessage {
                msg_type: FastMessageType::Json,
                status: FastMessageStatus::arbitrary(g),
                // Ids as clients allocate them: the circular 31-bit space.
                id: g.gen::<u32>() & 0x7fff_ffff,
                data: FastMessageData::arbitrary(g),
            }
        }
    }

    #[derive(Clone, Debug)]
    struct FrameCount(u8);

    impl Arbitrary for FrameCount {
        fn arbitrary<G: Gen>(g: &mut G) -> FrameCount {
            FrameCount(g.gen_range(1, 32))
        }
    }

    quickcheck! {
        fn prop_fast_message_roundtrip(msg: FastMessage) -> bool {
            let mut write_buf = BytesMut::new();
            match encode_msg(&msg, &mut write_buf) {
                Ok(_) => {
                    match FastMessage::parse(&write_buf) {
                        Ok((decoded_msg, consumed)) => {
                            decoded_msg == msg && consumed == write_buf.len()
                        }
                        Err(_) => false
                    }
                },
                Err(_) => false
            }
        }
    }

    quickcheck! {
        fn prop_fast_message_decoding(msg: FastMessage, frame_count: FrameCount) -> bool {
            let mut write_buf = BytesMut::new();
            let mut fast_rpc = FastRpc;

            for _ in 0..frame_count.0 {
                if fast_rpc.encode(msg.clone(), &mut write_buf).is_err() {
                    return false;
                }
            }

            let mut decoded_count = 0;
            loop {
                match fast_rpc.decode(&mut write_buf) {
                    Ok(Some(decoded_msg)) => {
                        if decoded_msg != msg {
                            return false;
                        }
                        decoded_count += 1;
                    }
                    Ok(None) => break,
                    Err(_) => return false,
                }
            }

            decoded_count == frame_count.0 as usize && write_buf.is_empty()
        }
    }

    quickcheck! {
        fn prop_partial_buffer_needs_more_bytes(msg: FastMessage) -> bool {
            let mut write_buf = BytesMut::new();
            if encode_msg(&msg, &mut write_buf).is_err() {
                return false;
            }

            let truncated = &write_buf[..write_buf.len() - 1];
            match FastMessage::parse(truncated) {
                Err(FastParseError::NotEnoughBytes(_)) => true,
                _ => false
            }
        }
    }
}
