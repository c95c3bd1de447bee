// Copyright 2020 Joyent, Inc.

//! The event stream data model: the event records broadcast to subscribers
//! and the sync record written at the head of each subscription.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// The event stream protocol version. Clients advertise this value in the
/// `messages` RPC argument; the server writes a sync record on newly accepted
/// subscriptions whose client declared a version of at least 1.
pub const PROTOCOL_VERSION: u64 = 1;

/// The `name` carried by sync records.
pub const SYNC_NAME: &str = "sync";

/// An event record broadcast to every identified subscriber.
///
/// Producers fill in `name` and `value`, and optionally `id` and `req_id`.
/// The server assigns a fresh time-ordered `req_id` when the producer omitted
/// one and stamps its own `server_id` before transmission, so subscribers
/// always receive both populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Optional monotonic sequence number assigned by the producer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Short tag identifying the event kind.
    pub name: String,
    /// Opaque payload. Any JSON value is legal here, including `false` and
    /// `null`; it is carried through unchanged.
    pub value: Value,
    /// Correlation identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    /// Identity of the originating server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl Event {
    /// Create an event with the given name and payload and no identifiers.
    pub fn new<N: Into<String>>(name: N, value: Value) -> Event {
        Event {
            id: None,
            name: name.into(),
            value,
            req_id: None,
            server_id: None,
        }
    }
}

/// The first frame written by the server on a newly accepted subscription
/// when the client advertised a protocol version of at least 1. It carries
/// the identifiers of the server's most recent broadcast, if any.
///
/// `last_req_id` and `last_id` are absent when the server has not broadcast
/// since it started; absence is preserved as-is and never coerced to a
/// default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRecord {
    /// Always [`SYNC_NAME`].
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_req_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_id: Option<u64>,
    /// Identity of the server that accepted the subscription.
    pub server_id: String,
    /// The server's protocol version.
    pub version: u64,
}
