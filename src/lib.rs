// Copyright 2020 Joyent, Inc.

//! fast_messages: one-to-many event broadcast over the Fast RPC protocol
//!
//! This crate provides the push channel used between a central authority and
//! a fleet of agents. A single server fans out event records to every
//! connected and identified client; each client maintains a durable,
//! auto-reconnecting subscription, so a restart of either side is recovered
//! transparently.
//!
//! Protocol overview
//!
//! The service is carried by the Fast protocol over TCP. The server listens
//! on a well-known port and exposes two RPC methods:
//!
//! | Method     | Kind      | Argument |
//! | ---------- | --------- | -------- |
//! | `messages` | streaming | `{ client_id: string, version?: number }` |
//! | `ping`     | unary     | `{ req_id?: string }` |
//!
//! A client subscribes by issuing `messages` with its `client_id`. The call
//! stays open for the life of the subscription; every event subsequently
//! broadcast by the server arrives as a frame on it. At most one
//! subscription exists per `client_id`: a second subscription with the same
//! id displaces the first, whose call is ended.
//!
//! When the client advertised a protocol `version` of at least 1, the first
//! frame on the new subscription is a _sync record_ carrying the identifiers
//! of the server's most recent broadcast:
//!
//! ```json
//! { "name": "sync", "last_req_id": "...", "last_id": 17,
//!   "server_id": "...", "version": 1 }
//! ```
//!
//! `last_req_id` and `last_id` are absent when the server has not broadcast
//! since it started. Every later frame is an event record:
//!
//! ```json
//! { "id": 4, "name": "update_name", "value": "foo",
//!   "req_id": "...", "server_id": "..." }
//! ```
//!
//! `req_id` is assigned by the server when the producer omitted one, and
//! `server_id` is always stamped with the identity of the sending server.
//!
//! `ping` is a liveness probe: the server logs it and completes the call
//! with no reply data.
//!
//! ### Client connection lifecycle
//!
//! The client is a finite state machine:
//!
//! | State              | Description |
//! | ------------------ | ----------- |
//! | `stopped`          | Initial and final state. |
//! | `connecting`       | A TCP connect to the server is in flight. |
//! | `connecting.error` | The connect failed; a backoff timer is armed. |
//! | `connected`        | The socket and RPC connection are up. |
//! | `started`          | The `messages` RPC is being issued. |
//! | `started.waiting`  | Awaiting the sync record. |
//! | `started.ready`    | Events are delivered to the consumer. |
//! | `restart`          | Tearing down a failed connection. |
//! | `closing`          | Tearing down at the consumer's request. |
//!
//! Connect retries back off on a fixed schedule (none, then one second, then
//! five seconds) with no bound on the attempt count. Once streaming has been
//! requested the intent is sticky: after any transport failure the machine
//! re-enters `connecting` on its own and resumes delivery without further
//! consumer involvement. Messages broadcast while a client is disconnected
//! are lost; there is no replay.

#![allow(missing_docs)]

pub mod client;
pub mod message;
pub mod protocol;
pub mod rpc;
pub mod server;

pub use message::PROTOCOL_VERSION;
