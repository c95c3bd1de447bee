// Copyright 2020 Joyent, Inc.

//! This module provides the event stream server. It accepts Fast RPC
//! connections, registers one subscription per client id through the
//! `messages` RPC, and broadcasts event records to every live subscription.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use slog::{debug, info, o, warn, Drain, Logger};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::message::{Event, SyncRecord, PROTOCOL_VERSION, SYNC_NAME};
use crate::protocol::{
    FastMessage, FastMessageData, FastMessageServerError, FastMessageStatus,
    FastRpc,
};

/// The streaming RPC through which clients subscribe.
const RPC_MESSAGES: &str = "messages";
/// The one-shot liveness probe RPC.
const RPC_PING: &str = "ping";

/// Configuration for [`Server`].
pub struct ServerConfig {
    /// Identity stamped on every outbound event, typically a UUID.
    pub server_id: String,
    /// Logger for server activity. Falls back to the `slog-stdlog` drain when
    /// absent.
    pub log: Option<Logger>,
}

/// An error arising from a [`Server`] operation.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("event name must be a non-empty string")]
    InvalidEventName,
    #[error("server is already listening")]
    AlreadyListening,
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A point-in-time view of the server's registry and last broadcast
/// identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState {
    /// Client ids of the live subscriptions, in registration order.
    pub clients: Vec<String>,
    pub server_id: String,
    /// `req_id` of the most recently broadcast event.
    pub last_req_id: Option<String>,
    /// Sequence number of the most recent event that carried one.
    pub last_id: Option<u64>,
}

// One registered subscription: the client-supplied id, the connection and
// request the subscription is bound to, the protocol version the client
// advertised, and the connection's write queue.
struct Subscription {
    client_id: String,
    conn_id: u64,
    msg_id: u32,
    version: Option<u64>,
    tx: mpsc::UnboundedSender<FastMessage>,
}

#[derive(Default)]
struct Registry {
    subscriptions: Vec<Subscription>,
    last_req_id: Option<String>,
    last_id: Option<u64>,
}

struct ServerInner {
    server_id: String,
    registry: Mutex<Registry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    next_conn_id: AtomicU64,
    log: Logger,
}

/// The event stream server.
pub struct Server {
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Create a server with the given configuration. The server does not
    /// accept connections until [`Server::listen`] is called.
    pub fn new(config: ServerConfig) -> Server {
        let log = config.log.unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        let log = log.new(o!("server_id" => config.server_id.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Server {
            inner: Arc::new(ServerInner {
                server_id: config.server_id,
                registry: Mutex::new(Registry::default()),
                shutdown_tx,
                shutdown_rx,
                next_conn_id: AtomicU64::new(0),
                log,
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the given port and begin accepting subscription connections.
    /// Returns the bound address; a port of 0 selects an ephemeral port.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, ServerError> {
        if self.accept_task.lock().unwrap().is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!(self.inner.log, "listening for stream subscriptions";
            "address" => %local_addr);

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.inner)));
        *self.accept_task.lock().unwrap() = Some(task);

        Ok(local_addr)
    }

    /// Broadcast an event to every live subscription.
    ///
    /// The event's `req_id` is assigned (time-ordered unique id) when the
    /// caller omitted one, and `server_id` is stamped with this server's
    /// identity. Delivery is an enqueue per subscription; a failure to
    /// enqueue for one subscription is logged and does not affect the others.
    pub fn send(&self, event: Event) -> Result<(), ServerError> {
        if event.name.is_empty() {
            return Err(ServerError::InvalidEventName);
        }

        let mut event = event;
        let req_id = event
            .req_id
            .take()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        event.req_id = Some(req_id.clone());
        event.server_id = Some(self.inner.server_id.clone());

        let value = serde_json::to_value(&event)?;

        // Snapshot the registry so writes happen outside the lock and
        // concurrent removals cannot disturb the iteration.
        let targets: Vec<(String, u32, mpsc::UnboundedSender<FastMessage>)> = {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.last_req_id = Some(req_id);
            if event.id.is_some() {
                registry.last_id = event.id;
            }
            registry
                .subscriptions
                .iter()
                .map(|sub| (sub.client_id.clone(), sub.msg_id, sub.tx.clone()))
                .collect()
        };

        debug!(self.inner.log, "broadcasting event";
            "name" => %event.name, "subscriptions" => targets.len());

        for (client_id, msg_id, tx) in targets {
            let frame = FastMessage::data(
                msg_id,
                FastMessageData::new(
                    RPC_MESSAGES.to_string(),
                    Value::Array(vec![value.clone()]),
                ),
            );
            if tx.send(frame).is_err() {
                warn!(self.inner.log, "failed to write event to subscription";
                    "client_id" => %client_id);
            }
        }

        Ok(())
    }

    /// Shut the server down: end every subscription's channel, stop
    /// accepting, and close the listening socket. Resolves once the listening
    /// socket has closed.
    pub async fn close(&self) {
        let subscriptions = {
            let mut registry = self.inner.registry.lock().unwrap();
            std::mem::take(&mut registry.subscriptions)
        };
        for sub in subscriptions {
            let _ = sub
                .tx
                .send(FastMessage::end(sub.msg_id, RPC_MESSAGES.to_string()));
        }

        let _ = self.inner.shutdown_tx.send(true);

        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(self.inner.log, "server closed");
    }

    /// A snapshot of the registry and last broadcast identifiers.
    pub fn state(&self) -> ServerState {
        let registry = self.inner.registry.lock().unwrap();
        ServerState {
            clients: registry
                .subscriptions
                .iter()
                .map(|sub| sub.client_id.clone())
                .collect(),
            server_id: self.inner.server_id.clone(),
            last_req_id: registry.last_req_id.clone(),
            last_id: registry.last_id,
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let _ = self.inner.shutdown_tx.send(true);
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<ServerInner>) {
    let mut shutdown = inner.shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let conn_id =
                        inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    debug!(inner.log, "accepted connection";
                        "peer" => %peer, "conn_id" => conn_id);
                    tokio::spawn(handle_connection(
                        socket,
                        conn_id,
                        Arc::clone(&inner),
                    ));
                }
                Err(e) => {
                    warn!(inner.log, "failed to accept socket"; "err" => %e);
                }
            },
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    conn_id: u64,
    inner: Arc<ServerInner>,
) {
    let (mut msg_sink, mut msg_stream) = Framed::new(socket, FastRpc).split();
    let (tx, mut write_rx) = mpsc::unbounded_channel::<FastMessage>();

    let writer_log = inner.log.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = write_rx.recv().await {
            if let Err(e) = msg_sink.send(msg).await {
                debug!(writer_log, "failed to write to connection";
                    "err" => %e);
                break;
            }
        }
    });

    let mut shutdown = inner.shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            incoming = msg_stream.next() => match incoming {
                Some(Ok(msg)) => handle_request(msg, conn_id, &tx, &inner),
                Some(Err(e)) => {
                    debug!(inner.log, "connection read failed";
                        "conn_id" => conn_id, "err" => %e);
                    break;
                }
                None => break,
            },
        }
    }

    remove_conn_subscriptions(conn_id, &inner);
    drop(tx);
    let _ = writer.await;
}

enum Reply {
    // The call stays open; frames are written as events are broadcast.
    Open,
    End,
}

fn handle_request(
    msg: FastMessage,
    conn_id: u64,
    tx: &mpsc::UnboundedSender<FastMessage>,
    inner: &Arc<ServerInner>,
) {
    // Requests are DATA messages; anything else is a protocol violation from
    // the peer.
    if msg.status != FastMessageStatus::Data {
        debug!(inner.log, "ignoring non-DATA request"; "msg_id" => msg.id);
        return;
    }

    let method = msg.data.m.name.clone();
    let result = match method.as_str() {
        RPC_MESSAGES => handle_messages(&msg, conn_id, tx, inner),
        RPC_PING => handle_ping(&msg, inner),
        _ => Err(FastMessageServerError::new(
            "FastError",
            &format!("Unsupported function: {}", method),
        )),
    };

    match result {
        Ok(Reply::Open) => (),
        Ok(Reply::End) => {
            let _ = tx.send(FastMessage::end(msg.id, method));
        }
        Err(err) => {
            let value = serde_json::to_value(&err).unwrap_or_else(|_| {
                serde_json::json!({
                    "name": "FastError",
                    "message": "internal error",
                })
            });
            let _ = tx.send(FastMessage::error(
                msg.id,
                FastMessageData::new(method, value),
            ));
        }
    }
}

fn handle_messages(
    msg: &FastMessage,
    conn_id: u64,
    tx: &mpsc::UnboundedSender<FastMessage>,
    inner: &Arc<ServerInner>,
) -> Result<Reply, FastMessageServerError> {
    let opts = validate_messages_args(&msg.data.d)?;

    // Validation guarantees a non-empty client_id string.
    let client_id = match opts.get("client_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            return Err(FastMessageServerError::new(
                "FastError",
                MSG_CLIENT_ID,
            ))
        }
    };
    let version = opts.get("version").and_then(Value::as_f64);

    // Displace any existing subscription for this client id and bind the new
    // channel. The sync record must be the first frame on the new channel, so
    // it is enqueued inside the registry critical section; enqueueing does
    // not touch the socket.
    let evicted = {
        let mut registry = inner.registry.lock().unwrap();

        let evicted_idx = registry
            .subscriptions
            .iter()
            .position(|sub| sub.client_id == client_id);
        let evicted =
            evicted_idx.map(|idx| registry.subscriptions.remove(idx));

        if version.map_or(false, |v| v >= 1.0) {
            let sync = SyncRecord {
                name: SYNC_NAME.to_string(),
                last_req_id: registry.last_req_id.clone(),
                last_id: registry.last_id,
                server_id: inner.server_id.clone(),
                version: PROTOCOL_VERSION,
            };
            match serde_json::to_value(&sync) {
                Ok(value) => {
                    let _ = tx.send(FastMessage::data(
                        msg.id,
                        FastMessageData::new(
                            RPC_MESSAGES.to_string(),
                            Value::Array(vec![value]),
                        ),
                    ));
                }
                Err(e) => {
                    warn!(inner.log, "failed to encode sync record";
                        "err" => %e);
                }
            }
        }

        registry.subscriptions.push(Subscription {
            client_id: client_id.clone(),
            conn_id,
            msg_id: msg.id,
            version: version.map(|v| v as u64),
            tx: tx.clone(),
        });

        evicted
    };

    if let Some(old) = evicted {
        warn!(inner.log, "duplicate client_id; displacing existing subscription";
            "client_id" => %old.client_id, "old_conn_id" => old.conn_id);
        let _ = old
            .tx
            .send(FastMessage::end(old.msg_id, RPC_MESSAGES.to_string()));
    }

    info!(inner.log, "registered subscription";
        "client_id" => %client_id, "version" => ?version);
    Ok(Reply::Open)
}

fn handle_ping(
    msg: &FastMessage,
    inner: &Arc<ServerInner>,
) -> Result<Reply, FastMessageServerError> {
    let opts = validate_ping_args(&msg.data.d)?;

    let req_id = opts
        .get("req_id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    info!(inner.log, "ping"; "req_id" => %req_id);

    Ok(Reply::End)
}

const MSG_CLIENT_ID: &str = r#"clients must provide their "client_id""#;

fn validate_messages_args(
    d: &Value,
) -> Result<&Map<String, Value>, FastMessageServerError> {
    let args = match d.as_array() {
        Some(args) if args.len() == 1 => args,
        _ => {
            return Err(FastMessageServerError::new(
                "FastError",
                r#""messages" RPC expects one argument"#,
            ))
        }
    };
    let opts = args[0].as_object().ok_or_else(|| {
        FastMessageServerError::new(
            "FastError",
            r#""messages" RPC expects an options object"#,
        )
    })?;

    match opts.get("client_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(opts),
        _ => Err(FastMessageServerError::new("FastError", MSG_CLIENT_ID)),
    }
}

fn validate_ping_args(
    d: &Value,
) -> Result<&Map<String, Value>, FastMessageServerError> {
    let args = match d.as_array() {
        Some(args) if args.len() == 1 => args,
        _ => {
            return Err(FastMessageServerError::new(
                "FastError",
                r#""ping" RPC expects one argument"#,
            ))
        }
    };
    let opts = args[0].as_object().ok_or_else(|| {
        FastMessageServerError::new(
            "FastError",
            r#""ping" RPC expects an options object"#,
        )
    })?;

    if let Some(req_id) = opts.get("req_id") {
        if !req_id.is_string() {
            return Err(FastMessageServerError::new(
                "FastError",
                r#""req_id" must be a string if provided"#,
            ));
        }
    }

    Ok(opts)
}

fn remove_conn_subscriptions(conn_id: u64, inner: &Arc<ServerInner>) {
    let removed: Vec<Subscription> = {
        let mut registry = inner.registry.lock().unwrap();
        let (gone, kept): (Vec<Subscription>, Vec<Subscription>) = registry
            .subscriptions
            .drain(..)
            .partition(|sub| sub.conn_id == conn_id);
        registry.subscriptions = kept;
        gone
    };

    for sub in removed {
        debug!(inner.log, "subscription channel ended";
            "client_id" => %sub.client_id, "version" => ?sub.version);
    }
}
