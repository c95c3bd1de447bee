// Copyright 2020 Joyent, Inc.

//! This module provides the client side of a Fast RPC connection: request
//! issuance over an established stream and routing of response frames back to
//! the issuing call by message id.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, warn, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::protocol::{
    FastMessage, FastMessageData, FastMessageId, FastMessageServerError,
    FastMessageStatus, FastRpc,
};

/// An error resulting from an RPC call issued over an [`RpcConnection`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// The server failed the call with a Fast `ERROR` message.
    #[error("{message}")]
    Server { name: String, message: String },
    /// The connection ended before the call completed.
    #[error("connection ended before RPC call completed")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum CallFrame {
    Data(Value),
    End,
    Error(RpcError),
}

type PendingCalls = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<CallFrame>>>>;

/// A Fast RPC connection over an established stream.
///
/// The connection owns a reader task that routes inbound frames to the call
/// that issued the matching request, and a writer task that drains outbound
/// requests into the stream. Handles are cheap to clone; all clones refer to
/// the same connection.
#[derive(Clone)]
pub struct RpcConnection {
    write_tx: mpsc::UnboundedSender<FastMessage>,
    pending: PendingCalls,
    msg_ids: Arc<FastMessageId>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    log: Logger,
}

impl RpcConnection {
    /// Start an RPC connection over an established stream, spawning the
    /// reader and writer tasks that service it.
    pub fn start<S>(stream: S, log: Logger) -> RpcConnection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (msg_sink, msg_stream) = Framed::new(stream, FastRpc).split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(write_loop(
            msg_sink,
            write_rx,
            Arc::clone(&pending),
            log.clone(),
        ));
        let reader =
            tokio::spawn(read_loop(msg_stream, Arc::clone(&pending), log.clone()));

        RpcConnection {
            write_tx,
            pending,
            msg_ids: Arc::new(FastMessageId::new()),
            tasks: Arc::new(Mutex::new(vec![writer, reader])),
            log,
        }
    }

    /// Issue an RPC call. The returned [`Call`] yields the values the server
    /// emits for it until the server ends or fails the call.
    pub fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Call, RpcError> {
        let msg_id = self.msg_ids.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().insert(msg_id, tx);

        let msg = FastMessage::data(
            msg_id,
            FastMessageData::new(method.to_string(), Value::Array(args)),
        );

        if self.write_tx.send(msg).is_err() {
            self.pending.lock().unwrap().remove(&msg_id);
            return Err(RpcError::ConnectionClosed);
        }
        debug!(self.log, "issued RPC request";
            "method" => method, "msg_id" => msg_id);

        Ok(Call {
            msg_id,
            rx,
            pending: Arc::downgrade(&self.pending),
        })
    }

    /// Issue a one-shot RPC call, discarding any values the server emits, and
    /// resolve once the server ends or fails the call.
    pub async fn call_unary(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), RpcError> {
        let mut call = self.call(method, args)?;
        loop {
            match call.next().await? {
                Some(_) => (),
                None => return Ok(()),
            }
        }
    }

    /// Abort the connection: stop the reader and writer tasks, close the
    /// underlying stream, and fail every in-flight call.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);
        fail_pending(&self.pending);
    }
}

/// A single RPC call in flight on an [`RpcConnection`].
pub struct Call {
    msg_id: u32,
    rx: mpsc::UnboundedReceiver<CallFrame>,
    pending: Weak<Mutex<HashMap<u32, mpsc::UnboundedSender<CallFrame>>>>,
}

impl Call {
    /// Wait for the next value emitted by the server for this call. Resolves
    /// to `Ok(None)` once the server ends the call.
    pub async fn next(&mut self) -> Result<Option<Value>, RpcError> {
        match self.rx.recv().await {
            Some(CallFrame::Data(value)) => Ok(Some(value)),
            Some(CallFrame::End) => Ok(None),
            Some(CallFrame::Error(err)) => Err(err),
            None => Err(RpcError::ConnectionClosed),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        // Deregister an abandoned call so frames for it are no longer routed.
        if let Some(pending) = self.pending.upgrade() {
            pending.lock().unwrap().remove(&self.msg_id);
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<Framed<S, FastRpc>, FastMessage>,
    mut write_rx: mpsc::UnboundedReceiver<FastMessage>,
    pending: PendingCalls,
    log: Logger,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Some(msg) = write_rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            warn!(log, "failed to write Fast message"; "err" => %e);
            break;
        }
    }
    // A request may have been queued after the reader already gave up; make
    // sure nothing waits on a connection that can no longer carry frames.
    fail_pending(&pending);
}

async fn read_loop<S>(
    mut messages: SplitStream<Framed<S, FastRpc>>,
    pending: PendingCalls,
    log: Logger,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Some(result) = messages.next().await {
        match result {
            Ok(msg) => route_msg(msg, &pending, &log),
            Err(e) => {
                warn!(log, "failed to read Fast message"; "err" => %e);
                break;
            }
        }
    }
    fail_pending(&pending);
}

fn route_msg(msg: FastMessage, pending: &PendingCalls, log: &Logger) {
    let mut pending = pending.lock().unwrap();
    let tx = match pending.get(&msg.id) {
        Some(tx) => tx.clone(),
        None => {
            debug!(log, "no caller registered for message"; "msg_id" => msg.id);
            return;
        }
    };

    match msg.status {
        FastMessageStatus::Data => match msg.data.d {
            // Servers emit values batched into an array per DATA message.
            Value::Array(values) => {
                for value in values {
                    let _ = tx.send(CallFrame::Data(value));
                }
            }
            other => {
                let _ = tx.send(CallFrame::Data(other));
            }
        },
        FastMessageStatus::End => {
            let _ = tx.send(CallFrame::End);
            pending.remove(&msg.id);
        }
        FastMessageStatus::Error => {
            let err: FastMessageServerError =
                serde_json::from_value(msg.data.d)
                    .unwrap_or_else(|_| unspecified_error());
            let _ = tx.send(CallFrame::Error(RpcError::Server {
                name: err.name,
                message: err.message,
            }));
            pending.remove(&msg.id);
        }
    }
}

fn fail_pending(pending: &PendingCalls) {
    let mut pending = pending.lock().unwrap();
    for (_, tx) in pending.drain() {
        let _ = tx.send(CallFrame::Error(RpcError::ConnectionClosed));
    }
}

fn unspecified_error() -> FastMessageServerError {
    FastMessageServerError::new(
        "UnspecifiedServerError",
        "Server reported unspecified error.",
    )
}
