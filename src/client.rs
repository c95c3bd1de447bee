// Copyright 2020 Joyent, Inc.

//! This module provides the streaming client: a durable subscription to an
//! event stream server, maintained by a finite state machine that drives TCP
//! connect, RPC establishment, the initial sync exchange, message delivery,
//! failure detection, and backoff-driven reconnect.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use slog::{debug, info, o, warn, Drain, Level, Logger};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::message::{Event, SyncRecord, PROTOCOL_VERSION};
use crate::rpc::{Call, RpcConnection, RpcError};

/// Delay before TCP keepalive probes are sent on an established connection.
const KEEPALIVE_DELAY: Duration = Duration::from_secs(10);

/// Configuration for [`StreamClient`].
pub struct ClientConfig {
    /// Identity presented to the server; at most one subscription per
    /// client id exists server-side at a time.
    pub client_id: String,
    pub host: String,
    pub port: u16,
    /// Logger for client activity. Falls back to the `slog-stdlog` drain when
    /// absent.
    pub log: Option<Logger>,
}

/// An error arising from a [`StreamClient`] operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No RPC connection exists yet.
    #[error("stream not connected")]
    NotConnected,
    /// An RPC call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Notifications delivered to the consumer of a [`StreamClient`].
#[derive(Debug)]
pub enum ClientEvent {
    /// The first connection was established. Fires at most once per client
    /// lifetime; reconnects do not repeat it.
    Connect,
    /// The subscription reached the ready state. Fires at most once per
    /// client lifetime.
    Start,
    /// An event record arrived on the subscription.
    Message(Event),
    /// The client was closed.
    Close,
    /// The state machine entered a new state.
    StateChanged(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Connecting,
    ConnectingError,
    Connected,
    Started,
    StartedWaiting,
    StartedReady,
    Restart,
    Closing,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Connecting => "connecting",
            State::ConnectingError => "connecting.error",
            State::Connected => "connected",
            State::Started => "started",
            State::StartedWaiting => "started.waiting",
            State::StartedReady => "started.ready",
            State::Restart => "restart",
            State::Closing => "closing",
        }
    }
}

enum Command {
    Connect,
    Start,
    Close,
    Ping(oneshot::Sender<Result<(), ClientError>>),
}

// Inputs a streaming state waits on: a frame from the subscription call or a
// consumer command.
enum Input {
    Frame(Result<Option<Value>, RpcError>),
    Cmd(Option<Command>),
}

/// Reconnect backoff schedule, keyed by the connect attempt count.
fn backoff(attempt: u32) -> (Duration, Level) {
    match attempt {
        0..=1 => (Duration::from_millis(0), Level::Info),
        2..=9 => (Duration::from_millis(1000), Level::Warning),
        _ => (Duration::from_millis(5000), Level::Error),
    }
}

struct Shared {
    client_id: String,
    state: Mutex<State>,
    server_state: Mutex<Option<SyncRecord>>,
    log: Logger,
}

/// A durable subscription to an event stream server.
///
/// The client is a handle onto a state machine running in its own task. The
/// machine starts in the `stopped` state; [`StreamClient::connect`] begins
/// connection maintenance, and once [`StreamClient::start`] has been called
/// the intent to stream is sticky: the machine re-establishes the
/// subscription after any failure without further consumer involvement.
///
/// Must be created from within a tokio runtime.
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl StreamClient {
    /// Create a streaming client along with the channel its notifications
    /// are delivered on.
    pub fn new(
        config: ClientConfig,
    ) -> (StreamClient, mpsc::UnboundedReceiver<ClientEvent>) {
        let log = config.log.unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        let log = log.new(o!("client_id" => config.client_id.clone()));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            client_id: config.client_id,
            state: Mutex::new(State::Stopped),
            server_state: Mutex::new(None),
            log,
        });

        let machine = Machine {
            shared: Arc::clone(&shared),
            host: config.host,
            port: config.port,
            commands: command_rx,
            events: event_tx,
            state: State::Stopped,
            attempt: 0,
            rpc: None,
            call: None,
            emitted_connect: false,
            emitted_start: false,
        };
        tokio::spawn(machine.run());

        (
            StreamClient {
                commands: command_tx,
                shared,
            },
            event_rx,
        )
    }

    /// The name of the machine's current state, for observability.
    pub fn state_name(&self) -> &'static str {
        self.shared.state.lock().unwrap().name()
    }

    /// The sync record received on the current subscription, if any.
    pub fn server_state(&self) -> Option<SyncRecord> {
        self.shared.server_state.lock().unwrap().clone()
    }

    /// Begin maintaining the subscription.
    ///
    /// # Panics
    ///
    /// Panics unless the machine is in the `stopped` state.
    pub fn connect(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            assert!(
                *state == State::Stopped,
                "connect() is only valid in the stopped state (state: {})",
                state.name()
            );
            // Reflect the transition immediately so calls made before the
            // machine task has run see the connecting state.
            *state = State::Connecting;
        }
        self.send_command(Command::Connect);
    }

    /// Request streaming. Once called, streaming intent is sticky across
    /// reconnects.
    ///
    /// # Panics
    ///
    /// Panics unless the machine is in the `connected` state.
    pub fn start(&self) {
        let state = *self.shared.state.lock().unwrap();
        assert!(
            state == State::Connected,
            "start() is only valid in the connected state (state: {})",
            state.name()
        );
        self.send_command(Command::Start);
    }

    /// Shut the client down from whatever state it is in.
    ///
    /// # Panics
    ///
    /// Panics if the machine is already stopped.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            assert!(
                *state != State::Stopped,
                "close() called while already stopped"
            );
            *state = State::Closing;
        }
        self.send_command(Command::Close);
    }

    /// Probe server liveness with a one-shot `ping` RPC. Resolves with
    /// [`ClientError::NotConnected`] when no RPC connection exists yet, and
    /// otherwise with the outcome of the RPC. Resolution happens exactly
    /// once.
    ///
    /// # Panics
    ///
    /// Panics if the machine is stopped.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let state = *self.shared.state.lock().unwrap();
        assert!(state != State::Stopped, "ping() called while stopped");

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Ping(reply_tx));
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::NotConnected),
        }
    }

    fn send_command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(self.shared.log, "client machine is gone; command dropped");
        }
    }
}

// The state machine. One task owns it; every transition and every I/O
// callback runs on that task, so no two transitions execute concurrently.
struct Machine {
    shared: Arc<Shared>,
    host: String,
    port: u16,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    // The machine's own dispatch state. The copy in `shared` exists for the
    // handle's assertions and observability; entry points update it
    // optimistically, so dispatch must not depend on it.
    state: State,
    attempt: u32,
    rpc: Option<RpcConnection>,
    call: Option<Call>,
    emitted_connect: bool,
    emitted_start: bool,
}

impl Machine {
    async fn run(mut self) {
        loop {
            match self.state() {
                State::Stopped => match self.commands.recv().await {
                    Some(Command::Connect) => self.enter(State::Connecting),
                    Some(Command::Ping(reply)) => {
                        let _ = reply.send(Err(ClientError::NotConnected));
                    }
                    Some(_) => (),
                    None => return,
                },
                State::Connecting => self.run_connecting().await,
                State::ConnectingError => self.run_connecting_error().await,
                State::Connected => self.run_connected().await,
                State::Started => self.run_started(),
                State::StartedWaiting => self.run_started_waiting().await,
                State::StartedReady => self.run_started_ready().await,
                State::Restart => self.run_restart(),
                State::Closing => self.run_closing(),
            }
        }
    }

    fn state(&self) -> State {
        self.state
    }

    fn enter(&mut self, next: State) {
        debug!(self.shared.log, "state transition";
            "from" => self.state.name(), "to" => next.name());
        self.state = next;
        *self.shared.state.lock().unwrap() = next;
        self.emit(ClientEvent::StateChanged(next.name()));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn run_connecting(&mut self) {
        self.attempt += 1;
        let host = self.host.clone();
        let port = self.port;

        let connect = TcpStream::connect((host, port));
        tokio::pin!(connect);

        let next = loop {
            tokio::select! {
                connected = &mut connect => match connected {
                    Ok(socket) => match self.establish(socket) {
                        Ok(()) => break State::Connected,
                        Err(e) => {
                            warn!(self.shared.log,
                                "failed to establish RPC connection";
                                "err" => %e);
                            break State::ConnectingError;
                        }
                    },
                    Err(e) => {
                        debug!(self.shared.log, "connect attempt failed";
                            "attempt" => self.attempt, "err" => %e);
                        break State::ConnectingError;
                    }
                },
                command = self.commands.recv() => {
                    if let Some(next) = self.handle_waiting_command(command) {
                        break next;
                    }
                }
            }
        };
        self.enter(next);
    }

    async fn run_connecting_error(&mut self) {
        let (delay, level) = backoff(self.attempt);
        match level {
            Level::Critical => slog::crit!(self.shared.log, "scheduling reconnect";
                "attempt" => self.attempt, "delay_ms" => delay.as_millis() as u64),
            Level::Error => slog::error!(self.shared.log, "scheduling reconnect";
                "attempt" => self.attempt, "delay_ms" => delay.as_millis() as u64),
            Level::Warning => slog::warn!(self.shared.log, "scheduling reconnect";
                "attempt" => self.attempt, "delay_ms" => delay.as_millis() as u64),
            Level::Info => slog::info!(self.shared.log, "scheduling reconnect";
                "attempt" => self.attempt, "delay_ms" => delay.as_millis() as u64),
            Level::Debug => slog::debug!(self.shared.log, "scheduling reconnect";
                "attempt" => self.attempt, "delay_ms" => delay.as_millis() as u64),
            Level::Trace => slog::trace!(self.shared.log, "scheduling reconnect";
                "attempt" => self.attempt, "delay_ms" => delay.as_millis() as u64),
        }

        let timer = time::sleep(delay);
        tokio::pin!(timer);

        let next = loop {
            tokio::select! {
                _ = &mut timer => break State::Connecting,
                command = self.commands.recv() => {
                    if let Some(next) = self.handle_waiting_command(command) {
                        break next;
                    }
                }
            }
        };
        self.enter(next);
    }

    async fn run_connected(&mut self) {
        if self.emitted_connect {
            // Reconnect: streaming intent is sticky, so advance without
            // waiting for a new start() call.
            self.enter(State::Started);
            return;
        }

        self.emitted_connect = true;
        self.emit(ClientEvent::Connect);
        info!(self.shared.log, "connected");

        let next = loop {
            match self.commands.recv().await {
                Some(Command::Start) => break State::Started,
                Some(Command::Close) | None => break State::Closing,
                Some(Command::Ping(reply)) => self.answer_ping(reply),
                Some(Command::Connect) => (),
            }
        };
        self.enter(next);
    }

    fn run_started(&mut self) {
        let next = match &self.rpc {
            Some(rpc) => {
                let opts = json!({
                    "client_id": self.shared.client_id,
                    "version": PROTOCOL_VERSION,
                });
                match rpc.call("messages", vec![opts]) {
                    Ok(call) => {
                        self.call = Some(call);
                        State::StartedWaiting
                    }
                    Err(e) => {
                        warn!(self.shared.log, "failed to issue messages RPC";
                            "err" => %e);
                        State::Restart
                    }
                }
            }
            None => State::Restart,
        };
        self.enter(next);
    }

    async fn run_started_waiting(&mut self) {
        let next = loop {
            match self.next_input().await {
                Input::Frame(Ok(Some(first))) => {
                    // The first frame on the subscription is the sync record;
                    // it is stored, not emitted.
                    match serde_json::from_value::<SyncRecord>(first) {
                        Ok(sync) => {
                            debug!(self.shared.log, "received sync record";
                                "last_req_id" => ?sync.last_req_id,
                                "last_id" => ?sync.last_id);
                            *self.shared.server_state.lock().unwrap() =
                                Some(sync);
                        }
                        Err(e) => {
                            warn!(self.shared.log,
                                "failed to parse sync record"; "err" => %e);
                        }
                    }
                    break State::StartedReady;
                }
                Input::Frame(Ok(None)) => break State::Restart,
                Input::Frame(Err(e)) => {
                    debug!(self.shared.log, "subscription stream failed";
                        "err" => %e);
                    break State::Restart;
                }
                Input::Cmd(command) => {
                    if let Some(next) = self.handle_waiting_command(command) {
                        break next;
                    }
                }
            }
        };
        self.enter(next);
    }

    async fn run_started_ready(&mut self) {
        if !self.emitted_start {
            self.emitted_start = true;
            self.emit(ClientEvent::Start);
            info!(self.shared.log, "stream started");
        }

        let next = loop {
            match self.next_input().await {
                Input::Frame(Ok(Some(value))) => {
                    match serde_json::from_value::<Event>(value) {
                        Ok(event) => self.emit(ClientEvent::Message(event)),
                        Err(e) => {
                            warn!(self.shared.log,
                                "discarding undecodable event frame";
                                "err" => %e);
                        }
                    }
                }
                Input::Frame(Ok(None)) => {
                    debug!(self.shared.log, "subscription ended by server");
                    break State::Restart;
                }
                Input::Frame(Err(e)) => {
                    debug!(self.shared.log, "subscription stream failed";
                        "err" => %e);
                    break State::Restart;
                }
                Input::Cmd(command) => {
                    if let Some(next) = self.handle_waiting_command(command) {
                        break next;
                    }
                }
            }
        };
        self.enter(next);
    }

    fn run_restart(&mut self) {
        self.teardown();
        self.attempt = 0;
        self.enter(State::Connecting);
    }

    fn run_closing(&mut self) {
        self.teardown();
        self.enter(State::Stopped);
        self.emit(ClientEvent::Close);
        info!(self.shared.log, "client closed");
    }

    // Wait for a frame on the subscription call or a consumer command,
    // whichever arrives first.
    async fn next_input(&mut self) -> Input {
        let Machine { call, commands, .. } = self;
        match call.as_mut() {
            Some(call) => tokio::select! {
                frame = call.next() => Input::Frame(frame),
                command = commands.recv() => Input::Cmd(command),
            },
            None => Input::Frame(Err(RpcError::ConnectionClosed)),
        }
    }

    // Commands that arrive while the machine is parked in a select: close
    // routes to closing, ping is answered in place, and connect/start cannot
    // legally occur here (the handle asserts the state before sending them).
    fn handle_waiting_command(
        &mut self,
        command: Option<Command>,
    ) -> Option<State> {
        match command {
            Some(Command::Close) | None => Some(State::Closing),
            Some(Command::Ping(reply)) => {
                self.answer_ping(reply);
                None
            }
            Some(Command::Connect) | Some(Command::Start) => None,
        }
    }

    fn answer_ping(&self, reply: oneshot::Sender<Result<(), ClientError>>) {
        match &self.rpc {
            None => {
                let _ = reply.send(Err(ClientError::NotConnected));
            }
            Some(rpc) => {
                // Run the probe off the machine task so frame delivery and
                // transitions are not held up behind it.
                let rpc = rpc.clone();
                tokio::spawn(async move {
                    let result = rpc
                        .call_unary("ping", vec![json!({})])
                        .await
                        .map_err(ClientError::from);
                    let _ = reply.send(result);
                });
            }
        }
    }

    // Enable keepalive on the socket and stand up the RPC connection.
    fn establish(&mut self, socket: TcpStream) -> io::Result<()> {
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_DELAY);
        SockRef::from(&socket).set_tcp_keepalive(&keepalive)?;
        self.rpc = Some(RpcConnection::start(socket, self.shared.log.clone()));
        Ok(())
    }

    fn teardown(&mut self) {
        self.call = None;
        if let Some(rpc) = self.rpc.take() {
            rpc.shutdown();
        }
    }
}
