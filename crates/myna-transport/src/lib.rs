// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Connection-oriented transport state machine.
//!
//! Wraps a pluggable [`Connector`] (the real I/O: WebSocket, TCP, TLS) in the
//! four-state lifecycle Disconnected → Connecting → Connected →
//! Disconnecting, with shared connect/disconnect completions, CRLF keep-alive
//! (RFC 6223/RFC 7118) and a connect timeout. Observers are notified
//! synchronously after the state is updated and before pending completions
//! resolve; a `connect()`/`disconnect()` issued from inside an observer is
//! the next transition, never a nested one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// The RFC 6223 client keep-alive frame.
pub const KEEP_ALIVE_FRAME: &str = "\r\n\r\n";

/// Transport failures surfaced to the layers above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    ConnectionLost(String),
    SendFailed(String),
    InvalidUrl(String),
    ConnectTimeout,
    NotConnected,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(reason) => write!(f, "connection lost: {}", reason),
            Self::SendFailed(reason) => write!(f, "send failed: {}", reason),
            Self::InvalidUrl(url) => write!(f, "invalid transport URL: {}", url),
            Self::ConnectTimeout => write!(f, "connect attempt timed out"),
            Self::NotConnected => write!(f, "transport is not connected"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Transport lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Inbound events a [`Link`] delivers.
#[derive(Debug)]
pub enum LinkEvent {
    /// A framed SIP message.
    Message(String),
    /// A server CRLF keep-alive.
    KeepAlive,
    /// The peer closed the connection; `Some` when it was an error.
    Closed(Option<String>),
}

/// An established bidirectional message link: outbound frames go into `tx`,
/// inbound events come out of `rx`. Dropping `tx` closes the link.
pub struct Link {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<LinkEvent>,
}

/// Factory that opens links toward a configured server. The real
/// implementation owns sockets and framing; tests use channel pairs.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, server: &str) -> Result<Link, TransportError>;
}

/// Transport tuning knobs.
#[derive(Clone)]
pub struct TransportOptions {
    /// Server URL handed to the connector.
    pub server: String,
    /// Handshake deadline.
    pub connection_timeout: Duration,
    /// Keep-alive base interval; None disables keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// How long to wait for the server CRLF before logging a liveness doubt.
    pub keep_alive_debounce: Duration,
    /// Log every frame sent and received.
    pub trace_sip: bool,
}

impl TransportOptions {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            connection_timeout: Duration::from_secs(5),
            keep_alive_interval: None,
            keep_alive_debounce: Duration::from_secs(10),
            trace_sip: false,
        }
    }
}

/// What a queued reentrant call wants done once the current transition lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Connect,
    Disconnect,
}

struct Cell {
    state: TransportState,
    /// Invalidates in-flight attempts, reader tasks and keep-alive loops.
    generation: u64,
    /// True while state-change observers run; a connect/disconnect issued
    /// from inside one is queued as the next transition, never run inline.
    notifying: bool,
    queued: Option<Intent>,
    connect_waiters: Vec<oneshot::Sender<Result<(), TransportError>>>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
    link_tx: Option<mpsc::Sender<String>>,
    debounce: Option<oneshot::Sender<()>>,
}

type StateObserver = Arc<dyn Fn(TransportState) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn(Option<TransportError>) + Send + Sync>;

struct Inner {
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    cell: Mutex<Cell>,
    observers: Mutex<Vec<StateObserver>>,
    on_message: Mutex<Option<MessageHandler>>,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
}

/// The transport FSM.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, options: TransportOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                cell: Mutex::new(Cell {
                    state: TransportState::Disconnected,
                    generation: 0,
                    notifying: false,
                    queued: None,
                    connect_waiters: Vec::new(),
                    disconnect_waiters: Vec::new(),
                    link_tx: None,
                    debounce: None,
                }),
                observers: Mutex::new(Vec::new()),
                on_message: Mutex::new(None),
                on_disconnect: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        self.inner.cell.lock().state
    }

    /// Registers a synchronous state-change observer.
    pub fn on_state(&self, observer: impl Fn(TransportState) + Send + Sync + 'static) {
        self.inner.observers.lock().push(Arc::new(observer));
    }

    /// Installs the inbound message handler.
    pub fn on_message(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        *self.inner.on_message.lock() = Some(Arc::new(handler));
    }

    /// Installs the disconnect handler. The error is `Some` for unsolicited
    /// closes, `None` for requested disconnects.
    pub fn on_disconnect(&self, handler: impl Fn(Option<TransportError>) + Send + Sync + 'static) {
        *self.inner.on_disconnect.lock() = Some(Arc::new(handler));
    }

    /// Begins connecting (or joins the attempt already in flight) and
    /// returns a completion that resolves once Connected or failed.
    ///
    /// The state work happens before this function returns; the future may
    /// be dropped without canceling the attempt.
    pub fn connect(&self) -> impl std::future::Future<Output = Result<(), TransportError>> {
        let (tx, rx) = oneshot::channel();
        let begin = {
            let mut cell = self.inner.cell.lock();
            match cell.state {
                TransportState::Connected => {
                    let _ = tx.send(Ok(()));
                    None
                }
                TransportState::Connecting => {
                    cell.connect_waiters.push(tx);
                    None
                }
                TransportState::Disconnecting => {
                    // Queued as the transition after the disconnect lands.
                    cell.queued = Some(Intent::Connect);
                    cell.connect_waiters.push(tx);
                    None
                }
                TransportState::Disconnected => {
                    cell.connect_waiters.push(tx);
                    if cell.notifying {
                        // Reentrant call from an observer of the transition
                        // in progress: run after it, not inside it.
                        cell.queued = Some(Intent::Connect);
                        None
                    } else {
                        Some(self.begin_connect(&mut cell))
                    }
                }
            }
        };
        if let Some(generation) = begin {
            self.notify(TransportState::Connecting);
            self.spawn_attempt(generation);
            self.run_queued();
        }
        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectionLost("transport dropped".into())),
            }
        }
    }

    /// Begins disconnecting (or joins the teardown already in flight).
    pub fn disconnect(&self) -> impl std::future::Future<Output = ()> {
        let (tx, rx) = oneshot::channel();
        let began = {
            let mut cell = self.inner.cell.lock();
            match cell.state {
                TransportState::Disconnected => {
                    let _ = tx.send(());
                    // Nobody else will resolve waiters a queued disconnect
                    // left behind once the transport is already down.
                    for waiter in std::mem::take(&mut cell.disconnect_waiters) {
                        let _ = waiter.send(());
                    }
                    false
                }
                TransportState::Disconnecting => {
                    cell.disconnect_waiters.push(tx);
                    false
                }
                TransportState::Connecting | TransportState::Connected if cell.notifying => {
                    // Reentrant call from a state-change observer: queued as
                    // the transition after the one being announced.
                    cell.disconnect_waiters.push(tx);
                    cell.queued = Some(Intent::Disconnect);
                    false
                }
                TransportState::Connecting => {
                    cell.disconnect_waiters.push(tx);
                    cell.generation += 1;
                    cell.state = TransportState::Disconnecting;
                    // The aborted attempt rejects its joiners.
                    let waiters = std::mem::take(&mut cell.connect_waiters);
                    drop(cell);
                    for waiter in waiters {
                        let _ = waiter.send(Err(TransportError::ConnectionLost(
                            "disconnect during connect".into(),
                        )));
                    }
                    true
                }
                TransportState::Connected => {
                    cell.disconnect_waiters.push(tx);
                    cell.generation += 1;
                    cell.state = TransportState::Disconnecting;
                    cell.link_tx = None;
                    if let Some(debounce) = cell.debounce.take() {
                        let _ = debounce.send(());
                    }
                    true
                }
            }
        };
        if began {
            self.notify(TransportState::Disconnecting);
            self.finish_disconnect(None);
        }
        async move {
            let _ = rx.await;
        }
    }

    /// Sends one framed message. Fails unless Connected.
    pub async fn send(&self, frame: &str) -> Result<(), TransportError> {
        let link_tx = {
            let cell = self.inner.cell.lock();
            if cell.state != TransportState::Connected {
                return Err(TransportError::NotConnected);
            }
            cell.link_tx.clone()
        };
        let Some(link_tx) = link_tx else {
            return Err(TransportError::NotConnected);
        };
        if self.inner.options.trace_sip {
            trace!(frame, "sending");
        }
        link_tx
            .send(frame.to_owned())
            .await
            .map_err(|_| TransportError::SendFailed("link closed".into()))
    }

    /// Starts a connect attempt; caller holds the cell lock.
    fn begin_connect(&self, cell: &mut Cell) -> u64 {
        cell.generation += 1;
        cell.state = TransportState::Connecting;
        cell.generation
    }

    fn spawn_attempt(&self, generation: u64) {
        let transport = self.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(
                transport.inner.options.connection_timeout,
                transport
                    .inner
                    .connector
                    .open(&transport.inner.options.server),
            )
            .await;
            let outcome = match result {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(TransportError::ConnectTimeout),
            };
            transport.settle_attempt(generation, outcome);
        });
    }

    fn settle_attempt(&self, generation: u64, outcome: Result<Link, TransportError>) {
        let (state, waiters, link_rx) = {
            let mut cell = self.inner.cell.lock();
            if cell.generation != generation || cell.state != TransportState::Connecting {
                // A disconnect overtook this attempt; drop the link if any.
                return;
            }
            match outcome {
                Ok(link) => {
                    cell.state = TransportState::Connected;
                    cell.link_tx = Some(link.tx);
                    (
                        TransportState::Connected,
                        std::mem::take(&mut cell.connect_waiters),
                        Some(link.rx),
                    )
                }
                Err(err) => {
                    cell.state = TransportState::Disconnected;
                    let waiters = std::mem::take(&mut cell.connect_waiters);
                    drop(cell);
                    debug!(%err, "connect attempt failed");
                    self.notify(TransportState::Disconnected);
                    for waiter in waiters {
                        let _ = waiter.send(Err(err.clone()));
                    }
                    self.run_queued();
                    return;
                }
            }
        };
        self.notify(state);
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        if let Some(rx) = link_rx {
            self.spawn_reader(generation, rx);
        }
        self.spawn_keep_alive(generation);
        self.run_queued();
    }

    /// Completes Disconnecting → Disconnected and resolves waiters.
    fn finish_disconnect(&self, error: Option<TransportError>) {
        let waiters = {
            let mut cell = self.inner.cell.lock();
            cell.state = TransportState::Disconnected;
            cell.link_tx = None;
            std::mem::take(&mut cell.disconnect_waiters)
        };
        self.notify(TransportState::Disconnected);
        for waiter in waiters {
            let _ = waiter.send(());
        }
        let handler = self.inner.on_disconnect.lock().clone();
        if let Some(handler) = handler {
            handler(error);
        }
        self.run_queued();
    }

    /// Runs the transition an observer queued during the previous one.
    fn run_queued(&self) {
        let intent = self.inner.cell.lock().queued.take();
        match intent {
            Some(Intent::Connect) => {
                let begin = {
                    let mut cell = self.inner.cell.lock();
                    match cell.state {
                        TransportState::Disconnected => Some(self.begin_connect(&mut cell)),
                        TransportState::Connected => {
                            // Already connected again; the queued joiners
                            // get their completion without a new attempt.
                            for waiter in std::mem::take(&mut cell.connect_waiters) {
                                let _ = waiter.send(Ok(()));
                            }
                            None
                        }
                        _ => None,
                    }
                };
                if let Some(generation) = begin {
                    self.notify(TransportState::Connecting);
                    self.spawn_attempt(generation);
                    self.run_queued();
                }
            }
            Some(Intent::Disconnect) => {
                drop(self.disconnect());
            }
            None => {}
        }
    }

    fn notify(&self, state: TransportState) {
        // No lock is held while observers run; a connect()/disconnect()
        // issued from inside one sees the notifying flag and queues itself
        // as the next transition instead of executing inline.
        self.inner.cell.lock().notifying = true;
        let observers: Vec<StateObserver> = self.inner.observers.lock().clone();
        for observer in &observers {
            observer(state);
        }
        self.inner.cell.lock().notifying = false;
    }

    fn spawn_reader(&self, generation: u64, mut rx: mpsc::Receiver<LinkEvent>) {
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                let event = rx.recv().await;
                if transport.inner.cell.lock().generation != generation {
                    return;
                }
                match event {
                    Some(LinkEvent::Message(frame)) => {
                        if transport.inner.options.trace_sip {
                            trace!(frame, "received");
                        }
                        let handler = transport.inner.on_message.lock().clone();
                        if let Some(handler) = handler {
                            handler(frame);
                        }
                    }
                    Some(LinkEvent::KeepAlive) => {
                        let mut cell = transport.inner.cell.lock();
                        if let Some(debounce) = cell.debounce.take() {
                            let _ = debounce.send(());
                        }
                    }
                    Some(LinkEvent::Closed(reason)) => {
                        transport.unsolicited_close(generation, reason);
                        return;
                    }
                    None => {
                        transport.unsolicited_close(generation, None);
                        return;
                    }
                }
            }
        });
    }

    fn unsolicited_close(&self, generation: u64, reason: Option<String>) {
        let close = {
            let mut cell = self.inner.cell.lock();
            if cell.generation != generation || cell.state != TransportState::Connected {
                None
            } else {
                cell.generation += 1;
                cell.state = TransportState::Disconnected;
                cell.link_tx = None;
                if let Some(debounce) = cell.debounce.take() {
                    let _ = debounce.send(());
                }
                Some(TransportError::ConnectionLost(
                    reason.unwrap_or_else(|| "connection closed".into()),
                ))
            }
        };
        if let Some(error) = close {
            warn!(%error, "transport closed unexpectedly");
            self.notify(TransportState::Disconnected);
            let handler = self.inner.on_disconnect.lock().clone();
            if let Some(handler) = handler {
                handler(Some(error));
            }
            self.run_queued();
        }
    }

    fn spawn_keep_alive(&self, generation: u64) {
        let Some(base) = self.inner.options.keep_alive_interval else {
            return;
        };
        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                // 80-100% of the base interval, re-randomized every round.
                let factor = rand::thread_rng().gen_range(0.8..=1.0);
                tokio::time::sleep(base.mul_f64(factor)).await;
                let live = {
                    let cell = transport.inner.cell.lock();
                    cell.generation == generation && cell.state == TransportState::Connected
                };
                if !live {
                    return;
                }
                if transport.send(KEEP_ALIVE_FRAME).await.is_err() {
                    return;
                }
                transport.arm_debounce(generation);
            }
        });
    }

    fn arm_debounce(&self, generation: u64) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut cell = self.inner.cell.lock();
            if cell.generation != generation {
                return;
            }
            cell.debounce = Some(cancel_tx);
        }
        let debounce = self.inner.options.keep_alive_debounce;
        let transport = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    if transport.inner.cell.lock().generation == generation {
                        warn!("no keep-alive response from server");
                    }
                }
                _ = cancel_rx => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector whose links are plain channel pairs, with scripted failures.
    struct MockConnector {
        fail_times: AtomicUsize,
        hang: std::sync::atomic::AtomicBool,
        opened: Mutex<Vec<ServerSide>>,
    }

    struct ServerSide {
        to_client: mpsc::Sender<LinkEvent>,
        from_client: mpsc::Receiver<String>,
    }

    impl MockConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_times: AtomicUsize::new(0),
                hang: std::sync::atomic::AtomicBool::new(false),
                opened: Mutex::new(Vec::new()),
            })
        }

        fn fail_next(&self, times: usize) {
            self.fail_times.store(times, Ordering::SeqCst);
        }

        fn take_server_side(&self) -> ServerSide {
            self.opened.lock().pop().expect("an open link")
        }

        fn open_count(&self) -> usize {
            self.opened.lock().len()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self, _server: &str) -> Result<Link, TransportError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_times.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                return Err(TransportError::ConnectionLost("refused".into()));
            }
            let (out_tx, out_rx) = mpsc::channel(16);
            let (in_tx, in_rx) = mpsc::channel(16);
            self.opened.lock().push(ServerSide {
                to_client: in_tx,
                from_client: out_rx,
            });
            Ok(Link {
                tx: out_tx,
                rx: in_rx,
            })
        }
    }

    fn transport(connector: Arc<MockConnector>) -> Transport {
        Transport::new(connector, TransportOptions::new("wss://edge.example.com"))
    }

    #[tokio::test]
    async fn connects_and_disconnects() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        assert_eq!(transport.state(), TransportState::Disconnected);

        transport.connect().await.expect("connected");
        assert_eq!(transport.state(), TransportState::Connected);

        transport.disconnect().await;
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn double_connect_shares_one_attempt() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        let first = transport.connect();
        let second = transport.connect();
        let (a, b) = tokio::join!(first, second);
        a.expect("connected");
        b.expect("connected");
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test]
    async fn send_requires_connected() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        assert_eq!(
            transport.send("OPTIONS").await,
            Err(TransportError::NotConnected)
        );
        transport.connect().await.expect("connected");
        transport.send("OPTIONS sip:x SIP/2.0\r\n\r\n").await.expect("sent");
        let mut server = connector.take_server_side();
        let frame = server.from_client.recv().await.expect("frame");
        assert!(frame.starts_with("OPTIONS"));
    }

    #[tokio::test]
    async fn failed_attempt_returns_to_disconnected() {
        let connector = MockConnector::new();
        connector.fail_next(1);
        let transport = transport(connector.clone());
        let err = transport.connect().await.expect_err("failure");
        assert!(matches!(err, TransportError::ConnectionLost(_)));
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let connector = MockConnector::new();
        connector.hang.store(true, Ordering::SeqCst);
        let transport = transport(connector.clone());
        let err = transport.connect().await.expect_err("timeout");
        assert_eq!(err, TransportError::ConnectTimeout);
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn inbound_messages_reach_the_handler() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        transport.on_message(move |frame| {
            let _ = seen_tx.send(frame);
        });
        transport.connect().await.expect("connected");
        let server = connector.take_server_side();
        server
            .to_client
            .send(LinkEvent::Message("SIP/2.0 200 OK\r\n\r\n".into()))
            .await
            .expect("sent");
        let frame = seen_rx.recv().await.expect("frame");
        assert!(frame.starts_with("SIP/2.0 200"));
    }

    #[tokio::test]
    async fn unsolicited_close_surfaces_error() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        transport.on_disconnect(move |error| {
            let _ = err_tx.send(error);
        });
        transport.connect().await.expect("connected");
        let server = connector.take_server_side();
        server
            .to_client
            .send(LinkEvent::Closed(Some("going away".into())))
            .await
            .expect("sent");
        let error = err_rx.recv().await.expect("event");
        assert!(matches!(error, Some(TransportError::ConnectionLost(_))));
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn observers_fire_in_transition_order() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        transport.on_state(move |state| sink.lock().push(state));
        transport.connect().await.expect("connected");
        transport.disconnect().await;
        assert_eq!(
            states.lock().clone(),
            vec![
                TransportState::Connecting,
                TransportState::Connected,
                TransportState::Disconnecting,
                TransportState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn disconnect_during_connect_rejects_the_attempt() {
        let connector = MockConnector::new();
        connector.hang.store(true, Ordering::SeqCst);
        let transport = transport(connector.clone());
        let pending = transport.connect();
        let disconnect = transport.disconnect();
        let (connect_result, ()) = tokio::join!(pending, disconnect);
        assert!(connect_result.is_err());
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn reentrant_connect_from_observer_is_next_transition() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        let reconnecting = transport.clone();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_in_observer = fired.clone();
        transport.on_state(move |state| {
            if state == TransportState::Disconnecting
                && !fired_in_observer.swap(true, Ordering::SeqCst)
            {
                // Queued, not executed inline: the transition in progress
                // finishes before this connect begins.
                drop(reconnecting.connect());
            }
        });
        transport.connect().await.expect("connected");
        transport.disconnect().await;
        tokio::task::yield_now().await;
        // The queued connect ran after the disconnect completed.
        assert!(matches!(
            transport.state(),
            TransportState::Connecting | TransportState::Connected
        ));
    }

    #[tokio::test]
    async fn reentrant_disconnect_from_observer_is_next_transition() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        let disconnecting = transport.clone();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_in_observer = fired.clone();
        let state_after_call = Arc::new(Mutex::new(None));
        let observed = state_after_call.clone();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        transport.on_state(move |state| {
            sink.lock().push(state);
            if state == TransportState::Connected
                && !fired_in_observer.swap(true, Ordering::SeqCst)
            {
                drop(disconnecting.disconnect());
                // Queued, not executed inline: the Connected transition is
                // still the current one from this observer's point of view.
                *observed.lock() = Some(disconnecting.state());
            }
        });
        transport.connect().await.expect("connected");
        tokio::task::yield_now().await;
        assert_eq!(
            *state_after_call.lock(),
            Some(TransportState::Connected),
            "reentrant disconnect must not run inline"
        );
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert_eq!(
            states.lock().clone(),
            vec![
                TransportState::Connecting,
                TransportState::Connected,
                TransportState::Disconnecting,
                TransportState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_emits_crlf_frames() {
        let connector = MockConnector::new();
        let mut options = TransportOptions::new("wss://edge.example.com");
        options.keep_alive_interval = Some(Duration::from_secs(30));
        let transport = Transport::new(connector.clone(), options);
        transport.connect().await.expect("connected");
        let mut server = connector.take_server_side();

        tokio::time::sleep(Duration::from_secs(31)).await;
        let frame = server.from_client.recv().await.expect("frame");
        assert_eq!(frame, KEEP_ALIVE_FRAME);

        // The server's CRLF clears the pending debounce.
        server
            .to_client
            .send(LinkEvent::KeepAlive)
            .await
            .expect("sent");
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn double_disconnect_is_shared() {
        let connector = MockConnector::new();
        let transport = transport(connector.clone());
        transport.connect().await.expect("connected");
        let first = transport.disconnect();
        let second = transport.disconnect();
        tokio::join!(first, second);
        assert_eq!(transport.state(), TransportState::Disconnected);
    }
}
