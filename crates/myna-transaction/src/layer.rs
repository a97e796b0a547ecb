// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use myna_core::{Method, Request, Response};
use myna_timer::{schedule, SipTimer, TimerHandle, TimerTable};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::fsm::{
    ClientInviteAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteAction,
    ClientNonInviteEvent, ClientNonInviteFsm, ServerInviteAction, ServerInviteEvent,
    ServerInviteFsm, ServerNonInviteAction, ServerNonInviteEvent, ServerNonInviteFsm,
};
use crate::reply::reply_to;
use crate::TransactionKey;

/// How long the runtime waits for the TU before sending 100 Trying itself.
const PROVISIONAL_DUE: Duration = Duration::from_millis(200);

/// Sends serialized frames on behalf of the transaction layer.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, frame: String) -> Result<()>;
}

/// Callbacks a client transaction delivers to its transaction user.
#[async_trait]
pub trait ClientTransactionUser: Send + Sync + 'static {
    async fn on_provisional(&self, key: &TransactionKey, response: Response);
    async fn on_final(&self, key: &TransactionKey, response: Response);
    /// Timer B/F expired without any final response.
    async fn on_timeout(&self, key: &TransactionKey);
    async fn on_transport_error(&self, key: &TransactionKey);
    async fn on_terminated(&self, _key: &TransactionKey) {}
}

/// Callbacks a server transaction delivers to its transaction user.
#[async_trait]
pub trait ServerTransactionUser: Send + Sync + 'static {
    /// ACK reached an accepted INVITE transaction (TU absorbs it, RFC 6026).
    async fn on_ack(&self, key: &TransactionKey, ack: Request);
    /// Timer H expired: the ACK never arrived.
    async fn on_timeout(&self, key: &TransactionKey);
    async fn on_transport_error(&self, key: &TransactionKey);
    async fn on_terminated(&self, _key: &TransactionKey) {}
}

/// Outcome of matching an inbound request against the server tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMatch {
    /// An existing transaction absorbed the message (retransmission or ACK).
    Handled,
    /// No transaction matched; the UA core decides what to do.
    None,
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    tu: Arc<dyn ClientTransactionUser>,
    timers: HashMap<SipTimer, TimerHandle>,
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ServerEntry {
    kind: ServerKind,
    tu: Option<Arc<dyn ServerTransactionUser>>,
    timers: HashMap<SipTimer, TimerHandle>,
    provisional_timer: TimerHandle,
    request: Request,
    responded: bool,
}

enum Command {
    ClientTimer { key: TransactionKey, timer: SipTimer },
    ServerTimer { key: TransactionKey, timer: SipTimer },
    ProvisionalDue { key: TransactionKey },
}

struct Inner {
    dispatcher: Arc<dyn TransportDispatcher>,
    client: DashMap<TransactionKey, ClientEntry>,
    server: DashMap<TransactionKey, ServerEntry>,
    timers: TimerTable,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

/// Owns the client and server transaction tables and drives the four state
/// machines from transport events and timer firings.
#[derive(Clone)]
pub struct TransactionLayer {
    inner: Arc<Inner>,
}

/// TU callbacks and frames to emit, collected while the table lock is held
/// and executed after it drops.
#[derive(Default)]
struct Effects {
    frames: Vec<String>,
    provisionals: Vec<Response>,
    finals: Vec<Response>,
    acks: Vec<Request>,
    timeout: bool,
    transport_error: bool,
    terminated: bool,
}

impl TransactionLayer {
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>, timers: TimerTable) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let layer = Self {
            inner: Arc::new(Inner {
                dispatcher,
                client: DashMap::new(),
                server: DashMap::new(),
                timers,
                cmd_tx,
            }),
        };
        layer.spawn_command_loop(cmd_rx);
        layer
    }

    pub fn timer_table(&self) -> TimerTable {
        self.inner.timers
    }

    pub fn client_count(&self) -> usize {
        self.inner.client.len()
    }

    pub fn server_count(&self) -> usize {
        self.inner.server.len()
    }

    fn spawn_command_loop(&self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let layer = self.clone();
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                match command {
                    Command::ClientTimer { key, timer } => {
                        layer.drive_client_timer(&key, timer).await;
                    }
                    Command::ServerTimer { key, timer } => {
                        layer.drive_server_timer(&key, timer).await;
                    }
                    Command::ProvisionalDue { key } => {
                        layer.auto_provisional(&key).await;
                    }
                }
            }
        });
    }

    /// Creates a client transaction for an outbound request whose top Via
    /// (and branch) is already in place, and transmits it.
    pub async fn start_client(
        &self,
        key: TransactionKey,
        request: Request,
        tu: Arc<dyn ClientTransactionUser>,
    ) {
        let is_invite = request.start.method.is_invite();
        let effects = {
            let mut entry = ClientEntry {
                kind: if is_invite {
                    ClientKind::Invite(ClientInviteFsm::new(self.inner.timers))
                } else {
                    ClientKind::NonInvite(ClientNonInviteFsm::new(self.inner.timers))
                },
                tu,
                timers: HashMap::new(),
            };
            let actions = match &mut entry.kind {
                ClientKind::Invite(fsm) => client_invite_effects(
                    fsm.on_event(ClientInviteEvent::SendInvite(request)),
                ),
                ClientKind::NonInvite(fsm) => client_non_invite_effects(
                    fsm.on_event(ClientNonInviteEvent::SendRequest(request)),
                ),
            };
            let (effects, schedules, cancels) = actions;
            self.apply_client_timers(&key, &mut entry, schedules, cancels);
            self.inner.client.insert(key.clone(), entry);
            effects
        };
        self.run_client_effects(&key, effects).await;
    }

    /// Routes an inbound response to its client transaction. Returns false
    /// when no transaction matches (the caller drops or special-cases it).
    pub async fn receive_response(&self, response: Response) -> bool {
        let Some(key) = TransactionKey::for_inbound_response(&response) else {
            return false;
        };
        let provisional = response.start.is_provisional();
        let Some(effects) = self.with_client(&key, |fsm| match fsm {
            ClientKind::Invite(fsm) => client_invite_effects(fsm.on_event(if provisional {
                ClientInviteEvent::ReceiveProvisional(response.clone())
            } else {
                ClientInviteEvent::ReceiveFinal(response.clone())
            })),
            ClientKind::NonInvite(fsm) => {
                client_non_invite_effects(fsm.on_event(if provisional {
                    ClientNonInviteEvent::ReceiveProvisional(response.clone())
                } else {
                    ClientNonInviteEvent::ReceiveFinal(response.clone())
                }))
            }
        }) else {
            debug!(branch = %key.branch, "no client transaction for response");
            return false;
        };
        self.run_client_effects(&key, effects).await;
        true
    }

    /// Matches an inbound request against existing server transactions and
    /// lets the owning FSM absorb retransmissions and ACKs.
    pub async fn receive_request(&self, request: Request) -> ServerMatch {
        let Some(key) = TransactionKey::for_inbound_request(&request) else {
            return ServerMatch::None;
        };
        self.receive_request_as(key, request).await
    }

    /// Like [`Self::receive_request`] with the matching key already chosen
    /// (CANCEL owns a transaction under its own method).
    pub async fn receive_request_as(&self, key: TransactionKey, request: Request) -> ServerMatch {
        if !self.inner.server.contains_key(&key) {
            return ServerMatch::None;
        }
        let is_ack = request.start.method == Method::Ack;
        let Some(effects) = self.with_server(&key, |fsm| match fsm {
            ServerKind::Invite(fsm) => server_invite_effects(fsm.on_event(if is_ack {
                ServerInviteEvent::ReceiveAck(request.clone())
            } else {
                ServerInviteEvent::ReceiveInvite(request.clone())
            })),
            ServerKind::NonInvite(fsm) => {
                server_non_invite_effects(fsm.on_event(ServerNonInviteEvent::ReceiveRequest(
                    request.clone(),
                )))
            }
        }) else {
            return ServerMatch::None;
        };
        self.run_server_effects(&key, effects).await;
        ServerMatch::Handled
    }

    /// Creates a server transaction for a new inbound request. INVITE
    /// transactions get the 200 ms automatic-100 timer.
    pub fn start_server(
        &self,
        key: TransactionKey,
        request: Request,
        tu: Option<Arc<dyn ServerTransactionUser>>,
    ) {
        let is_invite = request.start.method.is_invite();
        let provisional_timer = if is_invite {
            let tx = self.inner.cmd_tx.clone();
            let due_key = key.clone();
            schedule(PROVISIONAL_DUE, move || {
                let _ = tx.send(Command::ProvisionalDue { key: due_key });
            })
        } else {
            TimerHandle::disarmed()
        };
        let entry = ServerEntry {
            kind: if is_invite {
                ServerKind::Invite(ServerInviteFsm::new(self.inner.timers))
            } else {
                ServerKind::NonInvite(ServerNonInviteFsm::new(self.inner.timers))
            },
            tu,
            timers: HashMap::new(),
            provisional_timer,
            request,
            responded: false,
        };
        self.inner.server.insert(key, entry);
    }

    /// Attaches (or replaces) the transaction user of a server transaction.
    /// Used by TUs created after the transaction, like invitations.
    pub fn set_server_tu(&self, key: &TransactionKey, tu: Arc<dyn ServerTransactionUser>) {
        if let Some(mut entry) = self.inner.server.get_mut(key) {
            entry.tu = Some(tu);
        }
    }

    /// Sends a response through the owning server transaction.
    pub async fn respond(&self, key: &TransactionKey, response: Response) -> Result<()> {
        let provisional = response.start.is_provisional();
        let Some(effects) = self.with_server_entry(key, |entry| {
            entry.responded = true;
            entry.provisional_timer.cancel();
            match &mut entry.kind {
                ServerKind::Invite(fsm) => server_invite_effects(fsm.on_event(if provisional {
                    ServerInviteEvent::SendProvisional(response.clone())
                } else {
                    ServerInviteEvent::SendFinal(response.clone())
                })),
                ServerKind::NonInvite(fsm) => {
                    server_non_invite_effects(fsm.on_event(if provisional {
                        ServerNonInviteEvent::SendProvisional(response.clone())
                    } else {
                        ServerNonInviteEvent::SendFinal(response.clone())
                    }))
                }
            }
        }) else {
            anyhow::bail!("no server transaction for key {:?}", key);
        };
        self.run_server_effects(key, effects).await;
        Ok(())
    }

    /// Feeds a send failure into the owning client transaction.
    pub async fn client_transport_error(&self, key: &TransactionKey) {
        if let Some(effects) = self.with_client(key, |fsm| match fsm {
            ClientKind::Invite(fsm) => {
                client_invite_effects(fsm.on_event(ClientInviteEvent::TransportError))
            }
            ClientKind::NonInvite(fsm) => {
                client_non_invite_effects(fsm.on_event(ClientNonInviteEvent::TransportError))
            }
        }) {
            self.run_client_effects(key, effects).await;
        }
    }

    /// Cancels every timer and clears both tables (user-agent shutdown).
    pub fn reset(&self) {
        for mut entry in self.inner.client.iter_mut() {
            for handle in entry.timers.values_mut() {
                handle.cancel();
            }
        }
        for mut entry in self.inner.server.iter_mut() {
            entry.provisional_timer.cancel();
            for handle in entry.timers.values_mut() {
                handle.cancel();
            }
        }
        self.inner.client.clear();
        self.inner.server.clear();
    }

    async fn drive_client_timer(&self, key: &TransactionKey, timer: SipTimer) {
        if let Some(effects) = self.with_client(key, |fsm| match fsm {
            ClientKind::Invite(fsm) => {
                client_invite_effects(fsm.on_event(ClientInviteEvent::TimerFired(timer)))
            }
            ClientKind::NonInvite(fsm) => {
                client_non_invite_effects(fsm.on_event(ClientNonInviteEvent::TimerFired(timer)))
            }
        }) {
            self.run_client_effects(key, effects).await;
        }
    }

    async fn drive_server_timer(&self, key: &TransactionKey, timer: SipTimer) {
        if let Some(effects) = self.with_server(key, |fsm| match fsm {
            ServerKind::Invite(fsm) => {
                server_invite_effects(fsm.on_event(ServerInviteEvent::TimerFired(timer)))
            }
            ServerKind::NonInvite(fsm) => {
                server_non_invite_effects(fsm.on_event(ServerNonInviteEvent::TimerFired(timer)))
            }
        }) {
            self.run_server_effects(key, effects).await;
        }
    }

    /// The TU stayed silent for 200 ms: send 100 Trying ourselves.
    async fn auto_provisional(&self, key: &TransactionKey) {
        let request = match self.inner.server.get(key) {
            Some(entry) if !entry.responded => entry.request.clone(),
            _ => return,
        };
        let trying = reply_to(&request, 100);
        if let Err(err) = self.respond(key, trying).await {
            warn!(%err, "automatic 100 Trying failed");
        }
    }

    fn with_client(
        &self,
        key: &TransactionKey,
        f: impl FnOnce(&mut ClientKind) -> (Effects, Vec<(SipTimer, Duration)>, Vec<SipTimer>),
    ) -> Option<Effects> {
        let mut entry = self.inner.client.get_mut(key)?;
        let (effects, schedules, cancels) = f(&mut entry.kind);
        let entry_ref = &mut *entry;
        self.apply_client_timers(key, entry_ref, schedules, cancels);
        Some(effects)
    }

    fn with_server(
        &self,
        key: &TransactionKey,
        f: impl FnOnce(&mut ServerKind) -> (Effects, Vec<(SipTimer, Duration)>, Vec<SipTimer>),
    ) -> Option<Effects> {
        self.with_server_entry(key, |entry| f(&mut entry.kind))
    }

    fn with_server_entry(
        &self,
        key: &TransactionKey,
        f: impl FnOnce(&mut ServerEntry) -> (Effects, Vec<(SipTimer, Duration)>, Vec<SipTimer>),
    ) -> Option<Effects> {
        let mut entry = self.inner.server.get_mut(key)?;
        let (effects, schedules, cancels) = f(&mut entry);
        for timer in cancels {
            if let Some(mut handle) = entry.timers.remove(&timer) {
                handle.cancel();
            }
        }
        for (timer, duration) in schedules {
            let tx = self.inner.cmd_tx.clone();
            let timer_key = key.clone();
            let handle = schedule(duration, move || {
                let _ = tx.send(Command::ServerTimer {
                    key: timer_key,
                    timer,
                });
            });
            if let Some(mut old) = entry.timers.insert(timer, handle) {
                old.cancel();
            }
        }
        Some(effects)
    }

    fn apply_client_timers(
        &self,
        key: &TransactionKey,
        entry: &mut ClientEntry,
        schedules: Vec<(SipTimer, Duration)>,
        cancels: Vec<SipTimer>,
    ) {
        for timer in cancels {
            if let Some(mut handle) = entry.timers.remove(&timer) {
                handle.cancel();
            }
        }
        for (timer, duration) in schedules {
            let tx = self.inner.cmd_tx.clone();
            let timer_key = key.clone();
            let handle = schedule(duration, move || {
                let _ = tx.send(Command::ClientTimer {
                    key: timer_key,
                    timer,
                });
            });
            if let Some(mut old) = entry.timers.insert(timer, handle) {
                old.cancel();
            }
        }
    }

    async fn run_client_effects(&self, key: &TransactionKey, effects: Effects) {
        let tu = self.inner.client.get(key).map(|entry| entry.value().tu.clone());
        let mut send_failed = false;
        for frame in &effects.frames {
            if let Err(err) = self.inner.dispatcher.dispatch(frame.clone()).await {
                warn!(%err, "transaction send failed");
                send_failed = true;
            }
        }
        if let Some(tu) = &tu {
            for response in effects.provisionals {
                tu.on_provisional(key, response).await;
            }
            for response in effects.finals {
                tu.on_final(key, response).await;
            }
            if effects.timeout {
                tu.on_timeout(key).await;
            }
            if effects.transport_error {
                tu.on_transport_error(key).await;
            }
        }
        if effects.terminated {
            self.remove_client(key).await;
        } else if send_failed {
            // Surface the failure through the state machine exactly once.
            Box::pin(self.client_transport_error(key)).await;
        }
    }

    async fn run_server_effects(&self, key: &TransactionKey, effects: Effects) {
        let tu = self
            .inner
            .server
            .get(key)
            .and_then(|entry| entry.value().tu.clone());
        let mut send_failed = false;
        for frame in &effects.frames {
            if let Err(err) = self.inner.dispatcher.dispatch(frame.clone()).await {
                warn!(%err, "transaction send failed");
                send_failed = true;
            }
        }
        if let Some(tu) = &tu {
            for ack in effects.acks {
                tu.on_ack(key, ack).await;
            }
            if effects.timeout {
                tu.on_timeout(key).await;
            }
            if effects.transport_error {
                tu.on_transport_error(key).await;
            }
        }
        if effects.terminated {
            self.remove_server(key).await;
        } else if send_failed {
            // INVITE server transactions survive transport errors (RFC 6026
            // §7.1); the FSM decides what the failure means.
            if let Some(effects) = self.with_server(key, |fsm| match fsm {
                ServerKind::Invite(fsm) => {
                    server_invite_effects(fsm.on_event(ServerInviteEvent::TransportError))
                }
                ServerKind::NonInvite(fsm) => server_non_invite_effects(
                    fsm.on_event(ServerNonInviteEvent::TransportError),
                ),
            }) {
                let tu = self
                    .inner
                    .server
                    .get(key)
                    .and_then(|entry| entry.value().tu.clone());
                if let Some(tu) = &tu {
                    if effects.transport_error {
                        tu.on_transport_error(key).await;
                    }
                }
                if effects.terminated {
                    self.remove_server(key).await;
                }
            }
        }
    }

    async fn remove_client(&self, key: &TransactionKey) {
        if let Some((_, mut entry)) = self.inner.client.remove(key) {
            for handle in entry.timers.values_mut() {
                handle.cancel();
            }
            entry.tu.on_terminated(key).await;
        }
    }

    async fn remove_server(&self, key: &TransactionKey) {
        if let Some((_, mut entry)) = self.inner.server.remove(key) {
            entry.provisional_timer.cancel();
            for handle in entry.timers.values_mut() {
                handle.cancel();
            }
            if let Some(tu) = entry.tu {
                tu.on_terminated(key).await;
            }
        }
    }
}

type ActionSplit = (Effects, Vec<(SipTimer, Duration)>, Vec<SipTimer>);

fn client_invite_effects(actions: Vec<ClientInviteAction>) -> ActionSplit {
    let mut effects = Effects::default();
    let mut schedules = Vec::new();
    let mut cancels = Vec::new();
    for action in actions {
        match action {
            ClientInviteAction::Transmit { frame } => effects.frames.push(frame),
            ClientInviteAction::Deliver(response) => {
                if response.start.is_provisional() {
                    effects.provisionals.push(response);
                } else {
                    effects.finals.push(response);
                }
            }
            ClientInviteAction::Schedule { timer, duration } => schedules.push((timer, duration)),
            ClientInviteAction::Cancel(timer) => cancels.push(timer),
            ClientInviteAction::Timeout => effects.timeout = true,
            ClientInviteAction::TransportFailure => effects.transport_error = true,
            ClientInviteAction::Terminate { .. } => effects.terminated = true,
        }
    }
    (effects, schedules, cancels)
}

fn client_non_invite_effects(actions: Vec<ClientNonInviteAction>) -> ActionSplit {
    let mut effects = Effects::default();
    let mut schedules = Vec::new();
    let mut cancels = Vec::new();
    for action in actions {
        match action {
            ClientNonInviteAction::Transmit { frame } => effects.frames.push(frame),
            ClientNonInviteAction::Deliver(response) => {
                if response.start.is_provisional() {
                    effects.provisionals.push(response);
                } else {
                    effects.finals.push(response);
                }
            }
            ClientNonInviteAction::Schedule { timer, duration } => {
                schedules.push((timer, duration))
            }
            ClientNonInviteAction::Cancel(timer) => cancels.push(timer),
            ClientNonInviteAction::Timeout => effects.timeout = true,
            ClientNonInviteAction::TransportFailure => effects.transport_error = true,
            ClientNonInviteAction::Terminate { .. } => effects.terminated = true,
        }
    }
    (effects, schedules, cancels)
}

fn server_invite_effects(actions: Vec<ServerInviteAction>) -> ActionSplit {
    let mut effects = Effects::default();
    let mut schedules = Vec::new();
    let mut cancels = Vec::new();
    for action in actions {
        match action {
            ServerInviteAction::Transmit { frame } => effects.frames.push(frame),
            ServerInviteAction::DeliverAck(ack) => effects.acks.push(ack),
            ServerInviteAction::Schedule { timer, duration } => schedules.push((timer, duration)),
            ServerInviteAction::Cancel(timer) => cancels.push(timer),
            ServerInviteAction::Timeout => effects.timeout = true,
            ServerInviteAction::TransportFailure => effects.transport_error = true,
            ServerInviteAction::Terminate { .. } => effects.terminated = true,
        }
    }
    (effects, schedules, cancels)
}

fn server_non_invite_effects(actions: Vec<ServerNonInviteAction>) -> ActionSplit {
    let mut effects = Effects::default();
    let mut schedules = Vec::new();
    let mut cancels = Vec::new();
    for action in actions {
        match action {
            ServerNonInviteAction::Transmit { frame } => effects.frames.push(frame),
            ServerNonInviteAction::Schedule { timer, duration } => {
                schedules.push((timer, duration))
            }
            ServerNonInviteAction::Cancel(timer) => cancels.push(timer),
            ServerNonInviteAction::TransportFailure => effects.transport_error = true,
            ServerNonInviteAction::Terminate { .. } => effects.terminated = true,
        }
    }
    (effects, schedules, cancels)
}
