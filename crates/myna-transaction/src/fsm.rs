use std::time::Duration;

use myna_core::{Headers, Method, Request, RequestLine, Response};
use myna_parse::{serialize_request, serialize_response};
use myna_timer::{SipTimer, TimerTable};
use smol_str::SmolStr;

use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
};

/// Events that drive the client INVITE transaction (RFC 3261 §17.1.1).
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(SipTimer),
    TransportError,
}

/// Actions emitted by the client INVITE transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInviteAction {
    Transmit { frame: String },
    Deliver(Response),
    Schedule { timer: SipTimer, duration: Duration },
    Cancel(SipTimer),
    /// Timer B expired without a final response.
    Timeout,
    TransportFailure,
    Terminate { reason: SmolStr },
}

/// Implements the INVITE client transaction, including the RFC 6026
/// Accepted state in which 2xx retransmissions flow up to the TU.
pub struct ClientInviteFsm {
    state: ClientInviteState,
    timers: TimerTable,
    a_interval: Duration,
    request: Option<Request>,
    last_frame: Option<String>,
    last_ack: Option<String>,
}

impl ClientInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.t1(),
            timers,
            request: None,
            last_frame: None,
            last_ack: None,
        }
    }

    pub fn state(&self) -> ClientInviteState {
        self.state
    }

    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<ClientInviteAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) => self.handle_send(invite),
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                self.handle_first_final(response)
            }
            (Accepted, ClientInviteEvent::ReceiveFinal(response))
                if response.start.is_success() =>
            {
                // 2xx retransmissions reach the TU, which owns the ACK.
                vec![ClientInviteAction::Deliver(response)]
            }
            (Completed, ClientInviteEvent::ReceiveFinal(response))
                if !response.start.is_success() =>
            {
                self.retransmit_ack()
            }
            (Calling, ClientInviteEvent::TimerFired(SipTimer::A)) => self.handle_timer_a(),
            (Calling | Proceeding, ClientInviteEvent::TimerFired(SipTimer::B)) => {
                self.state = Terminated;
                vec![
                    ClientInviteAction::Cancel(SipTimer::A),
                    ClientInviteAction::Timeout,
                    ClientInviteAction::Terminate {
                        reason: SmolStr::new("Timer B expired"),
                    },
                ]
            }
            (Completed, ClientInviteEvent::TimerFired(SipTimer::D)) => {
                self.state = Terminated;
                vec![ClientInviteAction::Terminate {
                    reason: SmolStr::new("Timer D expired"),
                }]
            }
            (Accepted, ClientInviteEvent::TimerFired(SipTimer::M)) => {
                self.state = Terminated;
                vec![ClientInviteAction::Terminate {
                    reason: SmolStr::new("Timer M expired"),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    ClientInviteAction::TransportFailure,
                    ClientInviteAction::Terminate {
                        reason: SmolStr::new("transport error"),
                    },
                ]
            }
            // A timer firing outside its owning state is a no-op.
            (_, ClientInviteEvent::TimerFired(_)) => Vec::new(),
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, invite: Request) -> Vec<ClientInviteAction> {
        let frame = serialize_request(&invite);
        self.request = Some(invite);
        self.last_frame = Some(frame.clone());
        let mut actions = vec![ClientInviteAction::Transmit { frame }];
        if self.timers.retransmits() {
            actions.push(ClientInviteAction::Schedule {
                timer: SipTimer::A,
                duration: self.timers.duration(SipTimer::A),
            });
        }
        actions.push(ClientInviteAction::Schedule {
            timer: SipTimer::B,
            duration: self.timers.duration(SipTimer::B),
        });
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientInviteAction> {
        self.state = ClientInviteState::Proceeding;
        vec![
            ClientInviteAction::Cancel(SipTimer::A),
            ClientInviteAction::Deliver(response),
        ]
    }

    fn handle_first_final(&mut self, response: Response) -> Vec<ClientInviteAction> {
        let mut actions = vec![
            ClientInviteAction::Cancel(SipTimer::A),
            ClientInviteAction::Cancel(SipTimer::B),
        ];
        if response.start.is_success() {
            self.state = ClientInviteState::Accepted;
            actions.push(ClientInviteAction::Deliver(response));
            actions.push(ClientInviteAction::Schedule {
                timer: SipTimer::M,
                duration: self.timers.duration(SipTimer::M),
            });
        } else {
            self.state = ClientInviteState::Completed;
            actions.push(ClientInviteAction::Deliver(response.clone()));
            if let Some(request) = &self.request {
                let ack = serialize_request(&build_non_2xx_ack(request, &response));
                self.last_ack = Some(ack.clone());
                actions.push(ClientInviteAction::Transmit { frame: ack });
            }
            actions.push(ClientInviteAction::Schedule {
                timer: SipTimer::D,
                duration: self.timers.duration(SipTimer::D),
            });
        }
        actions
    }

    fn retransmit_ack(&mut self) -> Vec<ClientInviteAction> {
        match &self.last_ack {
            Some(ack) => vec![ClientInviteAction::Transmit { frame: ack.clone() }],
            None => Vec::new(),
        }
    }

    fn handle_timer_a(&mut self) -> Vec<ClientInviteAction> {
        let Some(frame) = &self.last_frame else {
            return Vec::new();
        };
        // min(2^n * T1, T2) backoff.
        self.a_interval = (self.a_interval * 2).min(self.timers.t2());
        vec![
            ClientInviteAction::Transmit {
                frame: frame.clone(),
            },
            ClientInviteAction::Schedule {
                timer: SipTimer::A,
                duration: self.a_interval,
            },
        ]
    }
}

/// Builds the ACK a transaction owes for a non-2xx final (RFC 3261 §17.1.1.3):
/// same branch and CSeq number as the INVITE, To taken from the response.
fn build_non_2xx_ack(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.headers.get("Via") {
        headers.push("Via", via.clone());
    }
    if let Some(from) = invite.headers.get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = response.headers.get("To") {
        headers.push("To", to.clone());
    } else if let Some(to) = invite.headers.get("To") {
        headers.push("To", to.clone());
    }
    if let Some(call_id) = invite.headers.get("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    let cseq_number = invite
        .headers
        .get("CSeq")
        .and_then(|v| v.split_whitespace().next().map(str::to_owned))
        .unwrap_or_else(|| "1".to_owned());
    headers.push("CSeq", SmolStr::new(format!("{} ACK", cseq_number)));
    headers.push("Max-Forwards", "70");
    for route in invite.headers.get_all("Route") {
        headers.push("Route", route.clone());
    }
    Request::new(
        RequestLine::new(Method::Ack, invite.start.uri.clone()),
        headers,
        bytes::Bytes::new(),
    )
}

/// Events that drive the server INVITE transaction (RFC 3261 §17.2.1).
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    ReceiveInvite(Request),
    ReceiveAck(Request),
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(SipTimer),
    TransportError,
}

/// Actions emitted by the server INVITE transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInviteAction {
    Transmit { frame: String },
    /// ACK for a 2xx passed up to the TU for absorption (RFC 6026).
    DeliverAck(Request),
    Schedule { timer: SipTimer, duration: Duration },
    Cancel(SipTimer),
    /// Timer H expired: the ACK never arrived.
    Timeout,
    TransportFailure,
    Terminate { reason: SmolStr },
}

/// Implements the INVITE server transaction. Transport errors do not tear
/// the transaction down (RFC 6026 §7.1); only timers terminate it.
pub struct ServerInviteFsm {
    state: ServerInviteState,
    timers: TimerTable,
    g_interval: Duration,
    last_provisional: Option<String>,
    last_final: Option<String>,
}

impl ServerInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.t1(),
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn state(&self) -> ServerInviteState {
        self.state
    }

    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<ServerInviteAction> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerInviteEvent::ReceiveInvite(_)) => {
                // Retransmitted INVITE: re-send the latest provisional.
                match &self.last_provisional {
                    Some(frame) => vec![ServerInviteAction::Transmit {
                        frame: frame.clone(),
                    }],
                    None => Vec::new(),
                }
            }
            (Completed, ServerInviteEvent::ReceiveInvite(_)) => match &self.last_final {
                Some(frame) => vec![ServerInviteAction::Transmit {
                    frame: frame.clone(),
                }],
                None => Vec::new(),
            },
            (Proceeding, ServerInviteEvent::SendProvisional(response)) => {
                let frame = serialize_response(&response);
                self.last_provisional = Some(frame.clone());
                vec![ServerInviteAction::Transmit { frame }]
            }
            (Proceeding, ServerInviteEvent::SendFinal(response)) => self.handle_final(response),
            (Accepted, ServerInviteEvent::SendFinal(response))
                if response.start.is_success() =>
            {
                // TU-driven 2xx retransmission while Accepted.
                vec![ServerInviteAction::Transmit {
                    frame: serialize_response(&response),
                }]
            }
            (Completed, ServerInviteEvent::ReceiveAck(_)) => {
                self.state = Confirmed;
                vec![
                    ServerInviteAction::Cancel(SipTimer::G),
                    ServerInviteAction::Cancel(SipTimer::H),
                    ServerInviteAction::Schedule {
                        timer: SipTimer::I,
                        duration: self.timers.duration(SipTimer::I),
                    },
                ]
            }
            (Accepted, ServerInviteEvent::ReceiveAck(ack)) => {
                vec![ServerInviteAction::DeliverAck(ack)]
            }
            (Completed, ServerInviteEvent::TimerFired(SipTimer::G)) => self.handle_timer_g(),
            (Completed, ServerInviteEvent::TimerFired(SipTimer::H)) => {
                self.state = Terminated;
                vec![
                    ServerInviteAction::Cancel(SipTimer::G),
                    ServerInviteAction::Timeout,
                    ServerInviteAction::Terminate {
                        reason: SmolStr::new("Timer H expired"),
                    },
                ]
            }
            (Confirmed, ServerInviteEvent::TimerFired(SipTimer::I)) => {
                self.state = Terminated;
                vec![ServerInviteAction::Terminate {
                    reason: SmolStr::new("Timer I expired"),
                }]
            }
            (Accepted, ServerInviteEvent::TimerFired(SipTimer::L)) => {
                self.state = Terminated;
                vec![ServerInviteAction::Terminate {
                    reason: SmolStr::new("Timer L expired"),
                }]
            }
            (_, ServerInviteEvent::TransportError) => {
                // Surface the failure; state survives until a timer fires.
                vec![ServerInviteAction::TransportFailure]
            }
            (_, ServerInviteEvent::TimerFired(_)) => Vec::new(),
            _ => Vec::new(),
        }
    }

    fn handle_final(&mut self, response: Response) -> Vec<ServerInviteAction> {
        let frame = serialize_response(&response);
        if response.start.is_success() {
            self.state = ServerInviteState::Accepted;
            vec![
                ServerInviteAction::Transmit { frame },
                ServerInviteAction::Schedule {
                    timer: SipTimer::L,
                    duration: self.timers.duration(SipTimer::L),
                },
            ]
        } else {
            self.state = ServerInviteState::Completed;
            self.last_final = Some(frame.clone());
            self.g_interval = self.timers.t1();
            let mut actions = vec![ServerInviteAction::Transmit { frame }];
            if self.timers.retransmits() {
                actions.push(ServerInviteAction::Schedule {
                    timer: SipTimer::G,
                    duration: self.timers.duration(SipTimer::G),
                });
            }
            actions.push(ServerInviteAction::Schedule {
                timer: SipTimer::H,
                duration: self.timers.duration(SipTimer::H),
            });
            actions
        }
    }

    fn handle_timer_g(&mut self) -> Vec<ServerInviteAction> {
        let Some(frame) = &self.last_final else {
            return Vec::new();
        };
        let retransmit = ServerInviteAction::Transmit {
            frame: frame.clone(),
        };
        self.g_interval = (self.g_interval * 2).min(self.timers.t2());
        vec![
            retransmit,
            ServerInviteAction::Schedule {
                timer: SipTimer::G,
                duration: self.g_interval,
            },
        ]
    }
}

/// Events that drive the client non-INVITE transaction (RFC 3261 §17.1.2).
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(SipTimer),
    TransportError,
}

/// Actions emitted by the client non-INVITE transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNonInviteAction {
    Transmit { frame: String },
    Deliver(Response),
    Schedule { timer: SipTimer, duration: Duration },
    Cancel(SipTimer),
    /// Timer F expired without a final response.
    Timeout,
    TransportFailure,
    Terminate { reason: SmolStr },
}

/// Implements the non-INVITE client transaction (RFC 3261 Figure 6).
pub struct ClientNonInviteFsm {
    state: ClientNonInviteState,
    timers: TimerTable,
    e_interval: Duration,
    last_frame: Option<String>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.t1(),
            timers,
            last_frame: None,
        }
    }

    pub fn state(&self) -> ClientNonInviteState {
        self.state
    }

    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<ClientNonInviteAction> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) => self.handle_send(request),
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![ClientNonInviteAction::Deliver(response)]
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.state = Completed;
                vec![
                    ClientNonInviteAction::Cancel(SipTimer::E),
                    ClientNonInviteAction::Cancel(SipTimer::F),
                    ClientNonInviteAction::Deliver(response),
                    ClientNonInviteAction::Schedule {
                        timer: SipTimer::K,
                        duration: self.timers.duration(SipTimer::K),
                    },
                ]
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(SipTimer::E)) => {
                self.handle_timer_e()
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(SipTimer::F)) => {
                self.state = Terminated;
                vec![
                    ClientNonInviteAction::Cancel(SipTimer::E),
                    ClientNonInviteAction::Timeout,
                    ClientNonInviteAction::Terminate {
                        reason: SmolStr::new("Timer F expired"),
                    },
                ]
            }
            (Completed, ClientNonInviteEvent::TimerFired(SipTimer::K)) => {
                self.state = Terminated;
                vec![ClientNonInviteAction::Terminate {
                    reason: SmolStr::new("Timer K expired"),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ClientNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    ClientNonInviteAction::TransportFailure,
                    ClientNonInviteAction::Terminate {
                        reason: SmolStr::new("transport error"),
                    },
                ]
            }
            (_, _) => Vec::new(),
        }
    }

    fn handle_send(&mut self, request: Request) -> Vec<ClientNonInviteAction> {
        let frame = serialize_request(&request);
        self.last_frame = Some(frame.clone());
        let mut actions = vec![ClientNonInviteAction::Transmit { frame }];
        if self.timers.retransmits() {
            actions.push(ClientNonInviteAction::Schedule {
                timer: SipTimer::E,
                duration: self.timers.duration(SipTimer::E),
            });
        }
        actions.push(ClientNonInviteAction::Schedule {
            timer: SipTimer::F,
            duration: self.timers.duration(SipTimer::F),
        });
        actions
    }

    fn handle_timer_e(&mut self) -> Vec<ClientNonInviteAction> {
        let Some(frame) = &self.last_frame else {
            return Vec::new();
        };
        self.e_interval = (self.e_interval * 2).min(self.timers.t2());
        vec![
            ClientNonInviteAction::Transmit {
                frame: frame.clone(),
            },
            ClientNonInviteAction::Schedule {
                timer: SipTimer::E,
                duration: self.e_interval,
            },
        ]
    }
}

/// Events that drive the server non-INVITE transaction (RFC 3261 §17.2.2).
#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    ReceiveRequest(Request),
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(SipTimer),
    TransportError,
}

/// Actions emitted by the server non-INVITE transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNonInviteAction {
    Transmit { frame: String },
    Schedule { timer: SipTimer, duration: Duration },
    Cancel(SipTimer),
    TransportFailure,
    Terminate { reason: SmolStr },
}

/// Implements the non-INVITE server transaction (RFC 3261 Figure 8).
pub struct ServerNonInviteFsm {
    state: ServerNonInviteState,
    timers: TimerTable,
    last_provisional: Option<String>,
    last_final: Option<String>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TimerTable) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn state(&self) -> ServerNonInviteState {
        self.state
    }

    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<ServerNonInviteAction> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            (Trying, ServerNonInviteEvent::ReceiveRequest(_)) => {
                // Retransmissions in Trying are absorbed.
                Vec::new()
            }
            (Proceeding, ServerNonInviteEvent::ReceiveRequest(_)) => {
                match &self.last_provisional {
                    Some(frame) => vec![ServerNonInviteAction::Transmit {
                        frame: frame.clone(),
                    }],
                    None => Vec::new(),
                }
            }
            (Completed, ServerNonInviteEvent::ReceiveRequest(_)) => match &self.last_final {
                Some(frame) => vec![ServerNonInviteAction::Transmit {
                    frame: frame.clone(),
                }],
                None => Vec::new(),
            },
            (Trying | Proceeding, ServerNonInviteEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                let frame = serialize_response(&response);
                self.last_provisional = Some(frame.clone());
                vec![ServerNonInviteAction::Transmit { frame }]
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(response)) => {
                self.state = Completed;
                let frame = serialize_response(&response);
                self.last_final = Some(frame.clone());
                vec![
                    ServerNonInviteAction::Transmit { frame },
                    ServerNonInviteAction::Schedule {
                        timer: SipTimer::J,
                        duration: self.timers.duration(SipTimer::J),
                    },
                ]
            }
            (Completed, ServerNonInviteEvent::TimerFired(SipTimer::J)) => {
                self.state = Terminated;
                vec![ServerNonInviteAction::Terminate {
                    reason: SmolStr::new("Timer J expired"),
                }]
            }
            (Terminated, _) => Vec::new(),
            (_, ServerNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![
                    ServerNonInviteAction::TransportFailure,
                    ServerNonInviteAction::Terminate {
                        reason: SmolStr::new("transport error"),
                    },
                ]
            }
            (_, _) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use myna_core::{SipUri, StatusLine};

    fn unreliable() -> TimerTable {
        TimerTable::new(false)
    }

    fn reliable() -> TimerTable {
        TimerTable::new(true)
    }

    fn sample_invite() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP host;branch=z9hG4bKtest");
        headers.push("From", "<sip:alice@a.com>;tag=1");
        headers.push("To", "<sip:bob@b.com>");
        headers.push("Call-ID", "cid");
        headers.push("CSeq", "1 INVITE");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@b.com").expect("uri")),
            headers,
            Bytes::new(),
        )
    }

    fn sample_request() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP host;branch=z9hG4bKtest");
        headers.push("CSeq", "1 OPTIONS");
        Request::new(
            RequestLine::new(Method::Options, SipUri::parse("sip:b.com").expect("uri")),
            headers,
            Bytes::new(),
        )
    }

    fn sample_response(code: u16) -> Response {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP host;branch=z9hG4bKtest");
        headers.push("To", "<sip:bob@b.com>;tag=totag");
        Response::new(
            StatusLine::new(code, myna_core::default_reason(code)).expect("status"),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn ict_2xx_enters_accepted_and_forwards_retransmits() {
        let mut fsm = ClientInviteFsm::new(unreliable());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(200)));
        assert_eq!(fsm.state(), ClientInviteState::Accepted);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Deliver(_))));
        assert!(actions.iter().any(|a| matches!(
            a,
            ClientInviteAction::Schedule {
                timer: SipTimer::M,
                ..
            }
        )));
        // The transaction never generates an ACK for a 2xx.
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Transmit { frame } if frame.starts_with("ACK"))));

        let retrans = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(200)));
        assert!(retrans
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Deliver(_))));
    }

    #[test]
    fn ict_non_2xx_generates_and_retransmits_ack() {
        let mut fsm = ClientInviteFsm::new(unreliable());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(486)));
        assert_eq!(fsm.state(), ClientInviteState::Completed);
        let ack_sent = actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Transmit { frame } if frame.starts_with("ACK ")));
        assert!(ack_sent, "ACK must be generated for non-2xx finals");
        assert!(actions.iter().any(|a| matches!(
            a,
            ClientInviteAction::Schedule {
                timer: SipTimer::D,
                ..
            }
        )));

        // A retransmitted final triggers only an ACK retransmit.
        let retrans = fsm.on_event(ClientInviteEvent::ReceiveFinal(sample_response(486)));
        assert_eq!(retrans.len(), 1);
        assert!(matches!(&retrans[0], ClientInviteAction::Transmit { frame } if frame.starts_with("ACK ")));

        let after_d = fsm.on_event(ClientInviteEvent::TimerFired(SipTimer::D));
        assert_eq!(fsm.state(), ClientInviteState::Terminated);
        assert!(after_d
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Terminate { .. })));
    }

    #[test]
    fn ict_ack_carries_to_tag_and_cseq_method() {
        let ack = build_non_2xx_ack(&sample_invite(), &sample_response(404));
        assert_eq!(ack.start.method, Method::Ack);
        assert!(ack
            .headers
            .get("To")
            .map(|v| v.contains("tag=totag"))
            .unwrap_or(false));
        assert_eq!(ack.headers.get("CSeq").map(|v| v.as_str()), Some("1 ACK"));
    }

    #[test]
    fn ict_retransmits_with_capped_backoff() {
        let mut fsm = ClientInviteFsm::new(unreliable());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let mut last = Duration::ZERO;
        for _ in 0..5 {
            let actions = fsm.on_event(ClientInviteEvent::TimerFired(SipTimer::A));
            let scheduled = actions
                .iter()
                .find_map(|a| match a {
                    ClientInviteAction::Schedule { duration, .. } => Some(*duration),
                    _ => None,
                })
                .expect("reschedule");
            assert!(scheduled >= last);
            assert!(scheduled <= Duration::from_secs(4));
            last = scheduled;
        }
        assert_eq!(last, Duration::from_secs(4));
    }

    #[test]
    fn ict_timer_b_times_out() {
        let mut fsm = ClientInviteFsm::new(unreliable());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::TimerFired(SipTimer::B));
        assert_eq!(fsm.state(), ClientInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Timeout)));
    }

    #[test]
    fn ict_provisional_stops_retransmission() {
        let mut fsm = ClientInviteFsm::new(unreliable());
        fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        let actions = fsm.on_event(ClientInviteEvent::ReceiveProvisional(sample_response(180)));
        assert_eq!(fsm.state(), ClientInviteState::Proceeding);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientInviteAction::Cancel(SipTimer::A))));
        // Timer A firing in Proceeding is a no-op.
        assert!(fsm
            .on_event(ClientInviteEvent::TimerFired(SipTimer::A))
            .is_empty());
    }

    #[test]
    fn ict_reliable_transport_skips_timer_a() {
        let mut fsm = ClientInviteFsm::new(reliable());
        let actions = fsm.on_event(ClientInviteEvent::SendInvite(sample_invite()));
        assert!(!actions.iter().any(|a| matches!(
            a,
            ClientInviteAction::Schedule {
                timer: SipTimer::A,
                ..
            }
        )));
    }

    #[test]
    fn ist_non_2xx_retransmits_until_ack() {
        let mut fsm = ServerInviteFsm::new(unreliable());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_invite()));
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        assert_eq!(fsm.state(), ServerInviteState::Completed);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerInviteAction::Schedule {
                timer: SipTimer::G,
                ..
            }
        )));

        let g = fsm.on_event(ServerInviteEvent::TimerFired(SipTimer::G));
        assert!(g.iter().any(|a| matches!(a, ServerInviteAction::Transmit { .. })));

        let ack = fsm.on_event(ServerInviteEvent::ReceiveAck(sample_invite()));
        assert_eq!(fsm.state(), ServerInviteState::Confirmed);
        assert!(ack.iter().any(|a| matches!(
            a,
            ServerInviteAction::Schedule {
                timer: SipTimer::I,
                ..
            }
        )));

        let i = fsm.on_event(ServerInviteEvent::TimerFired(SipTimer::I));
        assert_eq!(fsm.state(), ServerInviteState::Terminated);
        assert!(i.iter().any(|a| matches!(a, ServerInviteAction::Terminate { .. })));
    }

    #[test]
    fn ist_2xx_enters_accepted_and_hands_ack_to_tu() {
        let mut fsm = ServerInviteFsm::new(unreliable());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_invite()));
        let actions = fsm.on_event(ServerInviteEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state(), ServerInviteState::Accepted);
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerInviteAction::Schedule {
                timer: SipTimer::L,
                ..
            }
        )));

        let ack = fsm.on_event(ServerInviteEvent::ReceiveAck(sample_invite()));
        assert!(ack
            .iter()
            .any(|a| matches!(a, ServerInviteAction::DeliverAck(_))));

        let l = fsm.on_event(ServerInviteEvent::TimerFired(SipTimer::L));
        assert_eq!(fsm.state(), ServerInviteState::Terminated);
        assert!(l.iter().any(|a| matches!(a, ServerInviteAction::Terminate { .. })));
    }

    #[test]
    fn ist_retransmitted_invite_resends_last_provisional() {
        let mut fsm = ServerInviteFsm::new(unreliable());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_invite()));
        fsm.on_event(ServerInviteEvent::SendProvisional(sample_response(180)));
        let actions = fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_invite()));
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ServerInviteAction::Transmit { frame } if frame.starts_with("SIP/2.0 180")));
    }

    #[test]
    fn ist_timer_h_is_a_timeout() {
        let mut fsm = ServerInviteFsm::new(unreliable());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_invite()));
        fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        let actions = fsm.on_event(ServerInviteEvent::TimerFired(SipTimer::H));
        assert_eq!(fsm.state(), ServerInviteState::Terminated);
        assert!(actions.iter().any(|a| matches!(a, ServerInviteAction::Timeout)));
    }

    #[test]
    fn ist_transport_error_does_not_terminate() {
        let mut fsm = ServerInviteFsm::new(unreliable());
        fsm.on_event(ServerInviteEvent::ReceiveInvite(sample_invite()));
        fsm.on_event(ServerInviteEvent::SendFinal(sample_response(486)));
        let actions = fsm.on_event(ServerInviteEvent::TransportError);
        assert_eq!(fsm.state(), ServerInviteState::Completed);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ServerInviteAction::TransportFailure)));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ServerInviteAction::Terminate { .. })));
    }

    #[test]
    fn nict_happy_path() {
        let mut fsm = ClientNonInviteFsm::new(unreliable());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request()));
        assert_eq!(fsm.state(), ClientNonInviteState::Trying);

        let provisional = fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(sample_response(100)));
        assert_eq!(fsm.state(), ClientNonInviteState::Proceeding);
        assert!(provisional
            .iter()
            .any(|a| matches!(a, ClientNonInviteAction::Deliver(_))));

        let fin = fsm.on_event(ClientNonInviteEvent::ReceiveFinal(sample_response(200)));
        assert_eq!(fsm.state(), ClientNonInviteState::Completed);
        assert!(fin.iter().any(|a| matches!(
            a,
            ClientNonInviteAction::Schedule {
                timer: SipTimer::K,
                ..
            }
        )));

        fsm.on_event(ClientNonInviteEvent::TimerFired(SipTimer::K));
        assert_eq!(fsm.state(), ClientNonInviteState::Terminated);
    }

    #[test]
    fn nict_retransmits_with_capped_backoff() {
        let mut fsm = ClientNonInviteFsm::new(unreliable());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request()));
        let mut intervals = Vec::new();
        for _ in 0..4 {
            let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(SipTimer::E));
            let scheduled = actions
                .iter()
                .find_map(|a| match a {
                    ClientNonInviteAction::Schedule { duration, .. } => Some(*duration),
                    _ => None,
                })
                .expect("reschedule");
            intervals.push(scheduled);
        }
        assert_eq!(
            intervals,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn nict_duplicate_final_is_absorbed() {
        let mut fsm = ClientNonInviteFsm::new(unreliable());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request()));
        fsm.on_event(ClientNonInviteEvent::ReceiveFinal(sample_response(200)));
        let dup = fsm.on_event(ClientNonInviteEvent::ReceiveFinal(sample_response(200)));
        assert!(!dup
            .iter()
            .any(|a| matches!(a, ClientNonInviteAction::Deliver(_))));
    }

    #[test]
    fn nict_timer_f_times_out() {
        let mut fsm = ClientNonInviteFsm::new(unreliable());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request()));
        let actions = fsm.on_event(ClientNonInviteEvent::TimerFired(SipTimer::F));
        assert_eq!(fsm.state(), ClientNonInviteState::Terminated);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ClientNonInviteAction::Timeout)));
    }

    #[test]
    fn nist_retransmits_final_on_duplicate_request() {
        let mut fsm = ServerNonInviteFsm::new(unreliable());
        fsm.on_event(ServerNonInviteEvent::ReceiveRequest(sample_request()));
        fsm.on_event(ServerNonInviteEvent::SendFinal(sample_response(200)));
        assert_eq!(fsm.state(), ServerNonInviteState::Completed);

        let dup = fsm.on_event(ServerNonInviteEvent::ReceiveRequest(sample_request()));
        assert_eq!(dup.len(), 1);
        assert!(matches!(&dup[0], ServerNonInviteAction::Transmit { frame } if frame.starts_with("SIP/2.0 200")));

        fsm.on_event(ServerNonInviteEvent::TimerFired(SipTimer::J));
        assert_eq!(fsm.state(), ServerNonInviteState::Terminated);
    }

    #[test]
    fn nist_provisional_then_final() {
        let mut fsm = ServerNonInviteFsm::new(unreliable());
        fsm.on_event(ServerNonInviteEvent::ReceiveRequest(sample_request()));
        fsm.on_event(ServerNonInviteEvent::SendProvisional(sample_response(100)));
        assert_eq!(fsm.state(), ServerNonInviteState::Proceeding);
        let dup = fsm.on_event(ServerNonInviteEvent::ReceiveRequest(sample_request()));
        assert!(matches!(&dup[0], ServerNonInviteAction::Transmit { frame } if frame.starts_with("SIP/2.0 100")));
        fsm.on_event(ServerNonInviteEvent::SendFinal(sample_response(404)));
        assert_eq!(fsm.state(), ServerNonInviteState::Completed);
    }

    #[test]
    fn terminal_state_absorbs_everything() {
        let mut fsm = ClientNonInviteFsm::new(unreliable());
        fsm.on_event(ClientNonInviteEvent::SendRequest(sample_request()));
        fsm.on_event(ClientNonInviteEvent::TimerFired(SipTimer::F));
        assert!(fsm
            .on_event(ClientNonInviteEvent::ReceiveFinal(sample_response(200)))
            .is_empty());
        assert!(fsm
            .on_event(ClientNonInviteEvent::TimerFired(SipTimer::E))
            .is_empty());
    }
}
