//! Message-data transaction engine.
//!
//! Every transaction is a session keyed by its 16-byte UUID: the caller
//! generates it on `Mr`/`Mn`, the replier echoes it in every response.
//! Sessions run the Notify/Request/Reply/Confirm state machine, retry
//! requests with a bounded exponential back-off, and reach exactly one
//! terminal state with exactly one terminal callback.
//!
//! Transport is UDP unless the telegram flags carry the TCP bit, in which
//! case frames ride pooled connections framed by the header's dataset
//! length.

pub mod connection;

use crate::config::TelegramFlags;
use crate::error::{ErrorKind, NetError, Result, TrdpError};
use crate::net::sockets::{SocketManager, TOKEN_CONN_BASE};
use crate::slots::{Handle, Slots};
use crate::stats::Statistics;
use crate::wire::header::{
    self, encode_md, reply_status, MdHeader, MsgType, MAX_MD_PAYLOAD,
};
use connection::{ConnState, TcpConn};
use hashbrown::HashMap;
use indexmap::IndexSet;
use keel::logging::{self, Logger};
use keel::SessionUuid;
use mio::{Interest, Registry, Token};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a terminal session lingers so late frames resolve to it instead
/// of "unknown session".
const SESSION_GRACE: Duration = Duration::from_secs(5);

/// Cap on the retry exponent to keep the shift well-defined.
const MAX_RETRIES: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MdHandle(pub(crate) SessionUuid);

impl MdHandle {
    pub fn uuid(&self) -> SessionUuid {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub(crate) Handle);

#[derive(Debug, Clone)]
pub struct NotifyParams {
    pub com_id: u32,
    pub dest: SocketAddr,
    pub dest_uri: String,
    pub flags: TelegramFlags,
}

#[derive(Debug, Clone)]
pub struct RequestParams {
    pub com_id: u32,
    pub dest: SocketAddr,
    pub dest_uri: String,
    /// Replies to wait for before completing; 0 counts as 1.
    pub expected_replies: u32,
    /// Zero takes the session default.
    pub reply_timeout: Duration,
    /// Zero takes the session default.
    pub confirm_timeout: Duration,
    /// `None` takes the session default.
    pub retries: Option<u32>,
    pub flags: TelegramFlags,
}

#[derive(Debug, Clone)]
pub struct ListenerParams {
    pub com_id: u32,
    /// Own URI this listener answers for; empty accepts any destination URI.
    pub uri: String,
}

/// Message-data notification delivered to a caller or listener callback.
/// Payload and URIs borrow receive storage and are valid only during the
/// callback.
pub struct MdEvent<'a> {
    pub session: MdHandle,
    pub com_id: u32,
    pub msg_type: MsgType,
    pub status: ErrorKind,
    pub payload: &'a [u8],
    pub source_uri: &'a str,
    pub dest_uri: &'a str,
    pub source: Option<SocketAddr>,
    /// A request landed; the application owes a `send_reply*`.
    pub needs_reply: bool,
    /// An "Mq" landed; the application owes a `send_confirm`.
    pub needs_confirm: bool,
    /// This is the session's one terminal notification.
    pub terminal: bool,
}

impl<'a> MdEvent<'a> {
    pub fn copy_payload(&self) -> Vec<u8> {
        self.payload.to_vec()
    }
}

pub type MdCallback = Box<dyn FnMut(&MdEvent<'_>) + Send>;

/// Where a frame came from / where the answer goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Udp,
    Tcp(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Replier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MdState {
    New,
    WaitForReply,
    WaitForConfirm,
    Completed,
    Failed,
}

struct MdSession {
    uuid: SessionUuid,
    role: Role,
    state: MdState,
    com_id: u32,
    peer: SocketAddr,
    source_uri: String,
    dest_uri: String,
    expected_replies: u32,
    replies_received: u32,
    reply_timeout: Duration,
    confirm_timeout: Duration,
    retries_left: u32,
    retries_configured: u32,
    retry_index: u32,
    timer: Option<Instant>,
    transport: Transport,
    sequence: u32,
    /// Last caller frame, kept for retransmission.
    last_frame: Vec<u8>,
    callback: Option<MdCallback>,
    listener_index: Option<usize>,
    terminal_at: Option<Instant>,
    pending_terminal: Option<(ErrorKind, MsgType)>,
    terminal_delivered: bool,
}

impl MdSession {
    fn is_terminal(&self) -> bool {
        matches!(self.state, MdState::Completed | MdState::Failed)
    }

    fn enter_terminal(&mut self, state: MdState, now: Instant) {
        self.state = state;
        self.timer = None;
        self.terminal_at = Some(now);
    }
}

struct Listener {
    com_id: u32,
    uri: String,
    callback: Option<MdCallback>,
}

pub(crate) struct MdEngine {
    sessions: Slots<MdSession>,
    by_uuid: HashMap<SessionUuid, usize>,
    listeners: Slots<Listener>,
    connections: Slots<TcpConn>,
    live_conns: IndexSet<usize>,
    conns_by_peer: HashMap<SocketAddr, usize>,

    own_uri: String,
    etb_topo_count: u32,
    op_trn_topo_count: u32,
    default_reply_timeout: Duration,
    default_confirm_timeout: Duration,
    idle_timeout: Duration,
    default_retries: u32,
    max_sessions: usize,

    log: Logger,
}

impl MdEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_uri: String,
        etb_topo_count: u32,
        op_trn_topo_count: u32,
        default_reply_timeout: Duration,
        default_confirm_timeout: Duration,
        idle_timeout: Duration,
        default_retries: u32,
        max_sessions: usize,
        log: &Logger,
    ) -> MdEngine {
        MdEngine {
            sessions: Slots::new(),
            by_uuid: HashMap::new(),
            listeners: Slots::new(),
            connections: Slots::new(),
            live_conns: IndexSet::new(),
            conns_by_peer: HashMap::new(),
            own_uri,
            etb_topo_count,
            op_trn_topo_count,
            default_reply_timeout,
            default_confirm_timeout,
            idle_timeout,
            default_retries: default_retries.min(MAX_RETRIES),
            max_sessions,
            log: log.new(logging::o!()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, handle: MdHandle) -> Option<MdState> {
        self.by_uuid
            .get(&handle.0)
            .and_then(|&i| self.sessions.get_index(i))
            .map(|s| s.state)
    }

    pub fn add_listener(
        &mut self,
        params: ListenerParams,
        callback: MdCallback,
    ) -> Result<ListenerHandle> {
        if params.com_id == 0 {
            return Err(TrdpError::param("ComId must not be zero"));
        }
        let handle = self.listeners.insert(Listener {
            com_id: params.com_id,
            uri: params.uri,
            callback: Some(callback),
        });
        logging::debug!(self.log, "listener registered"; "com_id" => params.com_id);
        Ok(ListenerHandle(handle))
    }

    pub fn remove_listener(&mut self, handle: ListenerHandle) -> Result<()> {
        self.listeners
            .remove(handle.0)
            .map(|l| {
                logging::debug!(self.log, "listener removed"; "com_id" => l.com_id);
            })
            .ok_or_else(|| TrdpError::param("stale listener handle"))
    }

    /// Sends a one-way notification. No session outlives the call.
    pub fn send_notify(
        &mut self,
        params: NotifyParams,
        payload: &[u8],
        sockets: &mut SocketManager,
        registry: &Registry,
        now: Instant,
        stats: &mut Statistics,
    ) -> Result<()> {
        if payload.len() > MAX_MD_PAYLOAD {
            return Err(TrdpError::param("payload exceeds message-data maximum"));
        }
        let frame = encode_md(
            &MdHeader {
                sequence: 0,
                msg_type: MsgType::Mn,
                com_id: params.com_id,
                etb_topo_count: self.etb_topo_count,
                op_trn_topo_count: self.op_trn_topo_count,
                dataset_length: payload.len() as u32,
                reply_status: reply_status::OK,
                session_id: SessionUuid::generate(),
                reply_timeout_us: 0,
                source_uri: self.own_uri.clone(),
                dest_uri: params.dest_uri,
            },
            payload,
        );
        let transport = self.pick_transport(params.flags, params.dest, None, registry, now)?;
        self.transmit(transport, params.dest, &frame, sockets, now)?;
        stats.md.sent += 1;
        Ok(())
    }

    /// Opens a caller session and sends the request.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        &mut self,
        params: RequestParams,
        payload: &[u8],
        callback: MdCallback,
        sockets: &mut SocketManager,
        registry: &Registry,
        now: Instant,
        stats: &mut Statistics,
    ) -> Result<MdHandle> {
        if payload.len() > MAX_MD_PAYLOAD {
            return Err(TrdpError::param("payload exceeds message-data maximum"));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(TrdpError::Memory(self.max_sessions));
        }

        let uuid = SessionUuid::generate();
        let reply_timeout = if params.reply_timeout > Duration::from_secs(0) {
            params.reply_timeout
        } else {
            self.default_reply_timeout
        };
        let confirm_timeout = if params.confirm_timeout > Duration::from_secs(0) {
            params.confirm_timeout
        } else {
            self.default_confirm_timeout
        };
        let retries = params.retries.unwrap_or(self.default_retries).min(MAX_RETRIES);

        let frame = encode_md(
            &MdHeader {
                sequence: 0,
                msg_type: MsgType::Mr,
                com_id: params.com_id,
                etb_topo_count: self.etb_topo_count,
                op_trn_topo_count: self.op_trn_topo_count,
                dataset_length: payload.len() as u32,
                reply_status: reply_status::OK,
                session_id: uuid,
                reply_timeout_us: reply_timeout.as_micros() as u32,
                source_uri: self.own_uri.clone(),
                dest_uri: params.dest_uri.clone(),
            },
            payload,
        );

        let transport = self.pick_transport(params.flags, params.dest, None, registry, now)?;
        self.transmit(transport, params.dest, &frame, sockets, now)?;
        stats.md.sent += 1;

        let handle = self.sessions.insert(MdSession {
            uuid,
            role: Role::Caller,
            state: MdState::WaitForReply,
            com_id: params.com_id,
            peer: params.dest,
            source_uri: self.own_uri.clone(),
            dest_uri: params.dest_uri,
            expected_replies: params.expected_replies.max(1),
            replies_received: 0,
            reply_timeout,
            confirm_timeout,
            retries_left: retries,
            retries_configured: retries,
            retry_index: 0,
            timer: Some(now + retry_interval(reply_timeout, retries, 0)),
            transport,
            sequence: 1,
            last_frame: frame,
            callback: Some(callback),
            listener_index: None,
            terminal_at: None,
            pending_terminal: None,
            terminal_delivered: false,
        });
        self.by_uuid.insert(uuid, handle.index as usize);

        logging::debug!(self.log, "request session opened";
                        "com_id" => params.com_id, "session" => %uuid,
                        "expected_replies" => params.expected_replies.max(1),
                        "retries" => retries);
        Ok(MdHandle(uuid))
    }

    /// Final reply ("Mp"): completes the replier session.
    pub fn send_reply(
        &mut self,
        handle: MdHandle,
        reply_com_id: u32,
        payload: &[u8],
        sockets: &mut SocketManager,
        now: Instant,
        stats: &mut Statistics,
    ) -> Result<()> {
        self.replier_send(handle, reply_com_id, payload, MsgType::Mp, sockets, now, stats)
    }

    /// Reply expecting confirmation ("Mq"): the replier session waits for
    /// the "Mc".
    pub fn send_reply_query(
        &mut self,
        handle: MdHandle,
        reply_com_id: u32,
        payload: &[u8],
        sockets: &mut SocketManager,
        now: Instant,
        stats: &mut Statistics,
    ) -> Result<()> {
        self.replier_send(handle, reply_com_id, payload, MsgType::Mq, sockets, now, stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn replier_send(
        &mut self,
        handle: MdHandle,
        reply_com_id: u32,
        payload: &[u8],
        msg_type: MsgType,
        sockets: &mut SocketManager,
        now: Instant,
        stats: &mut Statistics,
    ) -> Result<()> {
        if payload.len() > MAX_MD_PAYLOAD {
            return Err(TrdpError::param("payload exceeds message-data maximum"));
        }
        let index = *self
            .by_uuid
            .get(&handle.0)
            .ok_or(TrdpError::UnknownSession)?;

        let (frame, transport, peer) = {
            let session = self
                .sessions
                .get_index_mut(index)
                .ok_or(TrdpError::UnknownSession)?;
            if session.role != Role::Replier || session.state != MdState::New {
                return Err(TrdpError::param("session is not awaiting a reply"));
            }
            let frame = encode_md(
                &MdHeader {
                    sequence: session.sequence,
                    msg_type,
                    com_id: if reply_com_id != 0 { reply_com_id } else { session.com_id },
                    etb_topo_count: self.etb_topo_count,
                    op_trn_topo_count: self.op_trn_topo_count,
                    dataset_length: payload.len() as u32,
                    reply_status: reply_status::OK,
                    session_id: session.uuid,
                    reply_timeout_us: 0,
                    source_uri: self.own_uri.clone(),
                    dest_uri: session.source_uri.clone(),
                },
                payload,
            );
            session.sequence = session.sequence.wrapping_add(1);
            match msg_type {
                MsgType::Mq => {
                    session.state = MdState::WaitForConfirm;
                    session.timer = Some(now + session.confirm_timeout);
                }
                _ => {
                    session.enter_terminal(MdState::Completed, now);
                    session.pending_terminal = Some((ErrorKind::NoError, MsgType::Mp));
                }
            }
            (frame, session.transport, session.peer)
        };

        self.transmit(transport, peer, &frame, sockets, now)?;
        stats.md.sent += 1;
        Ok(())
    }

    /// Confirms a received "Mq" and completes the caller session.
    pub fn send_confirm(
        &mut self,
        handle: MdHandle,
        sockets: &mut SocketManager,
        now: Instant,
        stats: &mut Statistics,
    ) -> Result<()> {
        let index = *self
            .by_uuid
            .get(&handle.0)
            .ok_or(TrdpError::UnknownSession)?;

        let (frame, transport, peer) = {
            let session = self
                .sessions
                .get_index_mut(index)
                .ok_or(TrdpError::UnknownSession)?;
            if session.role != Role::Caller || session.state != MdState::WaitForConfirm {
                return Err(TrdpError::param("session is not awaiting a confirmation"));
            }
            let frame = encode_md(
                &MdHeader {
                    sequence: session.sequence,
                    msg_type: MsgType::Mc,
                    com_id: session.com_id,
                    etb_topo_count: self.etb_topo_count,
                    op_trn_topo_count: self.op_trn_topo_count,
                    dataset_length: 0,
                    reply_status: reply_status::OK,
                    session_id: session.uuid,
                    reply_timeout_us: 0,
                    source_uri: session.source_uri.clone(),
                    dest_uri: session.dest_uri.clone(),
                },
                &[],
            );
            session.sequence = session.sequence.wrapping_add(1);
            session.enter_terminal(MdState::Completed, now);
            session.pending_terminal = Some((ErrorKind::NoError, MsgType::Mc));
            (frame, session.transport, session.peer)
        };

        self.transmit(transport, peer, &frame, sockets, now)?;
        stats.md.sent += 1;
        Ok(())
    }

    /// Routes one received message-data frame.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_frame(
        &mut self,
        now: Instant,
        md_header: &MdHeader,
        payload: &[u8],
        source: SocketAddr,
        transport: Transport,
        sockets: &mut SocketManager,
        stats: &mut Statistics,
    ) {
        stats.md.received += 1;

        match self.by_uuid.get(&md_header.session_id).copied() {
            Some(index) => {
                self.frame_for_session(index, now, md_header, payload, source, sockets, stats)
            }
            None => match md_header.msg_type {
                MsgType::Mn => self.deliver_notification(md_header, payload, source, stats),
                MsgType::Mr => {
                    self.open_replier(now, md_header, payload, source, transport, stats)
                }
                _ => {
                    stats.md.unknown_sessions += 1;
                    logging::debug!(self.log, "frame for unknown session";
                                    "type" => ?md_header.msg_type, "session" => %md_header.session_id);
                }
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn frame_for_session(
        &mut self,
        index: usize,
        now: Instant,
        md_header: &MdHeader,
        payload: &[u8],
        source: SocketAddr,
        sockets: &mut SocketManager,
        stats: &mut Statistics,
    ) {
        enum Outcome {
            Ignore,
            Deliver { status: ErrorKind, needs_confirm: bool, terminal: bool },
        }

        let outcome = {
            let session = match self.sessions.get_index_mut(index) {
                Some(session) => session,
                None => return,
            };
            match (session.role, session.state, md_header.msg_type) {
                (Role::Caller, MdState::WaitForReply, MsgType::Mp) => {
                    session.replies_received += 1;
                    if session.replies_received >= session.expected_replies {
                        session.enter_terminal(MdState::Completed, now);
                        Outcome::Deliver {
                            status: ErrorKind::NoError,
                            needs_confirm: false,
                            terminal: true,
                        }
                    } else {
                        Outcome::Deliver {
                            status: ErrorKind::NoError,
                            needs_confirm: false,
                            terminal: false,
                        }
                    }
                }
                (Role::Caller, MdState::WaitForReply, MsgType::Mq) => {
                    session.replies_received += 1;
                    session.state = MdState::WaitForConfirm;
                    session.timer = Some(now + session.confirm_timeout);
                    Outcome::Deliver {
                        status: ErrorKind::NoError,
                        needs_confirm: true,
                        terminal: false,
                    }
                }
                (Role::Caller, MdState::WaitForReply, MsgType::Me)
                | (Role::Caller, MdState::WaitForConfirm, MsgType::Me) => {
                    session.enter_terminal(MdState::Failed, now);
                    Outcome::Deliver {
                        status: status_from_wire(md_header.reply_status),
                        needs_confirm: false,
                        terminal: true,
                    }
                }
                (Role::Replier, MdState::WaitForConfirm, MsgType::Mc) => {
                    session.enter_terminal(MdState::Completed, now);
                    Outcome::Deliver {
                        status: ErrorKind::NoError,
                        needs_confirm: false,
                        terminal: true,
                    }
                }
                (Role::Replier, MdState::New, MsgType::Mr) => {
                    // Caller retransmission of a request already in the
                    // application's hands.
                    Outcome::Ignore
                }
                (role, state, msg_type) => {
                    logging::debug!(self.log, "frame does not fit session state";
                                    "role" => ?role, "state" => ?state, "type" => ?msg_type);
                    Outcome::Ignore
                }
            }
        };

        let _ = sockets;
        if let Outcome::Deliver { status, needs_confirm, terminal } = outcome {
            self.fire(
                index,
                md_header.msg_type,
                status,
                payload,
                Some(source),
                false,
                needs_confirm,
                terminal,
            );
        }
    }

    fn deliver_notification(
        &mut self,
        md_header: &MdHeader,
        payload: &[u8],
        source: SocketAddr,
        stats: &mut Statistics,
    ) {
        let listener_index = match self.find_listener(md_header) {
            Some(index) => index,
            None => {
                stats.md.no_listener += 1;
                return;
            }
        };
        self.fire_listener(listener_index, md_header, payload, source, false);
    }

    fn open_replier(
        &mut self,
        now: Instant,
        md_header: &MdHeader,
        payload: &[u8],
        source: SocketAddr,
        transport: Transport,
        stats: &mut Statistics,
    ) {
        let listener_index = match self.find_listener(md_header) {
            Some(index) => index,
            None => {
                stats.md.no_listener += 1;
                logging::debug!(self.log, "request without listener"; "com_id" => md_header.com_id);
                return;
            }
        };
        if self.sessions.len() >= self.max_sessions {
            logging::warn!(self.log, "session table full, request dropped";
                           "com_id" => md_header.com_id);
            return;
        }

        let reply_timeout = if md_header.reply_timeout_us > 0 {
            Duration::from_micros(u64::from(md_header.reply_timeout_us))
        } else {
            self.default_reply_timeout
        };

        let handle = self.sessions.insert(MdSession {
            uuid: md_header.session_id,
            role: Role::Replier,
            state: MdState::New,
            com_id: md_header.com_id,
            peer: source,
            source_uri: md_header.source_uri.clone(),
            dest_uri: md_header.dest_uri.clone(),
            expected_replies: 1,
            replies_received: 0,
            reply_timeout,
            confirm_timeout: self.default_confirm_timeout,
            retries_left: 0,
            retries_configured: 0,
            retry_index: 0,
            // Reaper: a request the application never answers must not leak.
            timer: Some(now + reply_timeout),
            transport,
            sequence: 0,
            last_frame: Vec::new(),
            callback: None,
            listener_index: Some(listener_index),
            terminal_at: None,
            pending_terminal: None,
            terminal_delivered: false,
        });
        let index = handle.index as usize;
        self.by_uuid.insert(md_header.session_id, index);

        logging::debug!(self.log, "replier session opened";
                        "com_id" => md_header.com_id, "session" => %md_header.session_id);

        self.fire(index, MsgType::Mr, ErrorKind::NoError, payload, Some(source), true, false, false);
    }

    fn find_listener(&self, md_header: &MdHeader) -> Option<usize> {
        self.listeners
            .iter()
            .find(|(_, listener)| {
                listener.com_id == md_header.com_id
                    && (listener.uri.is_empty() || listener.uri == md_header.dest_uri)
            })
            .map(|(index, _)| index)
    }

    /// Earliest instant any session or connection needs servicing.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut fold = |candidate: Instant| {
            next = Some(match next {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };

        for (_, session) in self.sessions.iter() {
            if let Some(timer) = session.timer {
                fold(timer);
            }
            if let Some(at) = session.terminal_at {
                if session.pending_terminal.is_some() && !session.terminal_delivered {
                    fold(at);
                } else {
                    fold(at + SESSION_GRACE);
                }
            }
        }
        for &index in &self.live_conns {
            if let Some(conn) = self.connections.get_index(index) {
                fold(conn.last_activity + self.idle_timeout);
            }
        }
        next
    }

    /// Services timers: pending terminal deliveries, retransmissions, reply
    /// and confirm timeouts, grace reaping, idle connections.
    pub fn process(
        &mut self,
        now: Instant,
        sockets: &mut SocketManager,
        registry: &Registry,
        stats: &mut Statistics,
    ) -> usize {
        let mut handled = 0;

        // Terminal notifications queued by API calls.
        for index in 0..self.sessions.capacity() {
            let pending = self
                .sessions
                .get_index(index)
                .filter(|s| !s.terminal_delivered)
                .and_then(|s| s.pending_terminal);
            if let Some((status, msg_type)) = pending {
                let terminal_status = status;
                self.fire(index, msg_type, terminal_status, &[], None, false, false, true);
                handled += 1;
            }
        }

        // Session timers.
        for index in 0..self.sessions.capacity() {
            enum Action {
                None,
                Resend { frame: Vec<u8>, transport: Transport, peer: SocketAddr },
                ReplyTimeout,
                ConfirmTimeout { frame: Vec<u8>, transport: Transport, peer: SocketAddr },
            }

            let action = {
                let session = match self.sessions.get_index_mut(index) {
                    Some(session) => session,
                    None => continue,
                };
                let due = match session.timer {
                    Some(timer) if timer <= now => true,
                    _ => false,
                };
                if !due {
                    Action::None
                } else {
                    match session.state {
                        MdState::WaitForReply if session.retries_left > 0 => {
                            session.retries_left -= 1;
                            session.retry_index += 1;
                            session.timer = Some(
                                now + retry_interval(
                                    session.reply_timeout,
                                    session.retries_configured,
                                    session.retry_index,
                                ),
                            );
                            Action::Resend {
                                frame: session.last_frame.clone(),
                                transport: session.transport,
                                peer: session.peer,
                            }
                        }
                        MdState::WaitForReply | MdState::New => {
                            session.enter_terminal(MdState::Failed, now);
                            Action::ReplyTimeout
                        }
                        MdState::WaitForConfirm => {
                            let frame = encode_md(
                                &MdHeader {
                                    sequence: session.sequence,
                                    msg_type: MsgType::Me,
                                    com_id: session.com_id,
                                    etb_topo_count: self.etb_topo_count,
                                    op_trn_topo_count: self.op_trn_topo_count,
                                    dataset_length: 0,
                                    reply_status: reply_status::CONFIRM_TIMEOUT,
                                    session_id: session.uuid,
                                    reply_timeout_us: 0,
                                    source_uri: session.source_uri.clone(),
                                    dest_uri: session.dest_uri.clone(),
                                },
                                &[],
                            );
                            session.sequence = session.sequence.wrapping_add(1);
                            session.enter_terminal(MdState::Failed, now);
                            Action::ConfirmTimeout {
                                frame,
                                transport: session.transport,
                                peer: session.peer,
                            }
                        }
                        MdState::Completed | MdState::Failed => {
                            session.timer = None;
                            Action::None
                        }
                    }
                }
            };

            match action {
                Action::None => (),
                Action::Resend { frame, transport, peer } => {
                    stats.md.retries += 1;
                    handled += 1;
                    logging::debug!(self.log, "request retransmitted"; "peer" => %peer);
                    if self.transmit(transport, peer, &frame, sockets, now).is_ok() {
                        stats.md.sent += 1;
                    }
                }
                Action::ReplyTimeout => {
                    stats.md.reply_timeouts += 1;
                    handled += 1;
                    self.fire(index, MsgType::Me, ErrorKind::Timeout, &[], None, false, false, true);
                }
                Action::ConfirmTimeout { frame, transport, peer } => {
                    stats.md.confirm_timeouts += 1;
                    handled += 1;
                    if self.transmit(transport, peer, &frame, sockets, now).is_ok() {
                        stats.md.sent += 1;
                    }
                    self.fire(
                        index,
                        MsgType::Me,
                        ErrorKind::ConfirmTimeout,
                        &[],
                        None,
                        false,
                        false,
                        true,
                    );
                }
            }
        }

        // Grace reaping of terminal sessions.
        for index in 0..self.sessions.capacity() {
            let reap = self
                .sessions
                .get_index(index)
                .filter(|s| s.is_terminal())
                .and_then(|s| s.terminal_at)
                .map_or(false, |at| now >= at + SESSION_GRACE);
            if reap {
                if let Some(session) = self.sessions.remove_index(index) {
                    self.by_uuid.remove(&session.uuid);
                    logging::trace!(self.log, "session reaped"; "session" => %session.uuid);
                }
            }
        }

        // Idle connection reaping.
        let idle_timeout = self.idle_timeout;
        let overdue: Vec<usize> = self
            .live_conns
            .iter()
            .copied()
            .filter(|&index| {
                self.connections
                    .get_index(index)
                    .map_or(false, |conn| conn.idle(now) >= idle_timeout)
            })
            .collect();
        for index in overdue {
            logging::debug!(self.log, "idle connection closed");
            self.close_conn(index, registry);
            handled += 1;
        }

        handled
    }

    /// Accepts every pending inbound connection.
    pub fn accept_connections(
        &mut self,
        sockets: &mut SocketManager,
        registry: &Registry,
        now: Instant,
    ) -> usize {
        let mut accepted = 0;
        loop {
            match sockets.accept() {
                Ok((stream, peer)) => {
                    let handle = self.connections.insert(TcpConn::inbound(stream, peer, now));
                    let index = handle.index as usize;
                    let token = Token(TOKEN_CONN_BASE + index);
                    let registered = {
                        let conn = self.connections.get_index_mut(index).unwrap();
                        registry.register(
                            conn.stream_mut(),
                            token,
                            Interest::READABLE | Interest::WRITABLE,
                        )
                    };
                    match registered {
                        Ok(()) => {
                            self.live_conns.insert(index);
                            self.conns_by_peer.insert(peer, index);
                            accepted += 1;
                            logging::debug!(self.log, "connection accepted"; "peer" => %peer);
                        }
                        Err(err) => {
                            logging::warn!(self.log, "accepted connection unregisterable"; "error" => %err);
                            self.connections.remove_index(index);
                        }
                    }
                }
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(_)) => break,
            }
        }
        accepted
    }

    /// Handles readiness on a pooled connection token.
    #[allow(clippy::too_many_arguments)]
    pub fn conn_event(
        &mut self,
        conn_index: usize,
        readable: bool,
        writable: bool,
        now: Instant,
        sockets: &mut SocketManager,
        registry: &Registry,
        stats: &mut Statistics,
    ) -> usize {
        let mut handled = 0;
        let mut dead = false;
        let mut frames: Vec<Vec<u8>> = Vec::new();

        {
            let conn = match self.connections.get_index_mut(conn_index) {
                Some(conn) => conn,
                None => return 0,
            };
            if writable {
                match conn.on_writable(now) {
                    Ok(_) => (),
                    Err(NetError::Wait) => (),
                    Err(NetError::Fatal(_)) => dead = true,
                }
            }
            if readable && !dead {
                match conn.on_readable(now) {
                    Ok(0) => dead = true, // peer closed
                    Ok(_) => {
                        while let Some(frame) = conn.next_frame() {
                            frames.push(frame);
                        }
                    }
                    Err(NetError::Wait) => (),
                    Err(NetError::Fatal(_)) => dead = true,
                }
            }
        }

        let peer = self.connections.get_index(conn_index).map(|c| c.peer);
        for frame in frames {
            handled += 1;
            match header::decode(&frame) {
                Ok(header::Frame::Md { header: md_header, payload, .. }) => {
                    let source = peer.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
                    self.handle_frame(
                        now,
                        &md_header,
                        payload,
                        source,
                        Transport::Tcp(conn_index),
                        sockets,
                        stats,
                    );
                }
                Ok(header::Frame::Pd { .. }) => {
                    stats.md.wire_errors += 1;
                    dead = true;
                }
                Err(TrdpError::CrcMismatch) => {
                    stats.md.crc_errors += 1;
                    dead = true;
                }
                Err(_) => {
                    stats.md.wire_errors += 1;
                    dead = true;
                }
            }
        }

        if dead {
            self.close_conn(conn_index, registry);
            handled += 1;
        }
        handled
    }

    /// Fails every live session with `Aborted`; used by session close.
    pub fn abort_all(&mut self, now: Instant, registry: &Registry) {
        for index in 0..self.sessions.capacity() {
            let abort = {
                match self.sessions.get_index_mut(index) {
                    Some(session) if !session.is_terminal() => {
                        session.enter_terminal(MdState::Failed, now);
                        true
                    }
                    _ => false,
                }
            };
            if abort {
                self.fire(index, MsgType::Me, ErrorKind::Aborted, &[], None, false, false, true);
            }
        }

        let live: Vec<usize> = self.live_conns.iter().copied().collect();
        for index in live {
            self.close_conn(index, registry);
        }
    }

    fn close_conn(&mut self, index: usize, registry: &Registry) {
        if let Some(mut conn) = self.connections.remove_index(index) {
            let _ = registry.deregister(conn.stream_mut());
            self.conns_by_peer.remove(&conn.peer);
            logging::debug!(self.log, "connection closed"; "peer" => %conn.peer);
        }
        self.live_conns.swap_remove(&index);

        // Sessions riding this connection fall back to reconnect-on-send.
        for (_, session) in self.sessions.iter_mut() {
            if session.transport == Transport::Tcp(index) {
                session.transport = Transport::Udp;
            }
        }
    }

    fn pick_transport(
        &mut self,
        flags: TelegramFlags,
        peer: SocketAddr,
        hint: Option<usize>,
        registry: &Registry,
        now: Instant,
    ) -> Result<Transport> {
        if !flags.tcp {
            return Ok(Transport::Udp);
        }
        if let Some(index) = hint {
            if self.connections.get_index(index).is_some() {
                return Ok(Transport::Tcp(index));
            }
        }
        if let Some(&index) = self.conns_by_peer.get(&peer) {
            if self.connections.get_index(index).is_some() {
                return Ok(Transport::Tcp(index));
            }
        }

        let conn = TcpConn::outbound(peer, now)?;
        let handle = self.connections.insert(conn);
        let index = handle.index as usize;
        let token = Token(TOKEN_CONN_BASE + index);
        let registered = {
            let conn = self.connections.get_index_mut(index).unwrap();
            registry.register(conn.stream_mut(), token, Interest::READABLE | Interest::WRITABLE)
        };
        if let Err(err) = registered {
            self.connections.remove_index(index);
            return Err(err.into());
        }
        self.live_conns.insert(index);
        self.conns_by_peer.insert(peer, index);
        logging::debug!(self.log, "connection opened"; "peer" => %peer);
        Ok(Transport::Tcp(index))
    }

    fn transmit(
        &mut self,
        transport: Transport,
        peer: SocketAddr,
        frame: &[u8],
        sockets: &mut SocketManager,
        now: Instant,
    ) -> Result<()> {
        match transport {
            Transport::Udp => match sockets.md_send(frame, peer) {
                Ok(()) => Ok(()),
                // A full socket buffer loses this emission; retry timers
                // cover it.
                Err(NetError::Wait) => Ok(()),
                Err(NetError::Fatal(err)) => Err(err),
            },
            Transport::Tcp(index) => {
                let conn = self
                    .connections
                    .get_index_mut(index)
                    .ok_or(TrdpError::Socket(std::io::ErrorKind::NotConnected))?;
                match conn.queue_frame(frame, now) {
                    Ok(()) => Ok(()),
                    Err(NetError::Wait) => Ok(()),
                    Err(NetError::Fatal(err)) => Err(err),
                }
            }
        }
    }

    /// Invokes the session's (or its listener's) callback.
    #[allow(clippy::too_many_arguments)]
    fn fire(
        &mut self,
        index: usize,
        msg_type: MsgType,
        status: ErrorKind,
        payload: &[u8],
        source: Option<SocketAddr>,
        needs_reply: bool,
        needs_confirm: bool,
        terminal: bool,
    ) {
        enum Owner {
            Session,
            Listener(usize),
        }

        let listener_index = match self.sessions.get_index_mut(index) {
            Some(session) => {
                if terminal {
                    if session.terminal_delivered {
                        return;
                    }
                    session.terminal_delivered = true;
                    session.pending_terminal = None;
                }
                session.listener_index
            }
            None => return,
        };

        let (owner, mut callback) = {
            let from_session = self
                .sessions
                .get_index_mut(index)
                .and_then(|s| s.callback.take());
            match from_session {
                Some(cb) => (Owner::Session, cb),
                None => match listener_index
                    .and_then(|li| self.listeners.get_index_mut(li))
                    .and_then(|l| l.callback.take())
                {
                    Some(cb) => (
                        Owner::Listener(listener_index.unwrap_or_default()),
                        cb,
                    ),
                    None => return,
                },
            }
        };

        {
            let session = match self.sessions.get_index(index) {
                Some(session) => session,
                None => {
                    // Reinstall and bail; the session vanished under us.
                    match owner {
                        Owner::Session => (),
                        Owner::Listener(li) => {
                            if let Some(listener) = self.listeners.get_index_mut(li) {
                                listener.callback = Some(callback);
                            }
                        }
                    }
                    return;
                }
            };
            let event = MdEvent {
                session: MdHandle(session.uuid),
                com_id: session.com_id,
                msg_type,
                status,
                payload,
                source_uri: &session.source_uri,
                dest_uri: &session.dest_uri,
                source,
                needs_reply,
                needs_confirm,
                terminal,
            };
            callback(&event);
        }

        match owner {
            Owner::Session => {
                if let Some(session) = self.sessions.get_index_mut(index) {
                    session.callback = Some(callback);
                }
            }
            Owner::Listener(li) => {
                if let Some(listener) = self.listeners.get_index_mut(li) {
                    listener.callback = Some(callback);
                }
            }
        }
    }

    /// Invokes a listener callback for a session-less notification.
    fn fire_listener(
        &mut self,
        listener_index: usize,
        md_header: &MdHeader,
        payload: &[u8],
        source: SocketAddr,
        needs_reply: bool,
    ) {
        let mut callback = match self
            .listeners
            .get_index_mut(listener_index)
            .and_then(|l| l.callback.take())
        {
            Some(cb) => cb,
            None => return,
        };

        {
            let event = MdEvent {
                session: MdHandle(md_header.session_id),
                com_id: md_header.com_id,
                msg_type: md_header.msg_type,
                status: ErrorKind::NoError,
                payload,
                source_uri: &md_header.source_uri,
                dest_uri: &md_header.dest_uri,
                source: Some(source),
                needs_reply,
                needs_confirm: false,
                terminal: false,
            };
            callback(&event);
        }

        if let Some(listener) = self.listeners.get_index_mut(listener_index) {
            listener.callback = Some(callback);
        }
    }
}

fn status_from_wire(code: i32) -> ErrorKind {
    match code {
        reply_status::OK => ErrorKind::NoError,
        reply_status::REPLY_TIMEOUT => ErrorKind::Timeout,
        reply_status::CONFIRM_TIMEOUT => ErrorKind::ConfirmTimeout,
        reply_status::NO_REPLIER => ErrorKind::UnknownSession,
        _ => ErrorKind::Aborted,
    }
}

/// Retry back-off: the n-th wait is `base << n` with
/// `base = reply_timeout / (2^(retries+1) - 1)`, each wait capped at half
/// the reply timeout. The waits sum to roughly the reply timeout.
fn retry_interval(reply_timeout: Duration, retries: u32, attempt: u32) -> Duration {
    if retries == 0 {
        return reply_timeout;
    }
    let retries = retries.min(MAX_RETRIES);
    let attempt = attempt.min(retries);
    let denominator = (1u64 << (retries + 1)) - 1;
    let base_us = (reply_timeout.as_micros() as u64 / denominator).max(1);
    let interval = Duration::from_micros(base_us << attempt);
    interval.min(reply_timeout / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use mio::Poll;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn loopback_sockets(poll: &Poll) -> SocketManager {
        let mut config = SessionConfig::default();
        config.interface.host_ip = Ipv4Addr::LOCALHOST;
        config.pd.port = 0;
        config.md.udp_port = 0;
        config.md.tcp_port = 0;
        SocketManager::open(&config, poll.registry(), &logging::discard()).unwrap()
    }

    fn engine(reply_timeout: Duration, confirm_timeout: Duration, retries: u32) -> MdEngine {
        MdEngine::new(
            "dev.local".to_string(),
            0,
            0,
            reply_timeout,
            confirm_timeout,
            Duration::from_secs(60),
            retries,
            64,
            &logging::discard(),
        )
    }

    fn md_addr(sockets: &SocketManager) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, sockets.md_udp_port()))
    }

    /// Pumps every pending UDP message-data frame from `sockets` into
    /// `engine`.
    fn pump(
        engine: &mut MdEngine,
        sockets: &mut SocketManager,
        now: Instant,
        stats: &mut Statistics,
    ) -> usize {
        let mut buf = [0u8; 70000];
        let mut handled = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match sockets.md_recv(&mut buf) {
                Ok((count, source)) => match header::decode(&buf[..count]).unwrap() {
                    header::Frame::Md { header: md_header, payload, .. } => {
                        engine.handle_frame(
                            now,
                            &md_header,
                            payload,
                            source,
                            Transport::Udp,
                            sockets,
                            stats,
                        );
                        handled += 1;
                    }
                    _ => panic!("unexpected PD frame on MD socket"),
                },
                Err(NetError::Wait) => {
                    if handled > 0 || Instant::now() >= deadline {
                        return handled;
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(err) => panic!("receive failed: {:?}", err),
            }
        }
    }

    fn request_params(dest: SocketAddr) -> RequestParams {
        RequestParams {
            com_id: 5000,
            dest,
            dest_uri: "replier.local".to_string(),
            expected_replies: 1,
            reply_timeout: Duration::from_millis(200),
            confirm_timeout: Duration::from_millis(100),
            retries: Some(0),
            flags: TelegramFlags::default(),
        }
    }

    #[test]
    fn test_retry_interval_shape() {
        let rt = Duration::from_millis(700);
        // retries = 2: base = 700/7 = 100ms; waits 100, 200, 400->capped 350.
        assert_eq!(retry_interval(rt, 2, 0), Duration::from_millis(100));
        assert_eq!(retry_interval(rt, 2, 1), Duration::from_millis(200));
        assert_eq!(retry_interval(rt, 2, 2), Duration::from_millis(350));
        // retries = 0: single full wait.
        assert_eq!(retry_interval(rt, 0, 0), rt);
    }

    #[test]
    fn test_notify_delivery() {
        let poll_a = Poll::new().unwrap();
        let poll_b = Poll::new().unwrap();
        let mut sockets_a = loopback_sockets(&poll_a);
        let mut sockets_b = loopback_sockets(&poll_b);
        let mut stats_a = Statistics::default();
        let mut stats_b = Statistics::default();

        let mut caller = engine(Duration::from_secs(1), Duration::from_secs(1), 0);
        let mut replier = engine(Duration::from_secs(1), Duration::from_secs(1), 0);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = hits.clone();
        replier
            .add_listener(
                ListenerParams { com_id: 4000, uri: String::new() },
                Box::new(move |event| {
                    assert_eq!(event.msg_type, MsgType::Mn);
                    assert_eq!(event.payload, b"hello");
                    assert!(!event.needs_reply);
                    hits_in_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let now = Instant::now();
        caller
            .send_notify(
                NotifyParams {
                    com_id: 4000,
                    dest: md_addr(&sockets_b),
                    dest_uri: String::new(),
                    flags: TelegramFlags::default(),
                },
                b"hello",
                &mut sockets_a,
                poll_a.registry(),
                now,
                &mut stats_a,
            )
            .unwrap();

        pump(&mut replier, &mut sockets_b, now, &mut stats_b);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Notifications never open sessions.
        assert_eq!(replier.session_count(), 0);
    }

    #[test]
    fn test_request_reply_confirm_full_cycle() {
        let poll_a = Poll::new().unwrap();
        let poll_b = Poll::new().unwrap();
        let mut sockets_a = loopback_sockets(&poll_a);
        let mut sockets_b = loopback_sockets(&poll_b);
        let mut stats_a = Statistics::default();
        let mut stats_b = Statistics::default();

        let mut caller = engine(Duration::from_secs(1), Duration::from_secs(1), 0);
        let mut replier = engine(Duration::from_secs(1), Duration::from_secs(1), 0);

        // Replier-side listener answers with a confirmable reply.
        let replier_sessions: Arc<Mutex<Vec<MdHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let sessions_in_cb = replier_sessions.clone();
        let replier_terminal = Arc::new(AtomicUsize::new(0));
        let replier_terminal_cb = replier_terminal.clone();
        replier
            .add_listener(
                ListenerParams { com_id: 5000, uri: "replier.local".to_string() },
                Box::new(move |event| {
                    if event.needs_reply {
                        assert_eq!(event.payload, b"question");
                        sessions_in_cb.lock().unwrap().push(event.session);
                    }
                    if event.terminal {
                        assert_eq!(event.status, ErrorKind::NoError);
                        replier_terminal_cb.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        // Caller-side callback records replies and terminal.
        let caller_events = Arc::new(Mutex::new(Vec::new()));
        let caller_events_cb = caller_events.clone();
        let now = Instant::now();
        let caller_handle = caller
            .send_request(
                request_params(md_addr(&sockets_b)),
                b"question",
                Box::new(move |event| {
                    caller_events_cb.lock().unwrap().push((
                        event.msg_type,
                        event.status,
                        event.needs_confirm,
                        event.terminal,
                        event.copy_payload(),
                    ));
                }),
                &mut sockets_a,
                poll_a.registry(),
                now,
                &mut stats_a,
            )
            .unwrap();
        assert_eq!(caller.state_of(caller_handle), Some(MdState::WaitForReply));

        // Request reaches the replier, which answers with "Mq".
        pump(&mut replier, &mut sockets_b, now, &mut stats_b);
        let replier_handle = replier_sessions.lock().unwrap()[0];
        assert_eq!(replier.state_of(replier_handle), Some(MdState::New));
        replier
            .send_reply_query(replier_handle, 5001, b"answer", &mut sockets_b, now, &mut stats_b)
            .unwrap();
        assert_eq!(replier.state_of(replier_handle), Some(MdState::WaitForConfirm));

        // Reply reaches the caller, which owes a confirmation.
        pump(&mut caller, &mut sockets_a, now, &mut stats_a);
        assert_eq!(caller.state_of(caller_handle), Some(MdState::WaitForConfirm));
        {
            let events = caller_events.lock().unwrap();
            assert_eq!(events.len(), 1);
            let (msg_type, status, needs_confirm, terminal, payload) = &events[0];
            assert_eq!(*msg_type, MsgType::Mq);
            assert_eq!(*status, ErrorKind::NoError);
            assert!(*needs_confirm);
            assert!(!*terminal);
            assert_eq!(payload, b"answer");
        }

        caller
            .send_confirm(caller_handle, &mut sockets_a, now, &mut stats_a)
            .unwrap();
        assert_eq!(caller.state_of(caller_handle), Some(MdState::Completed));

        // Confirmation reaches the replier and completes its session.
        pump(&mut replier, &mut sockets_b, now, &mut stats_b);
        assert_eq!(replier.state_of(replier_handle), Some(MdState::Completed));
        assert_eq!(replier_terminal.load(Ordering::SeqCst), 1);

        // The caller's terminal notification fires on the next tick, once.
        caller.process(now, &mut sockets_a, poll_a.registry(), &mut stats_a);
        caller.process(now, &mut sockets_a, poll_a.registry(), &mut stats_a);
        let events = caller_events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].3, "second event must be terminal");
    }

    #[test]
    fn test_reply_without_confirm_completes_both() {
        let poll_a = Poll::new().unwrap();
        let poll_b = Poll::new().unwrap();
        let mut sockets_a = loopback_sockets(&poll_a);
        let mut sockets_b = loopback_sockets(&poll_b);
        let mut stats_a = Statistics::default();
        let mut stats_b = Statistics::default();

        let mut caller = engine(Duration::from_secs(1), Duration::from_secs(1), 0);
        let mut replier = engine(Duration::from_secs(1), Duration::from_secs(1), 0);

        let replier_sessions: Arc<Mutex<Vec<MdHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let sessions_in_cb = replier_sessions.clone();
        replier
            .add_listener(
                ListenerParams { com_id: 5000, uri: String::new() },
                Box::new(move |event| {
                    if event.needs_reply {
                        sessions_in_cb.lock().unwrap().push(event.session);
                    }
                }),
            )
            .unwrap();

        let terminal_hits = Arc::new(AtomicUsize::new(0));
        let terminal_cb = terminal_hits.clone();
        let now = Instant::now();
        let caller_handle = caller
            .send_request(
                request_params(md_addr(&sockets_b)),
                b"q",
                Box::new(move |event| {
                    if event.terminal {
                        assert_eq!(event.status, ErrorKind::NoError);
                        terminal_cb.fetch_add(1, Ordering::SeqCst);
                    }
                }),
                &mut sockets_a,
                poll_a.registry(),
                now,
                &mut stats_a,
            )
            .unwrap();

        pump(&mut replier, &mut sockets_b, now, &mut stats_b);
        let replier_handle = replier_sessions.lock().unwrap()[0];
        replier
            .send_reply(replier_handle, 0, b"a", &mut sockets_b, now, &mut stats_b)
            .unwrap();
        assert_eq!(replier.state_of(replier_handle), Some(MdState::Completed));

        // The single expected reply is terminal for the caller.
        pump(&mut caller, &mut sockets_a, now, &mut stats_a);
        assert_eq!(caller.state_of(caller_handle), Some(MdState::Completed));
        assert_eq!(terminal_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reply_timeout_with_retries() {
        let poll = Poll::new().unwrap();
        let mut sockets = loopback_sockets(&poll);
        let mut stats = Statistics::default();
        let mut caller = engine(Duration::from_secs(5), Duration::from_secs(1), 0);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_cb = statuses.clone();
        let now = Instant::now();
        // Nobody listens on this port pair; the request dies by timeout.
        let mut params = request_params(md_addr(&sockets));
        params.reply_timeout = Duration::from_millis(700);
        params.retries = Some(2);
        let handle = caller
            .send_request(
                params,
                b"q",
                Box::new(move |event| {
                    statuses_cb.lock().unwrap().push((event.status, event.terminal));
                }),
                &mut sockets,
                poll.registry(),
                now,
                &mut stats,
            )
            .unwrap();

        // base = 100ms; timers at +100, +300, +650 (capped), then failure.
        caller.process(now + Duration::from_millis(101), &mut sockets, poll.registry(), &mut stats);
        assert_eq!(stats.md.retries, 1);
        assert_eq!(caller.state_of(handle), Some(MdState::WaitForReply));

        caller.process(now + Duration::from_millis(310), &mut sockets, poll.registry(), &mut stats);
        assert_eq!(stats.md.retries, 2);

        caller.process(now + Duration::from_millis(670), &mut sockets, poll.registry(), &mut stats);
        assert_eq!(stats.md.retries, 2);
        assert_eq!(caller.state_of(handle), Some(MdState::Failed));
        assert_eq!(stats.md.reply_timeouts, 1);

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.as_slice(), &[(ErrorKind::Timeout, true)]);
    }

    #[test]
    fn test_confirm_timeout_sends_me_and_fails_both() {
        let poll_a = Poll::new().unwrap();
        let poll_b = Poll::new().unwrap();
        let mut sockets_a = loopback_sockets(&poll_a);
        let mut sockets_b = loopback_sockets(&poll_b);
        let mut stats_a = Statistics::default();
        let mut stats_b = Statistics::default();

        let mut caller = engine(Duration::from_secs(1), Duration::from_secs(1), 0);
        let mut replier = engine(Duration::from_secs(1), Duration::from_millis(50), 0);

        let replier_sessions: Arc<Mutex<Vec<MdHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let sessions_in_cb = replier_sessions.clone();
        let replier_statuses = Arc::new(Mutex::new(Vec::new()));
        let replier_statuses_cb = replier_statuses.clone();
        replier
            .add_listener(
                ListenerParams { com_id: 5000, uri: String::new() },
                Box::new(move |event| {
                    if event.needs_reply {
                        sessions_in_cb.lock().unwrap().push(event.session);
                    }
                    if event.terminal {
                        replier_statuses_cb.lock().unwrap().push(event.status);
                    }
                }),
            )
            .unwrap();

        let caller_statuses = Arc::new(Mutex::new(Vec::new()));
        let caller_statuses_cb = caller_statuses.clone();
        let now = Instant::now();
        let caller_handle = caller
            .send_request(
                request_params(md_addr(&sockets_b)),
                b"q",
                Box::new(move |event| {
                    if event.terminal {
                        caller_statuses_cb.lock().unwrap().push(event.status);
                    }
                }),
                &mut sockets_a,
                poll_a.registry(),
                now,
                &mut stats_a,
            )
            .unwrap();

        pump(&mut replier, &mut sockets_b, now, &mut stats_b);
        let replier_handle = replier_sessions.lock().unwrap()[0];
        replier
            .send_reply_query(replier_handle, 0, b"a", &mut sockets_b, now, &mut stats_b)
            .unwrap();
        pump(&mut caller, &mut sockets_a, now, &mut stats_a);

        // The caller never confirms; the replier's confirm timer fires and
        // emits "Me" with the confirm-timeout status.
        replier.process(now + Duration::from_millis(60), &mut sockets_b, poll_b.registry(), &mut stats_b);
        assert_eq!(replier.state_of(replier_handle), Some(MdState::Failed));
        assert_eq!(stats_b.md.confirm_timeouts, 1);
        assert_eq!(replier_statuses.lock().unwrap().as_slice(), &[ErrorKind::ConfirmTimeout]);

        // The "Me" fails the caller session.
        pump(&mut caller, &mut sockets_a, now, &mut stats_a);
        assert_eq!(caller.state_of(caller_handle), Some(MdState::Failed));
        assert_eq!(caller_statuses.lock().unwrap().as_slice(), &[ErrorKind::ConfirmTimeout]);
    }

    #[test]
    fn test_multiple_expected_replies() {
        let poll_a = Poll::new().unwrap();
        let poll_b = Poll::new().unwrap();
        let mut sockets_a = loopback_sockets(&poll_a);
        let mut sockets_b = loopback_sockets(&poll_b);
        let mut stats_a = Statistics::default();
        let mut stats_b = Statistics::default();

        let mut caller = engine(Duration::from_secs(1), Duration::from_secs(1), 0);
        let mut replier = engine(Duration::from_secs(1), Duration::from_secs(1), 0);

        let replier_sessions: Arc<Mutex<Vec<MdHandle>>> = Arc::new(Mutex::new(Vec::new()));
        let sessions_in_cb = replier_sessions.clone();
        replier
            .add_listener(
                ListenerParams { com_id: 5000, uri: String::new() },
                Box::new(move |event| {
                    if event.needs_reply {
                        sessions_in_cb.lock().unwrap().push(event.session);
                    }
                }),
            )
            .unwrap();

        let deliveries = Arc::new(AtomicUsize::new(0));
        let terminals = Arc::new(AtomicUsize::new(0));
        let deliveries_cb = deliveries.clone();
        let terminals_cb = terminals.clone();
        let now = Instant::now();
        let mut params = request_params(md_addr(&sockets_b));
        params.expected_replies = 2;
        let caller_handle = caller
            .send_request(
                params,
                b"q",
                Box::new(move |event| {
                    if event.status == ErrorKind::NoError {
                        deliveries_cb.fetch_add(1, Ordering::SeqCst);
                    }
                    if event.terminal {
                        terminals_cb.fetch_add(1, Ordering::SeqCst);
                    }
                }),
                &mut sockets_a,
                poll_a.registry(),
                now,
                &mut stats_a,
            )
            .unwrap();

        pump(&mut replier, &mut sockets_b, now, &mut stats_b);
        let replier_handle = replier_sessions.lock().unwrap()[0];
        replier.send_reply(replier_handle, 0, b"one", &mut sockets_b, now, &mut stats_b).unwrap();

        pump(&mut caller, &mut sockets_a, now, &mut stats_a);
        assert_eq!(caller.state_of(caller_handle), Some(MdState::WaitForReply));
        assert_eq!(deliveries.load(Ordering::SeqCst), 1);
        assert_eq!(terminals.load(Ordering::SeqCst), 0);

        // Second reply arrives from a fresh frame carrying the same UUID
        // (as a second replier device would).
        let second = encode_md(
            &MdHeader {
                sequence: 9,
                msg_type: MsgType::Mp,
                com_id: 5000,
                etb_topo_count: 0,
                op_trn_topo_count: 0,
                dataset_length: 3,
                reply_status: reply_status::OK,
                session_id: caller_handle.uuid(),
                reply_timeout_us: 0,
                source_uri: "other.replier".to_string(),
                dest_uri: "dev.local".to_string(),
            },
            b"two",
        );
        match header::decode(&second).unwrap() {
            header::Frame::Md { header: md_header, payload, .. } => caller.handle_frame(
                now,
                &md_header,
                payload,
                md_addr(&sockets_b),
                Transport::Udp,
                &mut sockets_a,
                &mut stats_a,
            ),
            _ => unreachable!(),
        }

        assert_eq!(caller.state_of(caller_handle), Some(MdState::Completed));
        assert_eq!(deliveries.load(Ordering::SeqCst), 2);
        assert_eq!(terminals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_session_counted() {
        let poll = Poll::new().unwrap();
        let mut sockets = loopback_sockets(&poll);
        let mut stats = Statistics::default();
        let mut engine = engine(Duration::from_secs(1), Duration::from_secs(1), 0);

        let frame = encode_md(
            &MdHeader {
                sequence: 0,
                msg_type: MsgType::Mp,
                com_id: 5000,
                etb_topo_count: 0,
                op_trn_topo_count: 0,
                dataset_length: 0,
                reply_status: reply_status::OK,
                session_id: SessionUuid::generate(),
                reply_timeout_us: 0,
                source_uri: String::new(),
                dest_uri: String::new(),
            },
            &[],
        );
        match header::decode(&frame).unwrap() {
            header::Frame::Md { header: md_header, payload, .. } => engine.handle_frame(
                Instant::now(),
                &md_header,
                payload,
                md_addr(&sockets),
                Transport::Udp,
                &mut sockets,
                &mut stats,
            ),
            _ => unreachable!(),
        }
        assert_eq!(stats.md.unknown_sessions, 1);
    }

    #[test]
    fn test_abort_all_delivers_aborted_terminals() {
        let poll = Poll::new().unwrap();
        let mut sockets = loopback_sockets(&poll);
        let mut stats = Statistics::default();
        let mut caller = engine(Duration::from_secs(5), Duration::from_secs(1), 0);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_cb = statuses.clone();
        let now = Instant::now();
        let handle = caller
            .send_request(
                request_params(md_addr(&sockets)),
                b"q",
                Box::new(move |event| {
                    if event.terminal {
                        statuses_cb.lock().unwrap().push(event.status);
                    }
                }),
                &mut sockets,
                poll.registry(),
                now,
                &mut stats,
            )
            .unwrap();

        caller.abort_all(now, poll.registry());
        assert_eq!(caller.state_of(handle), Some(MdState::Failed));
        assert_eq!(statuses.lock().unwrap().as_slice(), &[ErrorKind::Aborted]);

        // Terminal is delivered exactly once, even if timers run later.
        caller.process(now + Duration::from_secs(10), &mut sockets, poll.registry(), &mut stats);
        assert_eq!(statuses.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_replier_reaper_fails_unanswered_request() {
        let poll = Poll::new().unwrap();
        let mut sockets = loopback_sockets(&poll);
        let mut stats = Statistics::default();
        let mut replier = engine(Duration::from_secs(1), Duration::from_secs(1), 0);

        let terminal_statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_cb = terminal_statuses.clone();
        replier
            .add_listener(
                ListenerParams { com_id: 5000, uri: String::new() },
                Box::new(move |event| {
                    if event.terminal {
                        statuses_cb.lock().unwrap().push(event.status);
                    }
                }),
            )
            .unwrap();

        let now = Instant::now();
        let frame = encode_md(
            &MdHeader {
                sequence: 0,
                msg_type: MsgType::Mr,
                com_id: 5000,
                etb_topo_count: 0,
                op_trn_topo_count: 0,
                dataset_length: 1,
                reply_status: reply_status::OK,
                session_id: SessionUuid::generate(),
                reply_timeout_us: 50_000,
                source_uri: "caller".to_string(),
                dest_uri: String::new(),
            },
            &[1],
        );
        match header::decode(&frame).unwrap() {
            header::Frame::Md { header: md_header, payload, .. } => replier.handle_frame(
                now,
                &md_header,
                payload,
                md_addr(&sockets),
                Transport::Udp,
                &mut sockets,
                &mut stats,
            ),
            _ => unreachable!(),
        }
        assert_eq!(replier.session_count(), 1);

        // The application never replies; the reaper fails the session after
        // the frame's reply timeout.
        replier.process(now + Duration::from_millis(60), &mut sockets, poll.registry(), &mut stats);
        assert_eq!(terminal_statuses.lock().unwrap().as_slice(), &[ErrorKind::Timeout]);

        // After the grace period the session is gone entirely.
        replier.process(
            now + Duration::from_millis(60) + SESSION_GRACE + Duration::from_millis(10),
            &mut sockets,
            poll.registry(),
            &mut stats,
        );
        assert_eq!(replier.session_count(), 0);
    }

    #[test]
    fn test_session_limit() {
        let poll = Poll::new().unwrap();
        let mut sockets = loopback_sockets(&poll);
        let mut stats = Statistics::default();
        let mut caller = MdEngine::new(
            "dev".to_string(),
            0,
            0,
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(60),
            0,
            1,
            &logging::discard(),
        );

        let now = Instant::now();
        let dest = md_addr(&sockets);
        caller
            .send_request(
                request_params(dest),
                b"",
                Box::new(|_| {}),
                &mut sockets,
                poll.registry(),
                now,
                &mut stats,
            )
            .unwrap();
        let err = caller
            .send_request(
                request_params(dest),
                b"",
                Box::new(|_| {}),
                &mut sockets,
                poll.registry(),
                now,
                &mut stats,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Memory);
    }
}
