//! Process-data engine.
//!
//! Publishers are cyclic senders driven by monotonic deadlines; subscribers
//! match incoming frames on (ComId, destination, source filter), validate
//! sequence counters per source and supervise reception timeouts. Pull
//! requests ("Pr") are one-shot sends answered by the matching publisher
//! with a "Pp" frame.
//!
//! The engine owns no sockets; the session passes the socket manager into
//! the tick entry points and dispatches decoded frames here.

use crate::config::{TelegramFlags, TimeoutBehavior};
use crate::dict::Dictionary;
use crate::error::{ErrorKind, NetError, Result, TrdpError};
use crate::marshal;
use crate::net::sockets::SocketManager;
use crate::slots::{Handle, Slots};
use crate::stats::Statistics;
use crate::wire::crc::sc32;
use crate::wire::header::{self, MsgType, PdHeader, MAX_PD_PAYLOAD};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Host buffer reserved per marshalled subscription.
const HOST_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubHandle(pub(crate) Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubHandle(pub(crate) Handle);

#[derive(Debug, Clone)]
pub struct PublishParams {
    pub com_id: u32,
    /// Destination address; a zero port means the session's process-data
    /// port.
    pub dest: SocketAddr,
    /// Publishing interval; zero makes the publisher pull-only.
    pub cycle: Duration,
    pub redundancy_group: u32,
    pub flags: TelegramFlags,
}

#[derive(Debug, Clone)]
pub struct SubscribeParams {
    pub com_id: u32,
    /// Only accept frames from this source; `None` accepts any.
    pub source_filter: Option<Ipv4Addr>,
    /// Multicast group to join, or `None` for the own unicast address.
    pub dest: Option<Ipv4Addr>,
    /// Reception supervision; zero disables it.
    pub timeout: Duration,
    pub to_behavior: TimeoutBehavior,
    pub flags: TelegramFlags,
    /// SDTv2 safe-data identifier; present makes the engine verify the
    /// trailing SC-32 of every accepted payload.
    pub sdt_sid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PullParams {
    pub com_id: u32,
    pub dest: SocketAddr,
    /// ComId the response shall carry; zero keeps the requested one.
    pub reply_com_id: u32,
    /// Address the response shall go to; unspecified sends it back to the
    /// requester.
    pub reply_ip: Ipv4Addr,
}

/// Receive or timeout notification. The payload borrows the subscription's
/// cache and is valid only for the duration of the callback; use
/// [`PdEvent::copy_payload`] to keep it.
pub struct PdEvent<'a> {
    pub sub: SubHandle,
    pub com_id: u32,
    pub status: ErrorKind,
    pub payload: &'a [u8],
    pub source: Ipv4Addr,
    pub sequence: u32,
    pub msg_type: MsgType,
}

impl<'a> PdEvent<'a> {
    /// Copies the payload out of the receive storage.
    pub fn copy_payload(&self) -> Vec<u8> {
        self.payload.to_vec()
    }
}

pub type PdCallback = Box<dyn FnMut(&PdEvent<'_>) + Send>;

struct Publisher {
    com_id: u32,
    dest: SocketAddr,
    cycle: Duration,
    deadline: Instant,
    redundancy_group: u32,
    leader: bool,
    flags: TelegramFlags,
    sequence: u32,
    data: Vec<u8>,
    /// Pending pull to answer: (ComId for the response, where to send it).
    pending_reply: Option<(u32, SocketAddr)>,
}

struct Subscriber {
    com_id: u32,
    source_filter: Option<Ipv4Addr>,
    dest: Option<Ipv4Addr>,
    timeout: Duration,
    to_behavior: TimeoutBehavior,
    flags: TelegramFlags,
    sdt_sid: Option<u32>,
    data: Vec<u8>,
    data_len: usize,
    last_rx: Option<Instant>,
    timed_out: bool,
    last_sequence: HashMap<Ipv4Addr, u32>,
    callback: Option<PdCallback>,
}

struct PullRequest {
    com_id: u32,
    dest: SocketAddr,
    reply_com_id: u32,
    reply_ip: Ipv4Addr,
    send_at: Instant,
}

pub(crate) struct PdEngine {
    publishers: Slots<Publisher>,
    subscribers: Slots<Subscriber>,
    requests: Vec<PullRequest>,
    etb_topo_count: u32,
    op_trn_topo_count: u32,
    request_sequence: u32,
    log: Logger,
}

impl PdEngine {
    pub fn new(etb_topo_count: u32, op_trn_topo_count: u32, log: &Logger) -> PdEngine {
        PdEngine {
            publishers: Slots::new(),
            subscribers: Slots::new(),
            requests: Vec::new(),
            etb_topo_count,
            op_trn_topo_count,
            request_sequence: 0,
            log: log.new(logging::o!()),
        }
    }

    pub fn publish(&mut self, params: PublishParams, now: Instant) -> Result<PubHandle> {
        if params.com_id == 0 {
            return Err(TrdpError::param("ComId must not be zero"));
        }
        let handle = self.publishers.insert(Publisher {
            com_id: params.com_id,
            dest: params.dest,
            cycle: params.cycle,
            deadline: now,
            redundancy_group: params.redundancy_group,
            leader: true,
            flags: params.flags,
            sequence: 0,
            data: Vec::new(),
            pending_reply: None,
        });
        logging::debug!(self.log, "publisher created";
                        "com_id" => params.com_id, "dest" => %params.dest,
                        "cycle_us" => params.cycle.as_micros() as u64);
        Ok(PubHandle(handle))
    }

    pub fn unpublish(&mut self, handle: PubHandle) -> Result<()> {
        self.publishers
            .remove(handle.0)
            .map(|p| {
                logging::debug!(self.log, "publisher removed"; "com_id" => p.com_id);
            })
            .ok_or_else(|| TrdpError::param("stale publisher handle"))
    }

    /// Replaces the cached payload. With the marshall flag the buffer is the
    /// host representation and is converted here; otherwise it is taken as
    /// wire-ready bytes.
    pub fn put(
        &mut self,
        handle: PubHandle,
        buffer: &[u8],
        dict: &Dictionary,
        now: Instant,
    ) -> Result<()> {
        let publisher = self
            .publishers
            .get_mut(handle.0)
            .ok_or_else(|| TrdpError::param("stale publisher handle"))?;

        if publisher.flags.marshall {
            let dataset_id = dict
                .dataset_id_for(publisher.com_id)
                .ok_or_else(|| TrdpError::structure(format!("no dataset for ComId {}", publisher.com_id)))?;
            let mut wire = vec![0u8; MAX_PD_PAYLOAD];
            let len = marshal::marshal(dict, dataset_id, buffer, &mut wire, &mut None)?;
            wire.truncate(len);
            publisher.data = wire;
        } else {
            if buffer.len() > MAX_PD_PAYLOAD {
                return Err(TrdpError::param("payload exceeds process-data maximum"));
            }
            publisher.data = buffer.to_vec();
        }

        // Pull-only publishers stay quiet; cyclic ones send the new value on
        // the next tick.
        if publisher.cycle > Duration::from_secs(0) {
            publisher.deadline = now;
        }
        Ok(())
    }

    pub fn subscribe(&mut self, params: SubscribeParams, callback: Option<PdCallback>) -> Result<SubHandle> {
        if params.com_id == 0 {
            return Err(TrdpError::param("ComId must not be zero"));
        }
        if params.flags.callback && callback.is_none() {
            return Err(TrdpError::param("callback flag set but no callback supplied"));
        }
        let handle = self.subscribers.insert(Subscriber {
            com_id: params.com_id,
            source_filter: params.source_filter.filter(|ip| !ip.is_unspecified()),
            dest: params.dest,
            timeout: params.timeout,
            to_behavior: params.to_behavior,
            flags: params.flags,
            sdt_sid: params.sdt_sid,
            data: Vec::new(),
            data_len: 0,
            last_rx: None,
            timed_out: false,
            last_sequence: HashMap::new(),
            callback,
        });
        logging::debug!(self.log, "subscriber created"; "com_id" => params.com_id);
        Ok(SubHandle(handle))
    }

    /// Removes the subscription and returns the multicast group it held, if
    /// any, so the caller can drop the membership reference.
    pub fn unsubscribe(&mut self, handle: SubHandle) -> Result<Option<Ipv4Addr>> {
        let subscriber = self
            .subscribers
            .remove(handle.0)
            .ok_or_else(|| TrdpError::param("stale subscriber handle"))?;
        logging::debug!(self.log, "subscriber removed"; "com_id" => subscriber.com_id);
        Ok(subscriber.dest.filter(|ip| ip.is_multicast()))
    }

    /// Copies the last received payload into `out` and reports the
    /// subscription state.
    pub fn get(&self, handle: SubHandle, out: &mut [u8]) -> Result<(usize, ErrorKind)> {
        let subscriber = self
            .subscribers
            .get(handle.0)
            .ok_or_else(|| TrdpError::param("stale subscriber handle"))?;
        if out.len() < subscriber.data_len {
            return Err(TrdpError::BufferOverflow);
        }
        out[..subscriber.data_len].copy_from_slice(&subscriber.data[..subscriber.data_len]);
        let status = if subscriber.timed_out || subscriber.last_rx.is_none() {
            ErrorKind::Timeout
        } else {
            ErrorKind::NoError
        };
        Ok((subscriber.data_len, status))
    }

    /// Schedules a one-shot pull request for the next tick.
    pub fn request(&mut self, params: PullParams, now: Instant) -> Result<()> {
        if params.com_id == 0 {
            return Err(TrdpError::param("ComId must not be zero"));
        }
        self.requests.push(PullRequest {
            com_id: params.com_id,
            dest: params.dest,
            reply_com_id: params.reply_com_id,
            reply_ip: params.reply_ip,
            send_at: now,
        });
        Ok(())
    }

    /// Marks the publishers of a redundancy group as leader or follower;
    /// followers keep scheduling but do not emit frames.
    pub fn set_redundant(&mut self, group: u32, leader: bool) {
        for (_, publisher) in self.publishers.iter_mut() {
            if publisher.redundancy_group == group && group != 0 {
                publisher.leader = leader;
            }
        }
    }

    /// Earliest instant anything here needs servicing.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut fold = |candidate: Instant| {
            next = Some(match next {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };

        for (_, publisher) in self.publishers.iter() {
            if publisher.cycle > Duration::from_secs(0) || publisher.pending_reply.is_some() {
                fold(publisher.deadline);
            }
        }
        for request in &self.requests {
            fold(request.send_at);
        }
        for (_, subscriber) in self.subscribers.iter() {
            if subscriber.timeout > Duration::from_secs(0) && !subscriber.timed_out {
                if let Some(last_rx) = subscriber.last_rx {
                    fold(last_rx + subscriber.timeout);
                }
            }
        }
        next
    }

    /// Emits every due cyclic frame, pull answer and pull request.
    pub fn process_sends(
        &mut self,
        now: Instant,
        sockets: &mut SocketManager,
        stats: &mut Statistics,
    ) -> usize {
        let mut handled = 0;

        for (_, publisher) in self.publishers.iter_mut() {
            let cyclic_due = publisher.cycle > Duration::from_secs(0) && publisher.deadline <= now;
            let pull_due = publisher.pending_reply.is_some() && publisher.deadline <= now;
            if !cyclic_due && !pull_due {
                continue;
            }

            let (msg_type, com_id, dest) = match publisher.pending_reply.take() {
                Some((reply_com_id, reply_dest)) => (MsgType::Pp, reply_com_id, reply_dest),
                None => (MsgType::Pd, publisher.com_id, publisher.dest),
            };

            if publisher.leader {
                let frame = header::encode_pd(
                    &PdHeader {
                        sequence: publisher.sequence,
                        msg_type,
                        com_id,
                        etb_topo_count: self.etb_topo_count,
                        op_trn_topo_count: self.op_trn_topo_count,
                        dataset_length: publisher.data.len() as u32,
                        reply_com_id: 0,
                        reply_ip: Ipv4Addr::UNSPECIFIED,
                    },
                    &publisher.data,
                    publisher.flags.payload_fcs,
                );
                match sockets.pd_send(&frame, dest) {
                    Ok(()) => {
                        publisher.sequence = publisher.sequence.wrapping_add(1);
                        stats.pd.sent += 1;
                        if msg_type == MsgType::Pp {
                            stats.pd.pulls_answered += 1;
                        }
                        handled += 1;
                    }
                    Err(NetError::Wait) => (),
                    Err(NetError::Fatal(err)) => {
                        stats.socket_failures += 1;
                        logging::warn!(self.log, "process-data send failed";
                                       "com_id" => com_id, "error" => %err);
                    }
                }
            }

            // Advance off the previous deadline so slow ticks do not drift,
            // but coalesce a backlog of missed cycles into this send.
            if publisher.cycle > Duration::from_secs(0) && cyclic_due {
                while publisher.deadline <= now {
                    publisher.deadline += publisher.cycle;
                }
            }
        }

        let log = &self.log;
        let etb = self.etb_topo_count;
        let op = self.op_trn_topo_count;
        let sequence = &mut self.request_sequence;
        self.requests.retain(|request| {
            if request.send_at > now {
                return true;
            }
            let frame = header::encode_pd(
                &PdHeader {
                    sequence: *sequence,
                    msg_type: MsgType::Pr,
                    com_id: request.com_id,
                    etb_topo_count: etb,
                    op_trn_topo_count: op,
                    dataset_length: 0,
                    reply_com_id: request.reply_com_id,
                    reply_ip: request.reply_ip,
                },
                &[],
                false,
            );
            match sockets.pd_send(&frame, request.dest) {
                Ok(()) => {
                    *sequence = sequence.wrapping_add(1);
                    stats.pd.sent += 1;
                    handled += 1;
                    false
                }
                Err(NetError::Wait) => true,
                Err(NetError::Fatal(err)) => {
                    stats.socket_failures += 1;
                    logging::warn!(log, "pull request send failed";
                                   "com_id" => request.com_id, "error" => %err);
                    false
                }
            }
        });

        handled
    }

    /// Fires the timeout transition on every overdue subscription.
    pub fn process_timeouts(&mut self, now: Instant, stats: &mut Statistics) -> usize {
        let mut handled = 0;
        for index in 0..self.subscribers.capacity() {
            let fire = {
                let subscriber = match self.subscribers.get_index_mut(index) {
                    Some(sub) => sub,
                    None => continue,
                };
                if subscriber.timed_out || subscriber.timeout == Duration::from_secs(0) {
                    continue;
                }
                let last_rx = match subscriber.last_rx {
                    Some(t) => t,
                    None => continue,
                };
                if now.duration_since(last_rx) <= subscriber.timeout {
                    continue;
                }

                subscriber.timed_out = true;
                if subscriber.to_behavior == TimeoutBehavior::SetToZero {
                    subscriber.data.iter_mut().for_each(|b| *b = 0);
                }
                stats.pd.timeouts += 1;
                handled += 1;
                logging::debug!(self.log, "subscription timed out"; "com_id" => subscriber.com_id);
                subscriber.flags.callback
            };

            if fire {
                self.fire_callback(index, ErrorKind::Timeout, Ipv4Addr::UNSPECIFIED, 0, MsgType::Pd);
            }
        }
        handled
    }

    /// Dispatches a received "Pd"/"Pp" frame to every matching subscription.
    pub fn deliver(
        &mut self,
        now: Instant,
        pd_header: &PdHeader,
        payload: &[u8],
        source: SocketAddr,
        own_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
        dict: &Dictionary,
        stats: &mut Statistics,
    ) -> usize {
        let source_ip = match source {
            SocketAddr::V4(addr) => *addr.ip(),
            _ => return 0,
        };

        let mut matched = 0;
        for index in 0..self.subscribers.capacity() {
            let fire = {
                let subscriber = match self.subscribers.get_index_mut(index) {
                    Some(sub) => sub,
                    None => continue,
                };
                if subscriber.com_id != pd_header.com_id {
                    continue;
                }
                match subscriber.dest {
                    Some(group) => {
                        if group.is_multicast() {
                            if dest_ip.is_multicast() && dest_ip != group {
                                continue;
                            }
                        } else if group != dest_ip {
                            continue;
                        }
                    }
                    None => {
                        // Unicast subscription: only frames addressed to the
                        // own interface qualify.
                        if dest_ip.is_multicast() {
                            continue;
                        }
                        if !own_ip.is_unspecified() && !dest_ip.is_unspecified() && dest_ip != own_ip {
                            continue;
                        }
                    }
                }
                if let Some(filter) = subscriber.source_filter {
                    if filter != source_ip {
                        continue;
                    }
                }

                match check_sequence(subscriber.last_sequence.get(&source_ip), pd_header.sequence) {
                    SequenceCheck::Accept => (),
                    SequenceCheck::Drop => {
                        stats.pd.sequence_drops += 1;
                        continue;
                    }
                }
                subscriber.last_sequence.insert(source_ip, pd_header.sequence);

                if let Some(sid) = subscriber.sdt_sid {
                    if !sdt_payload_ok(payload, sid) {
                        stats.pd.crc_errors += 1;
                        logging::debug!(self.log, "safe-data check failed"; "com_id" => subscriber.com_id);
                        continue;
                    }
                }

                if subscriber.flags.marshall {
                    let dataset_id = match dict.dataset_id_for(subscriber.com_id) {
                        Some(id) => id,
                        None => {
                            stats.pd.wire_errors += 1;
                            continue;
                        }
                    };
                    subscriber.data.resize(HOST_BUF_SIZE, 0);
                    match marshal::unmarshal(dict, dataset_id, payload, &mut subscriber.data, &mut None) {
                        Ok((host_len, wire_used)) if wire_used == payload.len() => {
                            subscriber.data_len = host_len;
                        }
                        _ => {
                            stats.pd.wire_errors += 1;
                            continue;
                        }
                    }
                } else {
                    subscriber.data.clear();
                    subscriber.data.extend_from_slice(payload);
                    subscriber.data_len = payload.len();
                }

                subscriber.last_rx = Some(now);
                subscriber.timed_out = false;
                stats.pd.received += 1;
                matched += 1;
                subscriber.flags.callback
            };

            if fire {
                self.fire_callback(
                    index,
                    ErrorKind::NoError,
                    source_ip,
                    pd_header.sequence,
                    pd_header.msg_type,
                );
            }
        }

        if matched == 0 {
            stats.pd.no_subscriber += 1;
        }
        matched
    }

    /// Answers a received pull request from the matching publisher.
    pub fn handle_pull(
        &mut self,
        pd_header: &PdHeader,
        source: SocketAddr,
        pd_port: u16,
        now: Instant,
    ) -> bool {
        // An unspecified reply address sends the answer straight back to the
        // requesting socket; an explicit one gets the process-data port.
        let reply_dest = if pd_header.reply_ip.is_unspecified() {
            source
        } else {
            SocketAddr::V4(SocketAddrV4::new(pd_header.reply_ip, pd_port))
        };

        for (_, publisher) in self.publishers.iter_mut() {
            if publisher.com_id == pd_header.com_id {
                let reply_com_id = if pd_header.reply_com_id != 0 {
                    pd_header.reply_com_id
                } else {
                    publisher.com_id
                };
                publisher.pending_reply = Some((reply_com_id, reply_dest));
                publisher.deadline = publisher.deadline.min(now);
                logging::trace!(self.log, "pull request armed";
                                "com_id" => pd_header.com_id, "reply_dest" => %reply_dest);
                return true;
            }
        }
        false
    }

    /// Number of live publishers, for statistics and close-down logging.
    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn fire_callback(
        &mut self,
        index: usize,
        status: ErrorKind,
        source: Ipv4Addr,
        sequence: u32,
        msg_type: MsgType,
    ) {
        let mut callback = match self.subscribers.get_index_mut(index).and_then(|s| s.callback.take()) {
            Some(cb) => cb,
            None => return,
        };
        let handle = match self.subscribers.handle_of(index) {
            Some(handle) => SubHandle(handle),
            None => return,
        };

        {
            let subscriber = match self.subscribers.get_index(index) {
                Some(sub) => sub,
                None => return,
            };
            let event = PdEvent {
                sub: handle,
                com_id: subscriber.com_id,
                status,
                payload: &subscriber.data[..subscriber.data_len],
                source,
                sequence,
                msg_type,
            };
            callback(&event);
        }

        if let Some(subscriber) = self.subscribers.get_index_mut(index) {
            subscriber.callback = Some(callback);
        }
    }
}

enum SequenceCheck {
    Accept,
    Drop,
}

/// Duplicate and staleness filter: an equal counter is a duplicate, a
/// counter behind the last one by less than half the range is stale, and
/// everything else (including wrap-around) is fresh.
fn check_sequence(last: Option<&u32>, incoming: u32) -> SequenceCheck {
    match last {
        None => SequenceCheck::Accept,
        Some(&last) => {
            if incoming == last {
                SequenceCheck::Drop
            } else if last.wrapping_sub(incoming) < 0x8000_0000 {
                SequenceCheck::Drop
            } else {
                SequenceCheck::Accept
            }
        }
    }
}

/// Verifies the trailing SC-32 of an SDTv2 payload.
fn sdt_payload_ok(payload: &[u8], sid: u32) -> bool {
    if payload.len() < 4 {
        return false;
    }
    let body = &payload[..payload.len() - 4];
    let stored = BigEndian::read_u32(&payload[payload.len() - 4..]);
    sc32(body, sid) == stored
}
