//! The session object.
//!
//! A `Session` owns everything one protocol endpoint needs: configuration,
//! the validated dictionary, the socket manager, both engines and the
//! statistics. The application drives it cooperatively: `process` services
//! due timers and drains ready descriptors without ever blocking, and
//! `wait` parks the caller until the next deadline or readiness.
//!
//! All state mutation happens behind `&mut self`; that exclusive borrow is
//! the session lock, and it also makes callback re-entry into the same
//! session impossible by construction.

use crate::config::{SessionConfig, TelegramFlags, TimeoutBehavior};
use crate::dict::Dictionary;
use crate::error::{ErrorKind, NetError, Result, TrdpError};
use crate::md::{
    ListenerHandle, ListenerParams, MdCallback, MdEngine, MdHandle, NotifyParams, RequestParams,
    Transport,
};
use crate::net::sockets::{SocketManager, TOKEN_CONN_BASE, TOKEN_MD_LISTENER};
use crate::pd::{
    PdCallback, PdEngine, PubHandle, PublishParams, PullParams, SubHandle, SubscribeParams,
};
use crate::pool::BlockPool;
use crate::stats::Statistics;
use crate::wire::header::{self, Frame};
use keel::logging::{self, Logger};
use mio::{Events, Poll, Token};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const RX_BUF_SIZE: usize = 70 * 1024;

pub struct Session {
    config: SessionConfig,
    dict: Dictionary,
    sockets: SocketManager,
    pd: PdEngine,
    md: MdEngine,
    stats: Statistics,
    pool: BlockPool,
    poll: Poll,
    events: Events,
    /// Readiness observed by `wait` and not yet serviced by `process`.
    pending_events: Vec<(usize, bool, bool)>,
    rx_buf: Vec<u8>,
    open: bool,
    log: Logger,
}

impl Session {
    /// Opens a session: validates the dictionary, binds the sockets, builds
    /// the engines and auto-creates the configured telegrams. The logger is
    /// built from the debug configuration.
    pub fn open(config: SessionConfig) -> Result<Session> {
        let log = logging::root(&config.debug.log_config());
        Session::open_with_logger(config, &log)
    }

    /// Same as [`Session::open`] with a caller-supplied parent logger.
    pub fn open_with_logger(config: SessionConfig, parent: &Logger) -> Result<Session> {
        let log = parent.new(logging::o!("component" => "trdp"));

        let dict = Dictionary::new(config.datasets.clone(), &config.com_mappings)?;
        let poll = Poll::new()?;
        let sockets = SocketManager::open(&config, poll.registry(), &log)?;
        let mut pool = BlockPool::new(&config.memory);
        // Fail configuration problems at open, not at first use.
        if pool.is_enabled() {
            let probe = pool.take(RX_BUF_SIZE.min(
                config.memory.blocks.iter().map(|b| b.size).max().unwrap_or(0),
            ))?;
            pool.give(probe);
        }

        let pd = PdEngine::new(config.etb_topo_count, config.op_trn_topo_count, &log);
        let md = MdEngine::new(
            config.process.host_name.clone(),
            config.etb_topo_count,
            config.op_trn_topo_count,
            config.reply_timeout(),
            config.confirm_timeout(),
            config.connect_timeout(),
            config.md.retries,
            config.md.max_sessions,
            &log,
        );

        let mut session = Session {
            config,
            dict,
            sockets,
            pd,
            md,
            stats: Statistics::default(),
            pool,
            poll,
            events: Events::with_capacity(256),
            pending_events: Vec::new(),
            rx_buf: vec![0u8; RX_BUF_SIZE],
            open: true,
            log,
        };
        session.create_configured_telegrams()?;

        logging::info!(session.log, "session open";
                       "pd_port" => session.sockets.pd_port(),
                       "md_udp_port" => session.sockets.md_udp_port(),
                       "md_tcp_port" => session.sockets.md_tcp_port(),
                       "datasets" => session.dict.len());
        Ok(session)
    }

    fn create_configured_telegrams(&mut self) -> Result<()> {
        use crate::config::Direction;

        let telegrams = self.config.telegrams.clone();
        let now = keel::time::now();
        for telegram in telegrams.iter().filter(|t| t.create) {
            let pd_par = match &telegram.pd {
                Some(par) => par.clone(),
                None => continue,
            };

            if matches!(telegram.direction, Direction::Source | Direction::SourceSink) {
                let dest_ip = telegram.destinations.first().and_then(|d| d.ip);
                match dest_ip {
                    Some(ip) => {
                        let port = self.default_pd_port();
                        self.publish_inner(
                            PublishParams {
                                com_id: telegram.com_id,
                                dest: SocketAddr::new(ip.into(), port),
                                cycle: Duration::from_micros(u64::from(pd_par.cycle_us)),
                                redundancy_group: pd_par.redundant,
                                flags: TelegramFlags { callback: false, ..pd_par.flags },
                            },
                            now,
                        )?;
                    }
                    None => {
                        logging::warn!(self.log, "telegram without destination address not published";
                                       "com_id" => telegram.com_id);
                    }
                }
            }

            if matches!(telegram.direction, Direction::Sink | Direction::SourceSink) {
                let source_filter = telegram.sources.first().and_then(|s| s.ip);
                let dest = telegram.destinations.first().and_then(|d| d.ip).filter(|ip| ip.is_multicast());
                self.subscribe_inner(
                    SubscribeParams {
                        com_id: telegram.com_id,
                        source_filter,
                        dest,
                        timeout: Duration::from_micros(u64::from(pd_par.timeout_us)),
                        to_behavior: pd_par.to_behavior,
                        flags: TelegramFlags { callback: false, ..pd_par.flags },
                        sdt_sid: None,
                    },
                    None,
                )?;
            }
        }
        Ok(())
    }

    /// Terminates in-flight message-data sessions with `Aborted`, closes all
    /// sockets and renders the session unusable. Idempotent.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        logging::info!(self.log, "session closing";
                       "publishers" => self.pd.publisher_count(),
                       "subscribers" => self.pd.subscriber_count(),
                       "md_sessions" => self.md.session_count());
        let now = keel::time::now();
        self.md.abort_all(now, self.poll.registry());
        self.sockets.close(self.poll.registry());
        self.open = false;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The earliest instant any timer wants servicing.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.pd.next_deadline(), self.md.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Time the application may block before calling `process` again.
    /// Falls back to the configured process cycle when nothing is scheduled.
    pub fn get_interval(&self, now: Instant) -> Duration {
        let cycle = Duration::from_micros(u64::from(self.config.process.cycle_us));
        match self.next_deadline() {
            Some(deadline) => keel::time::until(now, deadline).min(cycle.max(Duration::from_millis(1))),
            None => cycle,
        }
    }

    /// Blocks until readiness or the next deadline, at most `max`. Observed
    /// readiness is replayed by the next `process` call.
    pub fn wait(&mut self, max: Duration) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        let now = keel::time::now();
        let timeout = self.get_interval(now).min(max);
        self.poll.poll(&mut self.events, Some(timeout))?;
        for event in self.events.iter() {
            self.pending_events.push((
                event.token().0,
                event.is_readable(),
                event.is_writable(),
            ));
        }
        Ok(())
    }

    /// One cooperative tick: reopens condemned sockets, drains every ready
    /// descriptor, fires due sends, timeouts and retries, and returns the
    /// number of events handled. Never blocks.
    pub fn process(&mut self, now: Instant) -> Result<usize> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        let mut handled = 0;

        self.sockets.service(self.poll.registry());

        // Pick up readiness: whatever `wait` already saw, plus a zero
        // timeout poll.
        self.poll.poll(&mut self.events, Some(Duration::from_millis(0)))?;
        let mut tokens: Vec<(usize, bool, bool)> = std::mem::take(&mut self.pending_events);
        for event in self.events.iter() {
            tokens.push((event.token().0, event.is_readable(), event.is_writable()));
        }

        for (token, readable, writable) in tokens {
            match Token(token) {
                TOKEN_MD_LISTENER => {
                    handled +=
                        self.md
                            .accept_connections(&mut self.sockets, self.poll.registry(), now);
                }
                Token(raw) if raw >= TOKEN_CONN_BASE => {
                    handled += self.md.conn_event(
                        raw - TOKEN_CONN_BASE,
                        readable,
                        writable,
                        now,
                        &mut self.sockets,
                        self.poll.registry(),
                        &mut self.stats,
                    );
                }
                // The datagram sockets are drained unconditionally below.
                _ => (),
            }
        }

        // Opportunistic accept: edge readiness for the listener may have
        // been consumed by an earlier tick that could not take the
        // connection yet.
        handled += self
            .md
            .accept_connections(&mut self.sockets, self.poll.registry(), now);

        handled += self.drain_pd_socket(now);
        handled += self.drain_md_socket(now);

        handled += self.pd.process_sends(now, &mut self.sockets, &mut self.stats);
        handled += self.pd.process_timeouts(now, &mut self.stats);
        handled += self
            .md
            .process(now, &mut self.sockets, self.poll.registry(), &mut self.stats);

        Ok(handled)
    }

    fn drain_pd_socket(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        loop {
            let (count, source) = match self.sockets.pd_recv(&mut self.rx_buf) {
                Ok(result) => result,
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(_)) => {
                    self.stats.socket_failures += 1;
                    break;
                }
            };
            handled += 1;

            match header::decode(&self.rx_buf[..count]) {
                Ok(Frame::Pd { header: pd_header, payload, padding_clean }) => {
                    if !padding_clean {
                        logging::debug!(self.log, "nonzero padding in process-data frame";
                                        "com_id" => pd_header.com_id);
                    }
                    if !self.topo_ok(pd_header.etb_topo_count, pd_header.op_trn_topo_count) {
                        self.stats.pd.topo_errors += 1;
                        continue;
                    }
                    let own_ip = self.config.interface.host_ip;
                    match pd_header.msg_type {
                        header::MsgType::Pr => {
                            let port = self.sockets.pd_port();
                            self.pd.handle_pull(&pd_header, source, port, now);
                        }
                        _ => {
                            self.pd.deliver(
                                now,
                                &pd_header,
                                payload,
                                source,
                                own_ip,
                                own_ip,
                                &self.dict,
                                &mut self.stats,
                            );
                        }
                    }
                }
                Ok(Frame::Md { .. }) => {
                    self.stats.pd.wire_errors += 1;
                }
                Err(TrdpError::CrcMismatch) => {
                    self.stats.pd.crc_errors += 1;
                    logging::debug!(self.log, "process-data frame failed checksum"; "source" => %source);
                }
                Err(_) => {
                    self.stats.pd.wire_errors += 1;
                }
            }
        }
        handled
    }

    fn drain_md_socket(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        loop {
            let (count, source) = match self.sockets.md_recv(&mut self.rx_buf) {
                Ok(result) => result,
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(_)) => {
                    self.stats.socket_failures += 1;
                    break;
                }
            };
            handled += 1;

            match header::decode(&self.rx_buf[..count]) {
                Ok(Frame::Md { header: md_header, payload, padding_clean }) => {
                    if !padding_clean {
                        logging::debug!(self.log, "nonzero padding in message-data frame";
                                        "com_id" => md_header.com_id);
                    }
                    if !self.topo_ok(md_header.etb_topo_count, md_header.op_trn_topo_count) {
                        self.stats.md.topo_errors += 1;
                        continue;
                    }
                    self.md.handle_frame(
                        now,
                        &md_header,
                        payload,
                        source,
                        Transport::Udp,
                        &mut self.sockets,
                        &mut self.stats,
                    );
                }
                Ok(Frame::Pd { .. }) => {
                    self.stats.md.wire_errors += 1;
                }
                Err(TrdpError::CrcMismatch) => {
                    self.stats.md.crc_errors += 1;
                }
                Err(_) => {
                    self.stats.md.wire_errors += 1;
                }
            }
        }
        handled
    }

    /// A frame with a non-zero topocount must match the configured one.
    fn topo_ok(&self, etb: u32, op_trn: u32) -> bool {
        let etb_ok = etb == 0 || self.config.etb_topo_count == 0 || etb == self.config.etb_topo_count;
        let op_ok = op_trn == 0
            || self.config.op_trn_topo_count == 0
            || op_trn == self.config.op_trn_topo_count;
        etb_ok && op_ok
    }

    // ----- process data ---------------------------------------------------

    pub fn publish(&mut self, params: PublishParams) -> Result<PubHandle> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.publish_inner(params, keel::time::now())
    }

    fn publish_inner(&mut self, mut params: PublishParams, now: Instant) -> Result<PubHandle> {
        if params.dest.port() == 0 {
            params.dest.set_port(self.default_pd_port());
        }
        self.pd.publish(params, now)
    }

    /// Configured process-data port, or the actually bound one when the
    /// configuration asked for an ephemeral port.
    fn default_pd_port(&self) -> u16 {
        if self.config.pd.port != 0 {
            self.config.pd.port
        } else {
            self.sockets.pd_port()
        }
    }

    pub fn unpublish(&mut self, handle: PubHandle) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.pd.unpublish(handle)
    }

    /// Updates a publisher's payload; marshalled publishers take the host
    /// representation.
    pub fn put(&mut self, handle: PubHandle, buffer: &[u8]) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.pd.put(handle, buffer, &self.dict, keel::time::now())
    }

    pub fn subscribe(
        &mut self,
        params: SubscribeParams,
        callback: Option<PdCallback>,
    ) -> Result<SubHandle> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.subscribe_inner(params, callback)
    }

    fn subscribe_inner(
        &mut self,
        params: SubscribeParams,
        callback: Option<PdCallback>,
    ) -> Result<SubHandle> {
        let group = params.dest.filter(|ip| ip.is_multicast());
        if let Some(group) = group {
            self.sockets.join_group(group)?;
        }
        match self.pd.subscribe(params, callback) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if let Some(group) = group {
                    self.sockets.leave_group(group);
                }
                Err(err)
            }
        }
    }

    pub fn unsubscribe(&mut self, handle: SubHandle) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        if let Some(group) = self.pd.unsubscribe(handle)? {
            self.sockets.leave_group(group);
        }
        Ok(())
    }

    /// Copies out the last received payload; the status tells whether it is
    /// fresh or timed out.
    pub fn get(&self, handle: SubHandle, out: &mut [u8]) -> Result<(usize, ErrorKind)> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.pd.get(handle, out)
    }

    /// Requests pulled process data ("Pr"); the answer arrives on the
    /// subscription bound to the reply ComId.
    pub fn request(&mut self, mut params: PullParams) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        if params.dest.port() == 0 {
            params.dest.set_port(self.default_pd_port());
        }
        self.pd.request(params, keel::time::now())
    }

    /// Leader/follower switch for a redundancy group.
    pub fn set_redundant(&mut self, group: u32, leader: bool) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.pd.set_redundant(group, leader);
        Ok(())
    }

    // ----- message data ---------------------------------------------------

    pub fn send_notify(&mut self, params: NotifyParams, payload: &[u8]) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.md.send_notify(
            params,
            payload,
            &mut self.sockets,
            self.poll.registry(),
            keel::time::now(),
            &mut self.stats,
        )
    }

    pub fn send_request(
        &mut self,
        params: RequestParams,
        payload: &[u8],
        callback: MdCallback,
    ) -> Result<MdHandle> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.md.send_request(
            params,
            payload,
            callback,
            &mut self.sockets,
            self.poll.registry(),
            keel::time::now(),
            &mut self.stats,
        )
    }

    pub fn send_reply(
        &mut self,
        handle: MdHandle,
        reply_com_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.md.send_reply(
            handle,
            reply_com_id,
            payload,
            &mut self.sockets,
            keel::time::now(),
            &mut self.stats,
        )
    }

    pub fn send_reply_query(
        &mut self,
        handle: MdHandle,
        reply_com_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.md.send_reply_query(
            handle,
            reply_com_id,
            payload,
            &mut self.sockets,
            keel::time::now(),
            &mut self.stats,
        )
    }

    pub fn send_confirm(&mut self, handle: MdHandle) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.md.send_confirm(handle, &mut self.sockets, keel::time::now(), &mut self.stats)
    }

    pub fn add_listener(
        &mut self,
        params: ListenerParams,
        callback: MdCallback,
    ) -> Result<ListenerHandle> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.md.add_listener(params, callback)
    }

    pub fn remove_listener(&mut self, handle: ListenerHandle) -> Result<()> {
        if !self.open {
            return Err(TrdpError::NoInit);
        }
        self.md.remove_listener(handle)
    }

    // ----- introspection --------------------------------------------------

    pub fn statistics(&self) -> Statistics {
        self.stats.clone()
    }

    /// Actual process-data port, after ephemeral binding.
    pub fn pd_port(&self) -> u16 {
        self.sockets.pd_port()
    }

    /// Actual message-data UDP port.
    pub fn md_udp_port(&self) -> u16 {
        self.sockets.md_udp_port()
    }

    /// Actual message-data TCP port.
    pub fn md_tcp_port(&self) -> u16 {
        self.sockets.md_tcp_port()
    }

    /// Buffer checkout from the configured pool (heap fallback when no pool
    /// is configured). Useful for callback payload copies on embedded
    /// targets.
    pub fn take_buffer(&mut self, size: usize) -> Result<Vec<u8>> {
        self.pool.take(size)
    }

    pub fn give_buffer(&mut self, buffer: Vec<u8>) {
        self.pool.give(buffer)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Callbacks have already been dropped or will never fire again; a
        // quiet teardown is all that is needed here.
        if self.open {
            self.sockets.close(self.poll.registry());
            self.open = false;
        }
    }
}
