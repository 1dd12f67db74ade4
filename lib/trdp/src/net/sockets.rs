//! Socket manager.
//!
//! Owns every descriptor of a session: one UDP socket for process data, one
//! for message data, and the TCP listener message data connections are
//! accepted on. Multicast memberships are reference counted so a group is
//! left only when the last subscription goes. A socket that fails is
//! condemned and reopened on the next `service` tick; the session itself
//! never dies of a transport error.

use crate::config::SessionConfig;
use crate::error::{NetError, NetResult, Result, TrdpError};
use hashbrown::HashMap;
use keel::logging::{self, Logger};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const TOKEN_PD: Token = Token(0);
pub const TOKEN_MD_UDP: Token = Token(1);
pub const TOKEN_MD_LISTENER: Token = Token(2);
/// First token handed out to accepted/initiated TCP connections.
pub const TOKEN_CONN_BASE: usize = 16;

pub struct SocketManager {
    host_ip: Ipv4Addr,
    pd_port: u16,
    md_udp_port: u16,
    md_tcp_port: u16,
    pd_tos: u32,
    pd_ttl: u32,
    md_tos: u32,
    md_ttl: u32,

    pd: Option<UdpSocket>,
    md_udp: Option<UdpSocket>,
    md_listener: Option<TcpListener>,

    pd_failed: bool,
    md_failed: bool,
    listener_failed: bool,

    mcast_refs: HashMap<Ipv4Addr, u32>,

    log: Logger,
}

impl SocketManager {
    pub fn open(config: &SessionConfig, registry: &Registry, log: &Logger) -> Result<SocketManager> {
        let mut mgr = SocketManager {
            host_ip: config.interface.host_ip,
            pd_port: config.pd.port,
            md_udp_port: config.md.udp_port,
            md_tcp_port: config.md.tcp_port,
            pd_tos: u32::from(config.pd.qos) << 2,
            pd_ttl: u32::from(config.pd.ttl),
            md_tos: u32::from(config.md.qos) << 2,
            md_ttl: u32::from(config.md.ttl),
            pd: None,
            md_udp: None,
            md_listener: None,
            pd_failed: false,
            md_failed: false,
            listener_failed: false,
            mcast_refs: HashMap::new(),
            log: log.new(logging::o!()),
        };

        mgr.open_pd(registry)?;
        mgr.open_md_udp(registry)?;
        mgr.open_md_listener(registry)?;
        Ok(mgr)
    }

    /// Port the process-data socket is actually bound to (relevant when the
    /// configuration asked for an ephemeral port).
    pub fn pd_port(&self) -> u16 {
        self.pd_port
    }

    pub fn md_udp_port(&self) -> u16 {
        self.md_udp_port
    }

    pub fn md_tcp_port(&self) -> u16 {
        self.md_tcp_port
    }

    fn open_pd(&mut self, registry: &Registry) -> Result<()> {
        let mut socket = make_udp(self.host_ip, self.pd_port, self.pd_tos, self.pd_ttl)?;
        self.pd_port = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr.port(),
            _ => self.pd_port,
        };
        registry.register(&mut socket, TOKEN_PD, Interest::READABLE)?;

        // Memberships die with the old descriptor, re-acquire them.
        for group in self.mcast_refs.keys() {
            if let Err(err) = socket.join_multicast_v4(group, &self.host_ip) {
                logging::warn!(self.log, "multicast re-join failed";
                               "group" => %group, "error" => %err);
            }
        }

        self.pd = Some(socket);
        self.pd_failed = false;
        logging::debug!(self.log, "process-data socket open"; "port" => self.pd_port);
        Ok(())
    }

    fn open_md_udp(&mut self, registry: &Registry) -> Result<()> {
        let mut socket = make_udp(self.host_ip, self.md_udp_port, self.md_tos, self.md_ttl)?;
        self.md_udp_port = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr.port(),
            _ => self.md_udp_port,
        };
        registry.register(&mut socket, TOKEN_MD_UDP, Interest::READABLE)?;
        self.md_udp = Some(socket);
        self.md_failed = false;
        logging::debug!(self.log, "message-data socket open"; "port" => self.md_udp_port);
        Ok(())
    }

    fn open_md_listener(&mut self, registry: &Registry) -> Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddrV4::new(self.host_ip, self.md_tcp_port);
        socket.bind(&SocketAddr::V4(bind_addr).into())?;
        socket.listen(16)?;

        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = TcpListener::from_std(std_listener);
        self.md_tcp_port = match listener.local_addr()? {
            SocketAddr::V4(addr) => addr.port(),
            _ => self.md_tcp_port,
        };
        registry.register(&mut listener, TOKEN_MD_LISTENER, Interest::READABLE)?;
        self.md_listener = Some(listener);
        self.listener_failed = false;
        logging::debug!(self.log, "message-data listener open"; "port" => self.md_tcp_port);
        Ok(())
    }

    pub fn pd_send(&mut self, frame: &[u8], dest: SocketAddr) -> NetResult<()> {
        let socket = self.pd.as_ref().ok_or(NetError::Wait)?;
        match socket.send_to(frame, dest) {
            Ok(_) => Ok(()),
            Err(err) => Err(self.fold_pd(err)),
        }
    }

    pub fn pd_recv(&mut self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        let socket = self.pd.as_ref().ok_or(NetError::Wait)?;
        match socket.recv_from(buf) {
            Ok(result) => Ok(result),
            Err(err) => Err(self.fold_pd(err)),
        }
    }

    pub fn md_send(&mut self, frame: &[u8], dest: SocketAddr) -> NetResult<()> {
        let socket = self.md_udp.as_ref().ok_or(NetError::Wait)?;
        match socket.send_to(frame, dest) {
            Ok(_) => Ok(()),
            Err(err) => Err(self.fold_md(err)),
        }
    }

    pub fn md_recv(&mut self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        let socket = self.md_udp.as_ref().ok_or(NetError::Wait)?;
        match socket.recv_from(buf) {
            Ok(result) => Ok(result),
            Err(err) => Err(self.fold_md(err)),
        }
    }

    /// Accepts one pending TCP connection, nonblocking.
    pub fn accept(&mut self) -> NetResult<(TcpStream, SocketAddr)> {
        let listener = self.md_listener.as_ref().ok_or(NetError::Wait)?;
        match listener.accept() {
            Ok(result) => Ok(result),
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    Err(NetError::Wait)
                } else {
                    self.listener_failed = true;
                    Err(NetError::Fatal(err.into()))
                }
            }
        }
    }

    /// Starts a nonblocking TCP connect towards a message-data peer.
    pub fn connect(&self, peer: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(peer)
    }

    /// Adds a reference on the multicast group, joining it on the first one.
    pub fn join_group(&mut self, group: Ipv4Addr) -> Result<()> {
        let refs = self.mcast_refs.entry(group).or_insert(0);
        if *refs == 0 {
            let socket = self.pd.as_ref().ok_or(TrdpError::NoInit)?;
            socket.join_multicast_v4(&group, &self.host_ip)?;
            logging::debug!(self.log, "joined multicast group"; "group" => %group);
        }
        *refs += 1;
        Ok(())
    }

    /// Drops a reference on the multicast group, leaving it on the last one.
    pub fn leave_group(&mut self, group: Ipv4Addr) {
        if let Some(refs) = self.mcast_refs.get_mut(&group) {
            *refs -= 1;
            if *refs == 0 {
                self.mcast_refs.remove(&group);
                if let Some(socket) = self.pd.as_ref() {
                    if let Err(err) = socket.leave_multicast_v4(&group, &self.host_ip) {
                        logging::warn!(self.log, "multicast leave failed";
                                       "group" => %group, "error" => %err);
                    }
                }
                logging::debug!(self.log, "left multicast group"; "group" => %group);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn group_refs(&self, group: Ipv4Addr) -> u32 {
        self.mcast_refs.get(&group).copied().unwrap_or(0)
    }

    /// Reopens condemned sockets. Called once per `process` tick; returns
    /// the number of sockets brought back.
    pub fn service(&mut self, registry: &Registry) -> usize {
        let mut reopened = 0;
        if self.pd_failed {
            self.drop_socket(registry, DropWhich::Pd);
            match self.open_pd(registry) {
                Ok(()) => reopened += 1,
                Err(err) => logging::warn!(self.log, "process-data socket reopen failed"; "error" => %err),
            }
        }
        if self.md_failed {
            self.drop_socket(registry, DropWhich::MdUdp);
            match self.open_md_udp(registry) {
                Ok(()) => reopened += 1,
                Err(err) => logging::warn!(self.log, "message-data socket reopen failed"; "error" => %err),
            }
        }
        if self.listener_failed {
            self.drop_socket(registry, DropWhich::Listener);
            match self.open_md_listener(registry) {
                Ok(()) => reopened += 1,
                Err(err) => logging::warn!(self.log, "listener reopen failed"; "error" => %err),
            }
        }
        reopened
    }

    pub fn close(&mut self, registry: &Registry) {
        self.drop_socket(registry, DropWhich::Pd);
        self.drop_socket(registry, DropWhich::MdUdp);
        self.drop_socket(registry, DropWhich::Listener);
        self.mcast_refs.clear();
    }

    fn drop_socket(&mut self, registry: &Registry, which: DropWhich) {
        match which {
            DropWhich::Pd => {
                if let Some(mut socket) = self.pd.take() {
                    let _ = registry.deregister(&mut socket);
                }
            }
            DropWhich::MdUdp => {
                if let Some(mut socket) = self.md_udp.take() {
                    let _ = registry.deregister(&mut socket);
                }
            }
            DropWhich::Listener => {
                if let Some(mut listener) = self.md_listener.take() {
                    let _ = registry.deregister(&mut listener);
                }
            }
        }
    }

    fn fold_pd(&mut self, err: io::Error) -> NetError {
        if err.kind() == io::ErrorKind::WouldBlock {
            NetError::Wait
        } else {
            logging::warn!(self.log, "process-data socket condemned"; "error" => %err);
            self.pd_failed = true;
            NetError::Fatal(err.into())
        }
    }

    fn fold_md(&mut self, err: io::Error) -> NetError {
        if err.kind() == io::ErrorKind::WouldBlock {
            NetError::Wait
        } else {
            logging::warn!(self.log, "message-data socket condemned"; "error" => %err);
            self.md_failed = true;
            NetError::Fatal(err.into())
        }
    }
}

enum DropWhich {
    Pd,
    MdUdp,
    Listener,
}

fn make_udp(host_ip: Ipv4Addr, port: u16, tos: u32, ttl: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Err(err) = socket.set_tos(tos) {
        // Some environments refuse TOS manipulation; that is QoS lost, not
        // an unusable socket.
        if err.kind() != io::ErrorKind::PermissionDenied
            && err.kind() != io::ErrorKind::InvalidInput
        {
            return Err(err.into());
        }
    }
    let bind_addr = SocketAddrV4::new(host_ip, port);
    socket.bind(&SocketAddr::V4(bind_addr).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket);
    socket.set_ttl(ttl)?;
    if let Err(err) = socket.set_multicast_ttl_v4(ttl) {
        if err.kind() != io::ErrorKind::InvalidInput {
            return Err(err.into());
        }
    }
    Ok(socket)
}
