//! One message-data TCP connection.
//!
//! Frames on a stream are delimited by the header itself: the dataset
//! length at a fixed offset announces the full frame size, so reassembly is
//! "buffer until the announced size is there, then cut one frame". Writes
//! are buffered and flushed on writable readiness.

use crate::error::{NetError, NetResult};
use crate::net::buffer::Buffer;
use crate::wire::header;
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const CONN_BUF_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Nonblocking connect still in flight; writable readiness completes it.
    Connecting,
    Open,
}

pub(crate) struct TcpConn {
    stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    rd: Buffer,
    wr: Buffer,
    pub last_activity: Instant,
    pub inbound: bool,
}

impl TcpConn {
    /// Starts a nonblocking connect towards the peer.
    pub fn outbound(peer: SocketAddr, now: Instant) -> io::Result<TcpConn> {
        let stream = TcpStream::connect(peer)?;
        Ok(TcpConn {
            stream,
            peer,
            state: ConnState::Connecting,
            rd: Buffer::new(CONN_BUF_SIZE),
            wr: Buffer::new(CONN_BUF_SIZE),
            last_activity: now,
            inbound: false,
        })
    }

    /// Wraps an accepted stream.
    pub fn inbound(stream: TcpStream, peer: SocketAddr, now: Instant) -> TcpConn {
        TcpConn {
            stream,
            peer,
            state: ConnState::Open,
            rd: Buffer::new(CONN_BUF_SIZE),
            wr: Buffer::new(CONN_BUF_SIZE),
            last_activity: now,
            inbound: true,
        }
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.wr.is_empty()
    }

    #[inline]
    pub fn idle(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    /// Queues a complete frame for transmission and tries to push it out
    /// right away.
    pub fn queue_frame(&mut self, frame: &[u8], now: Instant) -> NetResult<()> {
        self.wr.extend(frame)?;
        match self.flush(now) {
            Ok(_) | Err(NetError::Wait) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Pushes buffered bytes to the stream.
    pub fn flush(&mut self, now: Instant) -> NetResult<usize> {
        if self.state == ConnState::Connecting || self.wr.is_empty() {
            return Ok(0);
        }
        let sent = self.wr.egress(&mut self.stream)?;
        if sent > 0 {
            self.last_activity = now;
        }
        Ok(sent)
    }

    /// Completes the connect on writable readiness, then flushes.
    pub fn on_writable(&mut self, now: Instant) -> NetResult<usize> {
        if self.state == ConnState::Connecting {
            // A connect error surfaces here; a clean peer address means the
            // stream is usable.
            if let Some(err) = self.stream.take_error()? {
                return Err(NetError::Fatal(err.into()));
            }
            match self.stream.peer_addr() {
                Ok(_) => {
                    self.state = ConnState::Open;
                    self.last_activity = now;
                }
                Err(ref err) if err.kind() == io::ErrorKind::NotConnected => return Ok(0),
                Err(_) => return Ok(0),
            }
        }
        self.flush(now)
    }

    /// Reads whatever the stream has. `Ok(0)` after readable readiness means
    /// the peer closed the connection.
    pub fn on_readable(&mut self, now: Instant) -> NetResult<usize> {
        let received = self.rd.ingress(&mut self.stream)?;
        if received > 0 {
            self.last_activity = now;
        }
        Ok(received)
    }

    /// Cuts the next complete frame off the reassembly buffer.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let size = header::peek_md_frame_size(self.rd.read_slice())?;
        if size < header::MD_HEADER_SIZE || size > header::md_frame_size(header::MAX_MD_PAYLOAD) {
            // Hopeless framing; drop the buffer so the connection gets torn
            // down by the next decode failure upstream.
            self.rd.clear();
            return None;
        }
        if self.rd.read_slice().len() < size {
            return None;
        }
        let frame = self.rd.read_slice()[..size].to_vec();
        self.rd.consume(size);
        Some(frame)
    }
}
