//! Connection records for the reactor arena.
//!
//! Every open descriptor owns exactly one slot in the relay's slab; the slab
//! key doubles as the mio token, so an event maps straight back to its
//! record. Peer caches reference other records by id only — the arena is the
//! sole owner, and teardown scrubs dangling ids instead of counting refs.

use mio::net::{TcpListener, TcpStream};
use socket2::Socket;

use crate::relay::peers::PeerCache;

/// Stable arena id of a connection record. Doubles as the mio token.
pub type ConnId = usize;

/// Read buffer capacity for a peer connection.
///
/// Strictly exceeds the largest permitted frame body (the size field is
/// checked against this value) and keeps record plus buffer within a single
/// 4 KiB allocation.
pub const PEER_BUF_CAPACITY: usize = 4096 - 256;

/// One open descriptor.
#[derive(Debug)]
pub enum Endpoint {
    /// TCP accept socket, with its printable address label.
    Listener { sock: TcpListener, label: String },
    /// An accepted (or inherited) peer connection.
    Peer(PeerConn),
    /// UNIX SEQPACKET accept socket for the handover channel.
    CtrlListener { sock: Socket },
    /// The single live handover connection.
    CtrlConn { sock: Socket },
}

/// Kind of descriptor a record holds; drives event dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    TcpListener,
    TcpPeer,
    CtrlListener,
    CtrlConn,
}

impl Endpoint {
    pub fn kind(&self) -> ConnKind {
        match self {
            Endpoint::Listener { .. } => ConnKind::TcpListener,
            Endpoint::Peer(_) => ConnKind::TcpPeer,
            Endpoint::CtrlListener { .. } => ConnKind::CtrlListener,
            Endpoint::CtrlConn { .. } => ConnKind::CtrlConn,
        }
    }
}

/// Per-peer connection state: stream, identity, inbound buffer, route cache.
#[derive(Debug)]
pub struct PeerConn {
    pub stream: TcpStream,
    /// Announced 16-bit identity; `None` until the first frame arrives.
    pub uid: Option<u16>,
    pub buf: ReadBuf,
    pub cache: PeerCache,
}

impl PeerConn {
    pub fn new(stream: TcpStream, uid: Option<u16>) -> Self {
        Self {
            stream,
            uid,
            buf: ReadBuf::with_capacity(PEER_BUF_CAPACITY),
            cache: PeerCache::new(),
        }
    }
}

/// Fixed-capacity inbound byte buffer.
///
/// Holds the prefix of an in-progress frame between readiness events. New
/// bytes land in [`ReadBuf::spare_mut`], parsed frames are dropped from the
/// front with [`ReadBuf::consume`], which compacts the remainder.
#[derive(Debug)]
pub struct ReadBuf {
    data: Box<[u8]>,
    len: usize,
}

impl ReadBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received so far.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Unwritten tail; read into this, then call [`ReadBuf::advance`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Record `n` bytes written into the spare tail.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.data.len());
        self.len += n;
    }

    /// Drop `n` bytes from the front, compacting the rest down.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        if n == 0 {
            return;
        }
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readbuf_advance_and_consume() {
        let mut buf = ReadBuf::with_capacity(8);
        buf.spare_mut()[..5].copy_from_slice(b"abcde");
        buf.advance(5);
        assert_eq!(buf.filled(), b"abcde");

        buf.consume(2);
        assert_eq!(buf.filled(), b"cde");
        assert_eq!(buf.spare_mut().len(), 5);

        buf.consume(3);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_readbuf_consume_zero_is_noop() {
        let mut buf = ReadBuf::with_capacity(4);
        buf.spare_mut()[..2].copy_from_slice(b"xy");
        buf.advance(2);
        buf.consume(0);
        assert_eq!(buf.filled(), b"xy");
    }

    #[test]
    fn test_readbuf_refill_after_compaction() {
        let mut buf = ReadBuf::with_capacity(4);
        buf.spare_mut().copy_from_slice(b"abcd");
        buf.advance(4);
        assert!(buf.spare_mut().is_empty());

        buf.consume(3);
        buf.spare_mut()[..3].copy_from_slice(b"efg");
        buf.advance(3);
        assert_eq!(buf.filled(), b"defg");
    }

    #[test]
    fn test_peer_capacity_within_protocol_bounds() {
        // The protocol requires at least 2 KiB of frame headroom while the
        // record plus buffer stays inside a 4 KiB allocation.
        assert!(PEER_BUF_CAPACITY >= 2048);
        assert!(PEER_BUF_CAPACITY < 4096);
    }
}
