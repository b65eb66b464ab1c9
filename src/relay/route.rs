//! Frame routing: per-readiness read, parse, and forward.
//!
//! The poll is edge-triggered, so a readable peer is drained until the
//! kernel reports `WouldBlock`; the parse loop runs after every chunk so
//! the buffer never wedges on back-to-back frames. Forwarding rewrites the
//! inbound header in place and issues a single best-effort write — short
//! writes are logged, never retried (kernel back-pressure is the only flow
//! control this system offers).

use std::io::Read;
use std::os::unix::io::AsRawFd;

use crate::frame::{self, Scan};
use crate::relay::conn::{ConnId, Endpoint, PEER_BUF_CAPACITY};
use crate::relay::Relay;

/// What became of a peer while draining its buffer.
enum Drained {
    /// Buffer parsed as far as it goes; the record is still live.
    Alive,
    /// The record was torn down (EOF upstream or protocol violation).
    Gone,
}

impl Relay {
    /// Handle read-readiness on a peer connection.
    pub(crate) fn peer_ready(&mut self, id: ConnId) {
        // Decay fast path: an already-empty peer travels to the successor
        // with its unread kernel bytes still in the socket.
        if self.decay && self.peer_buf_empty(id) {
            self.handoff_single(id);
            return;
        }

        loop {
            let read = {
                let Some(Endpoint::Peer(peer)) = self.conns.get_mut(id) else {
                    return;
                };
                let spare = peer.buf.spare_mut();
                if spare.is_empty() {
                    None
                } else {
                    Some(peer.stream.read(spare))
                }
            };
            let Some(read) = read else {
                // A frame whose total (size + 4) exceeds the buffer can
                // fill it without ever completing; it can make no further
                // progress.
                log::warn!("peer buffer wedged on an unfinishable frame");
                self.teardown_peer(id);
                return;
            };
            match read {
                Ok(0) => {
                    self.teardown_peer(id);
                    return;
                }
                Ok(n) => {
                    if let Some(Endpoint::Peer(peer)) = self.conns.get_mut(id) {
                        peer.buf.advance(n);
                    }
                    match self.drain_frames(id) {
                        Drained::Alive => {}
                        Drained::Gone => return,
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // Transient per the error taxonomy; the peer either
                // recovers or reports EOF on a later event.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
                Err(e) => {
                    log::warn!("read: {e}");
                    break;
                }
            }
        }

        if self.decay && self.peer_buf_empty(id) {
            // Rid ourselves of drained peers immediately rather than
            // waiting for their next frame to trigger it.
            self.handoff_single(id);
        }
    }

    fn peer_buf_empty(&self, id: ConnId) -> bool {
        matches!(self.conns.get(id), Some(Endpoint::Peer(p)) if p.buf.is_empty())
    }

    /// Parse and dispatch every complete frame at the front of the buffer,
    /// then compact the leftovers down to the front.
    fn drain_frames(&mut self, id: ConnId) -> Drained {
        let mut head = 0;
        loop {
            let decision = {
                let Some(Endpoint::Peer(peer)) = self.conns.get(id) else {
                    return Drained::Gone;
                };
                frame::scan(
                    &peer.buf.filled()[head..],
                    peer.uid.is_some(),
                    PEER_BUF_CAPACITY,
                )
            };
            match decision {
                Scan::NeedMore => break,
                Scan::Oversize { size } => {
                    log::warn!("frame of {size} bytes exceeds buffer capacity, dropping peer");
                    self.teardown_peer(id);
                    return Drained::Gone;
                }
                Scan::Runt { size } => {
                    log::warn!("frame body of {size} bytes cannot hold its header, dropping peer");
                    self.teardown_peer(id);
                    return Drained::Gone;
                }
                Scan::Announce { uid, consumed } => {
                    self.announce_peer(id, uid);
                    head += consumed;
                }
                Scan::Data { dest, consumed, .. } => {
                    // In decay mode every frame is discarded: forwarding
                    // would consult caches the drain no longer maintains.
                    if !self.decay {
                        self.forward(id, head, consumed, dest);
                    }
                    head += consumed;
                }
            }
        }
        if let Some(Endpoint::Peer(peer)) = self.conns.get_mut(id) {
            peer.buf.consume(head);
        }
        Drained::Alive
    }

    /// First frame on a connection: adopt the announced uid and index it.
    fn announce_peer(&mut self, id: ConnId, uid: u16) {
        let Some(Endpoint::Peer(peer)) = self.conns.get_mut(id) else {
            return;
        };
        peer.uid = Some(uid);
        if !self.index.insert(uid, id) {
            log::warn!("uid {uid} announced twice; keeping the first claimant");
        }
    }

    /// Forward one complete addressed frame (`buf[head..head + len]` on the
    /// source) to the peer announced as `dest`. Unknown destinations are
    /// dropped silently — routine during reconfiguration.
    fn forward(&mut self, src: ConnId, head: usize, len: usize, dest: u16) {
        let Some(dst) = self.lookup_dest(src, dest) else {
            return;
        };

        // Rewrite in the source buffer, then write the outbound slice to
        // the destination's descriptor. Borrowing the descriptor rather
        // than the stream keeps the source buffer readable during the
        // write (a peer may even address its own uid).
        let out = {
            let Some(Endpoint::Peer(peer)) = self.conns.get_mut(src) else {
                return;
            };
            let frame = &mut peer.buf.filled_mut()[head..head + len];
            let local = frame::rewrite_for_forward(frame);
            head + local.start..head + local.end
        };
        let Some(Endpoint::Peer(dst_peer)) = self.conns.get(dst) else {
            return;
        };
        let dst_fd = dst_peer.stream.as_raw_fd();
        let Some(Endpoint::Peer(src_peer)) = self.conns.get(src) else {
            return;
        };
        write_frame(dst_fd, &src_peer.buf.filled()[out]);
    }

    /// Resolve a destination uid: route cache first, then the index. An
    /// index hit is promoted into the source's cache.
    fn lookup_dest(&mut self, src: ConnId, dest: u16) -> Option<ConnId> {
        let cached = {
            let Some(Endpoint::Peer(peer)) = self.conns.get(src) else {
                return None;
            };
            peer.cache.ids().iter().copied().find(|&cid| {
                matches!(self.conns.get(cid), Some(Endpoint::Peer(p)) if p.uid == Some(dest))
            })
        };
        if cached.is_some() {
            return cached;
        }
        let found = self.index.get(dest)?;
        if let Some(Endpoint::Peer(peer)) = self.conns.get_mut(src) {
            peer.cache.add(found);
        }
        Some(found)
    }
}

/// Best-effort single write of a forwarded frame to a borrowed descriptor.
///
/// No retry: a reset or closed destination loses the frame quietly, any
/// other failure (including a partial write) is only logged. `MSG_NOSIGNAL`
/// keeps a dead destination from raising SIGPIPE in embedding processes
/// that did not install the process-scope ignore.
fn write_frame(fd: std::os::unix::io::RawFd, bytes: &[u8]) {
    let n = unsafe {
        libc::send(
            fd,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        let e = std::io::Error::last_os_error();
        if !matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
        ) {
            log::warn!("write: {e}");
        }
    } else if n as usize != bytes.len() {
        log::warn!("short write ({n} of {})", bytes.len());
    }
}
