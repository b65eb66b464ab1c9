//! Hot handover: transferring live peer descriptors to a successor process.
//!
//! The control channel is a UNIX `SOCK_SEQPACKET` socket at a configured
//! path. Which side of the handover this process is on falls out of a
//! race-free probe at startup: if `connect` succeeds an instance is already
//! serving and we are the successor; if it fails with "refused" (stale
//! inode) or "no such file", we bind the path and own it.
//!
//! ```text
//! successor                     owner
//!    │ ── "unlisten" ──────────► │  close TCP listeners
//!    │ ◄── "unlistening" ─────── │
//!    │ ◄── "desc" + SCM_RIGHTS ─ │  bulk: every idle peer
//!    │          ...              │  decay: drain stragglers singly
//!    │ ◄── "exit" ────────────── │  unlink path, terminate
//!    │  bind path, become owner
//! ```
//!
//! Only the successor's opening handshake blocks: it has nothing else to do
//! until the outgoing instance has shed its listeners, and must not bind
//! the TCP port before then.

pub(crate) mod scm;

use std::fs;
use std::io;
use std::net::TcpStream as StdTcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mio::unix::SourceFd;
use mio::{Interest, Token};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::relay::conn::{ConnId, Endpoint, PeerConn};
use crate::relay::Relay;

/// Handover bookkeeping hung off the relay.
#[derive(Debug)]
pub(crate) struct CtrlState {
    pub(crate) path: PathBuf,
    /// Arena id of the control listener when this instance owns the path.
    /// Parked (deregistered, fd kept) while a control client is connected.
    pub(crate) listener: Option<ConnId>,
    /// Arena id of the live control connection, either side.
    pub(crate) conn: Option<ConnId>,
    /// True while the control connection leads to the *outgoing* instance,
    /// i.e. this process is the successor awaiting descriptors.
    pub(crate) successor: bool,
}

impl Relay {
    // ── Startup probe ───────────────────────────────────────────────────

    /// Decide the handover role for `path` and wire up the control socket.
    pub(crate) fn setup_control(&mut self, path: &Path) -> Result<()> {
        let sock = Socket::new(Domain::UNIX, Type::SEQPACKET, None)
            .context("create control socket")?;
        let addr = SockAddr::unix(path).context("control socket path")?;
        match sock.connect(&addr) {
            Ok(()) => self.become_successor(sock, path),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                // A previous owner died without unlinking; reclaim the path.
                fs::remove_file(path)
                    .with_context(|| format!("unlink stale socket {}", path.display()))?;
                self.become_owner(sock, path)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.become_owner(sock, path),
            Err(e) => {
                // Anything else (permissions, odd socket state): keep
                // serving without a handover channel.
                log::error!("connect({}): {e}", path.display());
                Ok(())
            }
        }
    }

    /// Own the path: bind, listen for at most one successor at a time.
    fn become_owner(&mut self, sock: Socket, path: &Path) -> Result<()> {
        let addr = SockAddr::unix(path).context("control socket path")?;
        sock.bind(&addr)
            .with_context(|| format!("bind control socket {}", path.display()))?;
        sock.set_reuse_address(true)
            .context("set SO_REUSEADDR on control socket")?;
        sock.listen(1).context("listen on control socket")?;
        sock.set_nonblocking(true)
            .context("set control socket nonblocking")?;

        let raw = sock.as_raw_fd();
        let entry = self.conns.vacant_entry();
        let id = entry.key();
        self.poll
            .registry()
            .register(&mut SourceFd(&raw), Token(id), Interest::READABLE)
            .context("register control listener")?;
        entry.insert(Endpoint::CtrlListener { sock });
        self.ctrl = Some(CtrlState {
            path: path.to_path_buf(),
            listener: Some(id),
            conn: None,
            successor: false,
        });
        Ok(())
    }

    /// Act as the successor: ask the running instance to stop listening
    /// and wait (blocking, by design) until it confirms.
    fn become_successor(&mut self, sock: Socket, path: &Path) -> Result<()> {
        sock.send(b"unlisten").context("send unlisten")?;
        let mut buf = [0u8; 32];
        let n = scm::recv_bytes(sock.as_raw_fd(), &mut buf).context("await unlistening")?;
        if !buf[..n].starts_with(b"unlistening") {
            log::error!(
                "running server reported: {}",
                String::from_utf8_lossy(&buf[..n])
            );
            bail!("handover refused by the running instance");
        }
        sock.set_nonblocking(true)
            .context("set control socket nonblocking")?;

        let raw = sock.as_raw_fd();
        let entry = self.conns.vacant_entry();
        let id = entry.key();
        self.poll
            .registry()
            .register(&mut SourceFd(&raw), Token(id), Interest::READABLE)
            .context("register control connection")?;
        entry.insert(Endpoint::CtrlConn { sock });
        self.ctrl = Some(CtrlState {
            path: path.to_path_buf(),
            listener: None,
            conn: Some(id),
            successor: true,
        });
        Ok(())
    }

    // ── Owner side ──────────────────────────────────────────────────────

    /// Accept a successor on the control listener. Only one control client
    /// at a time: the listener is parked until this one goes away.
    pub(crate) fn ctrl_accept_ready(&mut self, id: ConnId) {
        let accepted = match self.conns.get(id) {
            Some(Endpoint::CtrlListener { sock }) => sock.accept(),
            _ => return,
        };
        let (client, _) = match accepted {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::error!("accept control client: {e}");
                return;
            }
        };
        if let Err(e) = client.set_nonblocking(true) {
            log::error!("control client nonblocking: {e}");
            return;
        }

        let raw = client.as_raw_fd();
        let entry = self.conns.vacant_entry();
        let conn_id = entry.key();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&raw), Token(conn_id), Interest::READABLE)
        {
            log::error!("register control client: {e}");
            return;
        }
        entry.insert(Endpoint::CtrlConn { sock: client });

        if let Some(Endpoint::CtrlListener { sock }) = self.conns.get(id) {
            let raw = sock.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
        }
        if let Some(ctrl) = &mut self.ctrl {
            ctrl.conn = Some(conn_id);
        }
    }

    /// Dispatch readiness on the control connection by role. Returns true
    /// when the event batch must be abandoned (the drain just rewrote the
    /// registered set).
    pub(crate) fn ctrl_conn_ready(&mut self, id: ConnId) -> bool {
        let successor = self.ctrl.as_ref().is_some_and(|c| c.successor);
        if successor {
            self.ctrl_successor_message(id);
            false
        } else {
            self.ctrl_owner_command(id)
        }
    }

    /// Owner side: commands are bare ASCII tags, no ancillary data.
    fn ctrl_owner_command(&mut self, id: ConnId) -> bool {
        let fd = match self.conns.get(id) {
            Some(Endpoint::CtrlConn { sock }) => sock.as_raw_fd(),
            _ => return false,
        };
        let mut buf = [0u8; 32];
        loop {
            match scm::recv_bytes(fd, &mut buf) {
                Ok(0) => {
                    self.ctrl_client_closed(id);
                    return false;
                }
                Ok(n) if buf[..n].starts_with(b"unlisten") => {
                    return self.begin_drain(fd);
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("control read: {e}");
                    self.ctrl_client_closed(id);
                    return false;
                }
            }
        }
    }

    /// Handle `unlisten`: shed the TCP listeners, acknowledge, bulk-send
    /// every idle peer, and enter decay mode. Returns true so the caller
    /// abandons the rest of its event batch.
    fn begin_drain(&mut self, ctrl_fd: RawFd) -> bool {
        self.shed_listeners();
        if let Err(e) = scm::send_bytes(ctrl_fd, b"unlistening") {
            log::error!("control write: {e}");
            return false;
        }
        self.drain_idle_peers(ctrl_fd);
        self.decay = true;

        // The abandoned event batch may have carried the last readiness
        // edge of a straggler; sweep every remaining peer once so each
        // either drains out now or is guaranteed a fresh edge later.
        let remaining: Vec<ConnId> = self
            .conns
            .iter()
            .filter_map(|(id, ep)| matches!(ep, Endpoint::Peer(_)).then_some(id))
            .collect();
        for id in remaining {
            self.peer_ready(id);
        }
        true
    }

    /// Bulk-transmit every indexed peer whose read buffer is empty, up to
    /// 256 per message, repeating until a pass finds nothing idle. Peers
    /// holding a partial frame stay behind and drain singly.
    fn drain_idle_peers(&mut self, ctrl_fd: RawFd) {
        loop {
            let batch: Vec<(u16, ConnId, RawFd)> = self
                .index
                .iter()
                .filter_map(|(uid, cid)| match self.conns.get(cid) {
                    Some(Endpoint::Peer(p)) if p.buf.is_empty() => {
                        Some((uid, cid, p.stream.as_raw_fd()))
                    }
                    _ => None,
                })
                .take(scm::MAX_FDS_PER_MESSAGE)
                .collect();
            if batch.is_empty() {
                break;
            }

            let uids: Vec<i32> = batch.iter().map(|&(uid, _, _)| i32::from(uid)).collect();
            let fds: Vec<RawFd> = batch.iter().map(|&(_, _, fd)| fd).collect();
            if let Err(e) = scm::send_fds(ctrl_fd, &uids, &fds) {
                // The batch stays on this side; anyone still idle goes out
                // singly on their next readiness event.
                log::error!("bulk descriptor send: {e}");
                break;
            }
            log::info!("bulk send: {}", batch.len());
            for (uid, cid, _) in batch {
                self.release_transferred(cid, Some(uid));
            }
        }
    }

    /// Hand one peer off to the successor, kernel buffer and all. Called
    /// in decay mode whenever a peer's read buffer is (or drains) empty.
    pub(crate) fn handoff_single(&mut self, id: ConnId) {
        let Some(ctrl_fd) = self.ctrl_conn_fd() else {
            return;
        };
        let (uid, raw) = match self.conns.get(id) {
            Some(Endpoint::Peer(p)) => (p.uid, p.stream.as_raw_fd()),
            _ => return,
        };
        let wire_uid = uid.map_or(-1, i32::from);
        match scm::send_fds(ctrl_fd, &[wire_uid], &[raw]) {
            Ok(()) => {
                log::info!("single send");
                self.release_transferred(id, uid);
            }
            Err(e) => log::error!("descriptor handoff: {e}"),
        }
    }

    /// Close our copy of a transferred descriptor and drop its record.
    ///
    /// Cache bookkeeping is skipped on purpose: decay mode never consults
    /// the caches, and the record owner going away takes its cache with it.
    fn release_transferred(&mut self, id: ConnId, uid: Option<u16>) {
        if let Some(Endpoint::Peer(mut peer)) = self.conns.try_remove(id) {
            let _ = self.poll.registry().deregister(&mut peer.stream);
            if let Some(uid) = uid {
                self.index.remove_if(uid, id);
            }
            self.total_sockets -= 1;
            // Drop closes our copy; the successor's copy lives on.
        }
    }

    /// The control client went away: drop its record and resume accepting.
    fn ctrl_client_closed(&mut self, id: ConnId) {
        if let Some(Endpoint::CtrlConn { sock }) = self.conns.try_remove(id) {
            let raw = sock.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
        }
        let Some(ctrl) = &mut self.ctrl else { return };
        ctrl.conn = None;
        if let Some(listener_id) = ctrl.listener {
            if let Some(Endpoint::CtrlListener { sock }) = self.conns.get(listener_id) {
                let raw = sock.as_raw_fd();
                if let Err(e) = self
                    .poll
                    .registry()
                    .register(&mut SourceFd(&raw), Token(listener_id), Interest::READABLE)
                {
                    log::error!("re-register control listener: {e}");
                }
            }
        }
    }

    // ── Successor side ──────────────────────────────────────────────────

    /// Successor side: messages may carry descriptors in ancillary data.
    fn ctrl_successor_message(&mut self, id: ConnId) {
        let fd = match self.conns.get(id) {
            Some(Endpoint::CtrlConn { sock }) => sock.as_raw_fd(),
            _ => return,
        };
        loop {
            match scm::recv_message(fd) {
                Ok((data, fds)) => {
                    if data.is_empty() && fds.is_empty() {
                        log::error!("unexpected close of control connection");
                        self.drop_ctrl_conn(id);
                        return;
                    }
                    if data.starts_with(scm::DESC_TAG) {
                        if fds.is_empty() {
                            log::error!("malformed control message: no descriptors");
                            self.drop_ctrl_conn(id);
                            return;
                        }
                        self.adopt_descriptors(&data[4..], fds);
                    } else if data.starts_with(b"exit") {
                        self.take_ownership(id);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("control recvmsg: {e}");
                    return;
                }
            }
        }
    }

    /// Register a batch of inherited peer descriptors.
    fn adopt_descriptors(&mut self, uid_bytes: &[u8], fds: Vec<OwnedFd>) {
        let uids: Vec<i32> = uid_bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if uids.len() != fds.len() {
            log::warn!(
                "descriptor batch carries {} uids but {} descriptors",
                uids.len(),
                fds.len()
            );
        }
        for (wire_uid, fd) in uids.into_iter().zip(fds) {
            let uid = u16::try_from(wire_uid).ok();
            let std_stream = unsafe { StdTcpStream::from_raw_fd(fd.into_raw_fd()) };
            if let Err(e) = std_stream.set_nonblocking(true) {
                log::error!("inherited descriptor nonblocking: {e}");
                continue;
            }
            let mut stream = mio::net::TcpStream::from_std(std_stream);

            let entry = self.conns.vacant_entry();
            let peer_id = entry.key();
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, Token(peer_id), Interest::READABLE)
            {
                log::error!("register inherited peer: {e}");
                continue;
            }
            entry.insert(Endpoint::Peer(PeerConn::new(stream, uid)));
            self.total_sockets += 1;
            self.inherited += 1;
            if let Some(uid) = uid {
                if !self.index.insert(uid, peer_id) {
                    log::warn!("inherited uid {uid} already claimed; keeping the first");
                }
            }
        }
    }

    /// The outgoing instance is gone: take over the socket path and start
    /// accepting the next generation's handover requests.
    fn take_ownership(&mut self, conn_id: ConnId) {
        self.drop_ctrl_conn(conn_id);
        log::info!("{} sockets inherited from the dead", self.inherited);

        let Some(path) = self.ctrl.as_ref().map(|c| c.path.clone()) else {
            return;
        };
        match Socket::new(Domain::UNIX, Type::SEQPACKET, None) {
            Ok(sock) => {
                if let Err(e) = self.become_owner(sock, &path) {
                    log::error!("rebind control socket: {e:#}");
                }
            }
            Err(e) => log::error!("create control socket: {e}"),
        }
    }

    fn drop_ctrl_conn(&mut self, id: ConnId) {
        if let Some(Endpoint::CtrlConn { sock }) = self.conns.try_remove(id) {
            let raw = sock.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
        }
        if let Some(ctrl) = &mut self.ctrl {
            ctrl.conn = None;
        }
    }

    // ── Drained exit ────────────────────────────────────────────────────

    fn ctrl_conn_fd(&self) -> Option<RawFd> {
        let conn = self.ctrl.as_ref()?.conn?;
        match self.conns.get(conn) {
            Some(Endpoint::CtrlConn { sock }) => Some(sock.as_raw_fd()),
            _ => None,
        }
    }

    /// Final act of a drained owner: release the socket path and tell the
    /// successor we are gone.
    pub(crate) fn finish_handover(&mut self) {
        if !self.decay {
            return;
        }
        let Some(ctrl) = &mut self.ctrl else { return };
        let path = ctrl.path.clone();
        let conn = ctrl.conn;
        if let Some(listener_id) = ctrl.listener.take() {
            // Parked since the successor connected; just close it.
            let _ = self.conns.try_remove(listener_id);
        }
        if let Err(e) = fs::remove_file(&path) {
            log::error!("unlink({}): {e}", path.display());
        }
        if let Some(conn_id) = conn {
            if let Some(Endpoint::CtrlConn { sock }) = self.conns.get(conn_id) {
                if let Err(e) = scm::send_bytes(sock.as_raw_fd(), b"exit") {
                    log::error!("send exit: {e}");
                }
            }
        }
    }
}
