//! Relay core: the readiness reactor and connection arena.
//!
//! Strictly single-threaded. One mio poll owns every descriptor; each
//! registered descriptor is backed by exactly one [`Endpoint`] record in the
//! slab, whose key is the mio token. The loop runs until the tracked socket
//! count (listeners plus peers — control sockets excluded) reaches zero,
//! which for an instance that handed its peers to a successor is the
//! post-drain condition.
//!
//! ```text
//! peers ──TCP──► Listener ──accept──► Peer ──frames──► Peer
//!                                        │
//!                          CtrlListener/CtrlConn (UNIX SEQPACKET)
//!                                        │
//!                              successor process (SCM_RIGHTS)
//! ```

pub mod conn;
mod listener;
pub mod peers;
mod route;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mio::{Events, Poll};
use slab::Slab;

use crate::handover::CtrlState;
use conn::{ConnId, ConnKind, Endpoint};
use peers::PeerIndex;

/// Default TCP listen port.
pub const DEFAULT_PORT: u16 = 9134;

/// Upper bound on readiness events consumed per wait.
const EVENT_BATCH: usize = 32;

/// Wait ceiling, so the shed flag and status line stay responsive under
/// quiet traffic.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interval between status log lines.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Relay configuration, produced by the CLI shell.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port, both address families.
    pub port: u16,
    /// UNIX control socket path; enables hot handover when set.
    pub ctrl_socket: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ctrl_socket: None,
        }
    }
}

/// The relay: reactor, connection arena, peer index, handover state.
pub struct Relay {
    pub(crate) poll: Poll,
    pub(crate) conns: Slab<Endpoint>,
    pub(crate) index: PeerIndex,
    /// Arena ids of the live TCP listeners.
    pub(crate) listeners: Vec<ConnId>,
    /// Listeners plus peers; the process exits when this reaches zero.
    pub(crate) total_sockets: usize,
    /// Set after this instance shed its peers' forwarding duties to a
    /// successor: the router discards instead of forwarding, and peers are
    /// handed off as their buffers drain.
    pub(crate) decay: bool,
    /// Peer descriptors adopted from a predecessor, for the status line.
    pub(crate) inherited: usize,
    pub(crate) ctrl: Option<CtrlState>,
    shed_flag: Arc<AtomicBool>,
}

impl Relay {
    /// Build a relay: resolve the handover role first (a successor must
    /// finish its handshake before the listen ports are free), then bind
    /// the TCP listeners.
    pub fn new(config: &Config) -> Result<Self> {
        let poll = Poll::new().context("create poll")?;
        let mut relay = Relay {
            poll,
            conns: Slab::new(),
            index: PeerIndex::new(),
            listeners: Vec::new(),
            total_sockets: 0,
            decay: false,
            inherited: 0,
            ctrl: None,
            shed_flag: Arc::new(AtomicBool::new(false)),
        };
        if let Some(path) = &config.ctrl_socket {
            relay.setup_control(path)?;
        }
        relay.bind_listeners(config.port)?;
        Ok(relay)
    }

    /// Shared flag that sheds the TCP listeners when set (signal-safe).
    pub fn shed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shed_flag)
    }

    /// Addresses the TCP listeners actually bound to.
    pub fn listener_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|&id| match self.conns.get(id) {
                Some(Endpoint::Listener { sock, .. }) => sock.local_addr().ok(),
                _ => None,
            })
            .collect()
    }

    /// Run the event loop until no listeners or peers remain.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENT_BATCH);
        let mut last_status = Instant::now();

        while self.total_sockets > 0 {
            if self.shed_flag.swap(false, Ordering::Relaxed) {
                self.shed_listeners();
            }
            if last_status.elapsed() >= STATUS_INTERVAL {
                log::info!(
                    "{} connections, {} identified peers",
                    self.total_sockets - self.listeners.len(),
                    self.index.len()
                );
                last_status = Instant::now();
            }

            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e).context("poll wait");
            }

            let mut restart = false;
            for event in events.iter() {
                if restart {
                    // The drain just rewrote the registered set; stale
                    // entries in this batch are worthless. Wait afresh.
                    break;
                }
                let id = event.token().0;
                // The slot may have been torn down by an earlier event in
                // this same batch.
                let Some(kind) = self.conns.get(id).map(Endpoint::kind) else {
                    continue;
                };
                match kind {
                    ConnKind::TcpListener => self.accept_ready(id),
                    ConnKind::TcpPeer => self.peer_ready(id),
                    ConnKind::CtrlListener => self.ctrl_accept_ready(id),
                    ConnKind::CtrlConn => restart = self.ctrl_conn_ready(id),
                }
            }
        }

        self.finish_handover();
        log::info!("exit with {} sockets left to serve", self.total_sockets);
        Ok(())
    }

    /// Tear a peer down completely: deregister, drop the record, unindex,
    /// and scrub its id from every route cache so no weak reference
    /// dangles. Only announced peers hold cache entries, so walking the
    /// index covers every cache.
    pub(crate) fn teardown_peer(&mut self, id: ConnId) {
        if !matches!(self.conns.get(id), Some(Endpoint::Peer(_))) {
            return;
        }
        let Some(Endpoint::Peer(mut peer)) = self.conns.try_remove(id) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut peer.stream);
        if let Some(uid) = peer.uid {
            self.index.remove_if(uid, id);
        }
        let indexed: Vec<ConnId> = self.index.iter().map(|(_, cid)| cid).collect();
        for other in indexed {
            if let Some(Endpoint::Peer(p)) = self.conns.get_mut(other) {
                p.cache.remove(id);
            }
        }
        self.total_sockets -= 1;
        // `peer` drops here, closing the descriptor.
    }
}
