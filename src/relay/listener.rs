//! TCP listener management: dual-family bind, accept, shed.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{bail, Context, Result};
use mio::net::TcpListener;
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::relay::conn::{ConnId, Endpoint, PeerConn};
use crate::relay::Relay;

const LISTEN_BACKLOG: i32 = 50;

impl Relay {
    /// Bind one listener per address family on `port`.
    ///
    /// IPv6 gets `IPV6_V6ONLY` so the two sockets never contend for the
    /// same connections; both get `SO_REUSEADDR` so a successor can bind
    /// while the outgoing instance still holds draining peers. A family
    /// the host does not support is skipped; any other failure is fatal.
    pub(crate) fn bind_listeners(&mut self, port: u16) -> Result<()> {
        let targets: [SocketAddr; 2] = [
            (Ipv4Addr::UNSPECIFIED, port).into(),
            (Ipv6Addr::UNSPECIFIED, port).into(),
        ];
        for addr in targets {
            let sock = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)) {
                Ok(sock) => sock,
                Err(e) if e.raw_os_error() == Some(libc::EAFNOSUPPORT) => {
                    log::warn!("address family of {addr} unsupported, skipping");
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("socket for {addr}")),
            };
            if addr.is_ipv6() {
                sock.set_only_v6(true).context("set IPV6_V6ONLY")?;
            }
            sock.set_reuse_address(true).context("set SO_REUSEADDR")?;
            sock.bind(&addr.into())
                .with_context(|| format!("bind {addr}"))?;
            sock.listen(LISTEN_BACKLOG)
                .with_context(|| format!("listen on {addr}"))?;
            sock.set_nonblocking(true).context("set nonblocking")?;

            let mut sock = TcpListener::from_std(sock.into());
            let label = sock
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| addr.to_string());

            let entry = self.conns.vacant_entry();
            let id = entry.key();
            self.poll
                .registry()
                .register(&mut sock, Token(id), Interest::READABLE)
                .with_context(|| format!("register listener {label}"))?;
            entry.insert(Endpoint::Listener { sock, label: label.clone() });
            self.listeners.push(id);
            self.total_sockets += 1;
            log::info!("listening on {label}");
        }
        if self.listeners.is_empty() {
            bail!("no listen sockets bound on port {port}");
        }
        Ok(())
    }

    /// Accept everything pending on a readable listener. Each accepted
    /// stream becomes an unannounced peer record.
    pub(crate) fn accept_ready(&mut self, id: ConnId) {
        loop {
            let accepted = match self.conns.get_mut(id) {
                Some(Endpoint::Listener { sock, .. }) => sock.accept(),
                _ => return,
            };
            match accepted {
                Ok((mut stream, _addr)) => {
                    let entry = self.conns.vacant_entry();
                    let peer_id = entry.key();
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, Token(peer_id), Interest::READABLE)
                    {
                        log::error!("register accepted peer: {e}");
                        continue;
                    }
                    entry.insert(Endpoint::Peer(PeerConn::new(stream, None)));
                    self.total_sockets += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("accept: {e}");
                    return;
                }
            }
        }
    }

    /// Close and deregister every TCP listener. Triggered by the shed
    /// signal or by an `unlisten` handover command.
    pub(crate) fn shed_listeners(&mut self) {
        for id in std::mem::take(&mut self.listeners) {
            if let Some(Endpoint::Listener { mut sock, label }) = self.conns.try_remove(id) {
                log::info!("close server {label}");
                let _ = self.poll.registry().deregister(&mut sock);
                self.total_sockets -= 1;
            }
        }
    }
}
