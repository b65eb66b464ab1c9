//! relayd — a uid-addressed TCP frame relay with hot descriptor handover.
//!
//! Peers connect over TCP, announce a 16-bit uid with their first frame,
//! and address later frames to other peers' uids; the relay rewrites each
//! frame's header and forwards it to the destination connection. A running
//! relay can hand every live peer descriptor to a freshly started successor
//! over a UNIX control socket (`SCM_RIGHTS`), so the fleet of peer
//! connections survives a restart of the binary.
//!
//! # Modules
//!
//! - [`frame`] - wire codec: frame scanning and the in-place header rewrite
//! - [`relay`] - single-threaded reactor, connection arena, routing
//! - [`handover`] - control channel, descriptor transfer, drain ordering

pub mod frame;
pub mod handover;
pub mod relay;

// Re-export the operational surface.
pub use relay::{Config, Relay, DEFAULT_PORT};
