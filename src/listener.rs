//! The host-side TCP listener that every guest connection is ultimately
//! handed off to.
//!
//! The listener binds an ephemeral port, resets the NAT table to match (any
//! binding recorded under a previous listener generation is meaningless
//! once the port it pointed at changes), and accepts connections that the
//! translator has steered toward it. Each accepted connection is paired
//! back up with the original guest endpoint via the destination port the
//! remote peer connected from.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use log::{debug, warn};

use crate::nat::{Endpoint, NatTable};

/// One accepted connection, paired with the guest endpoint it stands in
/// for. `endpoint.target` is what the application should treat as its own
/// local address; `endpoint.source` is the remote peer.
pub struct TcpConnection {
    pub stream: TcpStream,
    pub endpoint: Endpoint,
}

impl TcpConnection {
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.endpoint.target.ip), self.endpoint.target.port)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.endpoint.source.ip), self.endpoint.source.port)
    }
}

/// Binds an ephemeral `0.0.0.0:0` listener and accepts connections steered
/// toward it by the translator, matching each one back to its guest
/// endpoint through the NAT table.
pub struct TcpListenerGlue {
    listener: TcpListener,
    port: u16,
    mirror: Ipv4Addr,
    nat: Arc<NatTable>,
}

impl TcpListenerGlue {
    pub fn bind(mirror: Ipv4Addr, nat: Arc<NatTable>) -> io::Result<TcpListenerGlue> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = listener.local_addr()?.port();
        nat.reset();
        Ok(TcpListenerGlue { listener, port, mirror, nat })
    }

    /// The port the translator should rewrite every guest connection's
    /// destination to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shuts the listening socket down, unblocking a thread parked in
    /// `accept_loop`. Safe to call from any thread; the accept loop observes
    /// the resulting error and returns.
    pub fn close(&self) {
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    /// Accepts connections until the listener errors (e.g. the socket is
    /// closed from another thread to force an unblock), handing each one
    /// that checks out to `handler`.
    pub fn accept_loop<F: Fn(TcpConnection)>(&self, handler: F) -> io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept()?;
            let peer_ip = match peer.ip() {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => {
                    debug!("dropping connection from unexpected IPv6 peer {}", peer);
                    continue;
                }
            };
            if peer_ip != self.mirror {
                debug!("dropping connection from non-mirror peer {}", peer);
                continue;
            }
            match self.nat.get_by_port(peer.port()) {
                Some(binding) => handler(TcpConnection { stream, endpoint: binding.endpoint }),
                None => {
                    warn!("no binding for ephemeral port {}, dropping connection", peer.port());
                }
            }
        }
    }
}
