//! A userspace NAT that terminates TCP and UDP flows arriving on a tun
//! device so a host process can relay them as ordinary sockets.
//!
//! [`Datapath`] wires the pieces together: a [`tun::TunDevice`] read/write
//! loop, [`frag`] reassembly and fragmentation, a [`nat::NatTable`] bridging
//! guest 4-tuples to an ephemeral host port, [`translate::Translator`] and
//! [`icmp`] rewriting packets in place, and [`udp_relay`] demultiplexing
//! datagrams to an application callback. [`listener`] recovers the original
//! endpoint for each accepted TCP connection.

pub mod checksum;
pub mod config;
pub mod error;
pub mod frag;
pub mod icmp;
pub mod listener;
pub mod nat;
pub mod pipeline;
pub mod pool;
pub mod translate;
pub mod tun;
pub mod udp_relay;
pub mod wire;

use std::sync::Arc;

use anyhow::{Context, Result};

use config::Config;
use listener::{TcpConnection, TcpListenerGlue};
use nat::NatTable;
use pipeline::{DoneSignal, Pipeline, UdpReceiver};
use tun::TunDevice;

/// The running system: the I/O pipeline plus the host TCP listener it
/// steers connections toward. `tun` is taken by value since a `TunDevice`
/// is an external collaborator (opened and configured by the caller) handed
/// off for the datapath's exclusive use.
pub struct Datapath {
    config: Config,
    pipeline: Pipeline,
    listener: TcpListenerGlue,
}

impl Datapath {
    /// Binds the host TCP listener, builds the NAT table and pipeline, and
    /// points the translator at the listener's chosen port. Does not start
    /// any worker threads yet; call [`Datapath::start`] for that.
    pub fn new(config: Config, tun: TunDevice, udp_receiver: Arc<UdpReceiver>) -> Result<Datapath> {
        let nat = Arc::new(NatTable::new(config.nat_capacity));
        let listener = TcpListenerGlue::bind(config.mirror, nat.clone())
            .context("binding the host TCP listener")?;
        let pipeline = Pipeline::new(config, Arc::new(tun), nat, udp_receiver);
        pipeline.set_listener_port(listener.port());
        Ok(Datapath { config, pipeline, listener })
    }

    /// Spawns the reader/writer/dispatcher workers. Idempotent.
    pub fn start(&self) {
        self.pipeline.start(self.config.dispatcher_workers, self.config.channel_capacity);
    }

    /// Runs the TCP accept loop on the calling thread until [`Datapath::close`]
    /// unblocks it. Each accepted connection steered from the mirror address
    /// is handed to `handler`, paired with the guest endpoint it stands in
    /// for.
    pub fn run_tcp_accept_loop<F: Fn(TcpConnection)>(&self, handler: F) -> std::io::Result<()> {
        self.listener.accept_loop(handler)
    }

    /// The ephemeral port the host TCP listener is bound to; this is what
    /// guest-originated SYNs get rewritten to target.
    pub fn listener_port(&self) -> u16 {
        self.listener.port()
    }

    pub fn done_signal(&self) -> DoneSignal {
        self.pipeline.done_signal()
    }

    /// Fires the done signal, closes the tun device, and shuts down the
    /// host listener — every worker and the accept loop unblock and exit.
    /// Idempotent.
    pub fn close(&self) {
        self.pipeline.close();
        self.listener.close();
    }
}
