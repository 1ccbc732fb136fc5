//! The reader/writer/dispatcher worker pipeline that ties the tun device to
//! the translator, ICMP responder, and UDP relay.
//!
//! Bounded channels (capacity configured via [`crate::config::Config`])
//! mediate every hop; enqueue is a non-blocking `try_send` so a burst sheds
//! load rather than backing up a worker thread against a full queue.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{trace, warn};

use crate::config::Config;
use crate::frag::{Fragmenter, Reassembled, Reassembler};
use crate::icmp;
use crate::nat::{Endpoint, NatTable};
use crate::pool::{BufferPool, PooledBuffer};
use crate::translate::{Outcome as TranslateOutcome, Translator, TranslatorConfig};
use crate::tun::TunDevice;
use crate::udp_relay;
use crate::wire::{Ipv4Packet, Protocol};

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A one-shot broadcast primitive: starts "not done", transitions once to
/// "done", never back. Cheap to clone and share across worker threads.
#[derive(Clone)]
pub struct DoneSignal {
    flag: Arc<AtomicBool>,
}

impl DoneSignal {
    pub fn new() -> DoneSignal {
        DoneSignal { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn fire(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for DoneSignal {
    fn default() -> DoneSignal {
        DoneSignal::new()
    }
}

/// Injects a UDP reply into the outbound path. Handed to the application's
/// `udp_receiver` callback once per inbound datagram.
#[derive(Clone)]
pub struct UdpSender {
    pool: BufferPool,
    mtu: usize,
    outbound: SyncSender<PooledBuffer>,
}

impl UdpSender {
    pub fn send(&self, endpoint: &Endpoint, payload: &[u8]) -> crate::error::Result<()> {
        let buf = udp_relay::send(&self.pool, self.mtu, endpoint, payload)?;
        if let Err(TrySendError::Full(_)) = self.outbound.try_send(buf) {
            trace!("outbound queue full, dropping synthesized UDP reply");
        }
        Ok(())
    }
}

/// Receives one demultiplexed UDP datagram plus a handle for replying.
pub type UdpReceiver = dyn Fn(PooledBuffer, Endpoint, UdpSender) + Send + Sync;

struct Shared {
    tun: Arc<TunDevice>,
    pool: BufferPool,
    nat: Arc<NatTable>,
    reassembler: Reassembler,
    fragmenter: Fragmenter,
    translator_config: TranslatorConfig,
    listener_port: AtomicU16,
    udp_receiver: Arc<UdpReceiver>,
    outbound: SyncSender<PooledBuffer>,
    done: DoneSignal,
}

/// Owns the worker threads and the channels between them. Constructed once
/// per running instance; `close` is idempotent.
pub struct Pipeline {
    shared: Arc<Shared>,
    outbound_rx: Mutex<Option<Receiver<PooledBuffer>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        tun: Arc<TunDevice>,
        nat: Arc<NatTable>,
        udp_receiver: Arc<UdpReceiver>,
    ) -> Pipeline {
        let pool = BufferPool::new(config.mtu);
        let reassembler = Reassembler::new(pool.clone(), config.max_fragment_trackers);
        let fragmenter = Fragmenter::new(pool.clone(), config.mtu);
        let (outbound_tx, outbound_rx) = sync_channel::<PooledBuffer>(config.channel_capacity);

        let shared = Arc::new(Shared {
            tun,
            pool,
            nat,
            reassembler,
            fragmenter,
            translator_config: TranslatorConfig { gateway: config.gateway, mirror: config.mirror },
            listener_port: AtomicU16::new(0),
            udp_receiver,
            outbound: outbound_tx,
            done: DoneSignal::new(),
        });

        Pipeline { shared, outbound_rx: Mutex::new(Some(outbound_rx)), workers: Mutex::new(Vec::new()) }
    }

    /// Tells the translator which host-listener port stands in for every
    /// guest connection, and drops any bindings from a previous listener
    /// generation (their ephemeral ports no longer mean anything).
    pub fn set_listener_port(&self, port: u16) {
        self.shared.listener_port.store(port, Ordering::SeqCst);
        self.shared.nat.reset();
    }

    pub fn done_signal(&self) -> DoneSignal {
        self.shared.done.clone()
    }

    pub fn buffer_pool(&self) -> BufferPool {
        self.shared.pool.clone()
    }

    /// Spawns the reader, writer, and dispatcher workers. Idempotent: a
    /// second call while workers are already running is a no-op.
    pub fn start(&self, dispatcher_workers: usize, channel_capacity: usize) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }

        let outbound_rx = self.outbound_rx.lock().unwrap().take();
        if let Some(rx) = outbound_rx {
            let shared = self.shared.clone();
            workers.push(std::thread::spawn(move || writer_loop(shared, rx)));
        }

        let (inbound_tx, inbound_rx) = sync_channel::<PooledBuffer>(channel_capacity);
        let inbound_rx = Arc::new(Mutex::new(inbound_rx));

        let shared = self.shared.clone();
        workers.push(std::thread::spawn(move || reader_loop(shared, inbound_tx)));

        for _ in 0..dispatcher_workers.max(1) {
            let shared = self.shared.clone();
            let inbound_rx = inbound_rx.clone();
            workers.push(std::thread::spawn(move || dispatcher_loop(shared, inbound_rx)));
        }
    }

    /// Fires the done signal and closes the tun device, unblocking the
    /// reader. Idempotent.
    pub fn close(&self) {
        self.shared.done.fire();
        self.shared.tun.close();
    }

    pub fn join(&self) {
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn reader_loop(shared: Arc<Shared>, inbound_tx: SyncSender<PooledBuffer>) {
    let mtu = shared.pool.mtu();
    loop {
        if shared.done.is_done() {
            return;
        }
        let mut buf = shared.pool.acquire(mtu);
        match shared.tun.recv(buf.as_mut()) {
            Ok(n) => {
                buf.truncate(n);
                if let Err(TrySendError::Full(_)) = inbound_tx.try_send(buf) {
                    trace!("inbound queue full, dropping frame");
                }
            }
            Err(e) => {
                warn!("tun read failed, terminating pipeline: {}", e);
                shared.done.fire();
                return;
            }
        }
    }
}

fn writer_loop(shared: Arc<Shared>, outbound_rx: Receiver<PooledBuffer>) {
    loop {
        if shared.done.is_done() {
            return;
        }
        let buf = match outbound_rx.recv_timeout(RECV_POLL_INTERVAL) {
            Ok(buf) => buf,
            Err(_) => continue,
        };
        if let Err(e) = shared.tun.send(buf.as_ref()) {
            warn!("tun write failed, terminating pipeline: {}", e);
            shared.done.fire();
            return;
        }
    }
}

fn dispatcher_loop(shared: Arc<Shared>, inbound_rx: Arc<Mutex<Receiver<PooledBuffer>>>) {
    loop {
        if shared.done.is_done() {
            return;
        }
        let buf = {
            let rx = inbound_rx.lock().unwrap();
            match rx.recv_timeout(RECV_POLL_INTERVAL) {
                Ok(buf) => buf,
                Err(_) => continue,
            }
        };
        dispatch_one(&shared, buf);
    }
}

fn dispatch_one(shared: &Shared, buf: PooledBuffer) {
    let packet = match Ipv4Packet::new_checked(buf) {
        Ok(p) => p,
        Err(_) => return,
    };

    let packet = match shared.reassembler.process(packet) {
        Ok(Reassembled::Complete(buf)) => match Ipv4Packet::new_checked(buf) {
            Ok(p) => p,
            Err(_) => return,
        },
        Ok(Reassembled::Pending) => return,
        Err(_) => return,
    };

    match packet.protocol() {
        Some(Protocol::Tcp) => {
            let listener_port = shared.listener_port.load(Ordering::SeqCst);
            let translator = Translator::new(shared.translator_config, &shared.nat, listener_port);
            if let TranslateOutcome::Forward(out) = translator.translate(packet) {
                emit(shared, out);
            }
        }
        Some(Protocol::Udp) => {
            if let Some(inbound) = udp_relay::demux(packet, &shared.pool) {
                let sender = UdpSender {
                    pool: shared.pool.clone(),
                    mtu: shared.pool.mtu(),
                    outbound: shared.outbound.clone(),
                };
                (shared.udp_receiver)(inbound.payload, inbound.endpoint, sender);
            }
        }
        Some(Protocol::Icmp) => {
            if let Some(out) = icmp::respond(packet) {
                emit(shared, out);
            }
        }
        None => {}
    }
}

fn emit(shared: &Shared, buf: PooledBuffer) {
    let Ok(packet) = Ipv4Packet::new_checked(buf) else { return };
    for fragment in shared.fragmenter.fragment(packet) {
        if let Err(TrySendError::Full(_)) = shared.outbound.try_send(fragment) {
            trace!("outbound queue full, dropping fragment");
        }
    }
}
