//! The inter-node transport.
//!
//! A fixed full mesh over TCP. Every node binds its listen address,
//! dials the peers whose address orders after its own, and accepts the
//! rest; a HELLO exchange identifies each connection. Per peer, a
//! writer thread drains an outbound channel and a reader thread decodes
//! envelopes into the dispatcher. Send or receive failure marks the
//! peer failed.
//!
//! Heartbeats run on a dedicated thread; a peer silent for longer than
//! the configured timeout is treated as crashed. With the chaos monkey
//! enabled, this node picks a seeded random death time and, once it
//! fires, falls silent and drops its connections.

use crate::comm::envelope::{self, Msg};
use crate::config::RuntimeConfig;
use crate::debug::DebugLevel;
use crate::debug_at;
use crate::error::{Error, ErrorKind, Result};
use crate::node::NodeId;
use crate::sched::RtState;
use crate::util::XorShift64;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

/// Error type for transport operations.
#[derive(Debug, ThisError)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No connection to the named peer.
    #[error("peer {0} not connected")]
    Unknown(NodeId),

    /// The writer for the named peer has shut down.
    #[error("channel to {0} closed")]
    Closed(NodeId),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::new(ErrorKind::PeerUnreachable)
            .with_context("transport")
            .with_source(e)
    }
}

struct Peer {
    tx: mpsc::Sender<Msg>,
    stream: TcpStream,
    last_seen: Arc<Mutex<Instant>>,
    failed: Arc<AtomicBool>,
}

/// The connection table and heartbeat state of one node.
pub(crate) struct Comm {
    peers: RwLock<HashMap<NodeId, Peer>>,
    hb_seq: AtomicU64,
    chaos_dead: AtomicBool,
}

impl Comm {
    /// Establishes the full mesh and starts the per-peer threads.
    ///
    /// Blocks until every configured peer is connected (or the
    /// handshake window closes).
    pub(crate) fn start(rt: &Arc<RtState>, config: &RuntimeConfig) -> Result<Arc<Self>> {
        let me = NodeId::new(config.listen.clone());
        let listener = TcpListener::bind(config.listen.as_str())
            .map_err(|e| Error::from(TransportError::Io(e)).with_context("bind"))?;

        let mut expect_in = Vec::new();
        let mut dial_out = Vec::new();
        for p in &config.peers {
            let peer = NodeId::new(p.clone());
            if peer.as_str() < me.as_str() {
                expect_in.push(peer);
            } else {
                dial_out.push(peer);
            }
        }

        // Accept inbound connections on a helper thread while dialing
        // outbound, so neither side deadlocks on connection order.
        let accept_handle = {
            let expected = expect_in.len();
            let me = me.clone();
            thread::Builder::new()
                .name("parsteal-accept".to_owned())
                .spawn(move || accept_peers(&listener, &me, expected))
                .map_err(|e| Error::from(TransportError::Io(e)))?
        };

        let mut conns: Vec<(NodeId, TcpStream)> = Vec::new();
        for peer in &dial_out {
            conns.push((peer.clone(), dial(&me, peer)?));
        }
        let accepted = accept_handle
            .join()
            .map_err(|_| Error::new(ErrorKind::Internal).with_context("accept thread panicked"))??;
        conns.extend(accepted);

        let comm = Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            hb_seq: AtomicU64::new(1),
            chaos_dead: AtomicBool::new(false),
        });

        for (peer, stream) in conns {
            comm.attach(rt, peer, stream)?;
        }
        comm.start_heartbeats(rt, config);
        Ok(comm)
    }

    /// Registers a connected peer and spawns its reader and writer.
    fn attach(self: &Arc<Self>, rt: &Arc<RtState>, peer: NodeId, stream: TcpStream) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Msg>();
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let failed = Arc::new(AtomicBool::new(false));
        let write_stream = stream
            .try_clone()
            .map_err(|e| Error::from(TransportError::Io(e)))?;
        self.peers.write().insert(
            peer.clone(),
            Peer {
                tx,
                stream: stream
                    .try_clone()
                    .map_err(|e| Error::from(TransportError::Io(e)))?,
                last_seen: Arc::clone(&last_seen),
                failed: Arc::clone(&failed),
            },
        );

        {
            let rt = Arc::clone(rt);
            let comm = Arc::clone(self);
            let peer = peer.clone();
            let failed = Arc::clone(&failed);
            thread::Builder::new()
                .name(format!("parsteal-writer-{peer}"))
                .spawn(move || {
                    writer_loop(&rt, &comm, &peer, write_stream, &rx, &failed);
                })
                .map_err(|e| Error::from(TransportError::Io(e)))?;
        }
        {
            let rt = Arc::clone(rt);
            let comm = Arc::clone(self);
            thread::Builder::new()
                .name(format!("parsteal-reader-{peer}"))
                .spawn(move || {
                    reader_loop(&rt, &comm, &peer, stream, &last_seen, &failed);
                })
                .map_err(|e| Error::from(TransportError::Io(e)))?;
        }
        Ok(())
    }

    /// Queues a message to a peer.
    pub(crate) fn send(&self, rt: &Arc<RtState>, to: &NodeId, msg: Msg) -> Result<()> {
        let peers = self.peers.read();
        let peer = peers
            .get(to)
            .ok_or_else(|| Error::from(TransportError::Unknown(to.clone())))?;
        if peer.failed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::PeerUnreachable)
                .with_context(format!("peer {to} already failed")));
        }
        if peer.tx.send(msg).is_err() {
            peer.failed.store(true, Ordering::SeqCst);
            drop(peers);
            rt.peer_failed(to);
            return Err(Error::from(TransportError::Closed(to.clone())));
        }
        Ok(())
    }

    /// Best-effort send to every connected peer.
    pub(crate) fn broadcast(&self, _rt: &Arc<RtState>, msg: Msg) {
        for peer in self.peers.read().values() {
            if !peer.failed.load(Ordering::SeqCst) {
                let _ = peer.tx.send(msg.clone());
            }
        }
    }

    fn start_heartbeats(self: &Arc<Self>, rt: &Arc<RtState>, config: &RuntimeConfig) {
        let comm = Arc::clone(self);
        let rt = Arc::clone(rt);
        let interval = config.heartbeat_interval;
        let timeout = config.heartbeat_timeout;
        let chaos_death = config.chaos_monkey.then(|| {
            let mut rng = if config.chaos_seed == 0 {
                XorShift64::from_entropy()
            } else {
                XorShift64::new(config.chaos_seed)
            };
            Instant::now() + Duration::from_millis(rng.next_range(2_000, 30_000))
        });
        let _ = thread::Builder::new()
            .name("parsteal-heartbeat".to_owned())
            .spawn(move || {
                while !rt.is_shutdown() {
                    if let Some(death) = chaos_death {
                        if Instant::now() >= death && !comm.chaos_dead.swap(true, Ordering::SeqCst)
                        {
                            debug_at!(DebugLevel::Failure, "chaos monkey: going silent");
                            comm.close_all();
                        }
                    }
                    if !comm.chaos_dead.load(Ordering::SeqCst) {
                        let seq = comm.hb_seq.fetch_add(1, Ordering::Relaxed);
                        comm.broadcast(&rt, Msg::Heartbeat { seq });
                    }
                    // Check peer liveness.
                    let stale: Vec<NodeId> = {
                        let peers = comm.peers.read();
                        peers
                            .iter()
                            .filter(|(_, p)| {
                                !p.failed.load(Ordering::SeqCst)
                                    && p.last_seen.lock().elapsed() > timeout
                            })
                            .map(|(n, _)| n.clone())
                            .collect()
                    };
                    for peer in stale {
                        comm.mark_failed(&peer);
                        rt.peer_failed(&peer);
                    }
                    thread::sleep(interval);
                }
            });
    }

    fn mark_failed(&self, peer: &NodeId) {
        if let Some(p) = self.peers.read().get(peer) {
            p.failed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn is_chaos_dead(&self) -> bool {
        self.chaos_dead.load(Ordering::SeqCst)
    }

    /// Closes every connection, unblocking the reader threads.
    pub(crate) fn close_all(&self) {
        for peer in self.peers.read().values() {
            let _ = peer.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Dials a peer, retrying while it may still be binding, and performs
/// the HELLO exchange.
fn dial(me: &NodeId, peer: &NodeId) -> Result<TcpStream> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut stream = loop {
        match TcpStream::connect(peer.as_str()) {
            Ok(s) => break s,
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(Error::from(TransportError::Io(e))
                        .with_context(format!("dialing {peer}")));
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    };
    stream
        .set_nodelay(true)
        .map_err(|e| Error::from(TransportError::Io(e)))?;
    envelope::write_frame(&mut stream, &Msg::Hello { node: me.clone() })
        .map_err(|e| Error::from(TransportError::Io(e)))?;
    match envelope::read_frame(&mut stream)? {
        Msg::Hello { node } if &node == peer => Ok(stream),
        Msg::Hello { node } => Err(Error::from(TransportError::Handshake(format!(
            "dialed {peer}, answered by {node}"
        )))),
        other => Err(Error::from(TransportError::Handshake(format!(
            "expected HELLO, got {}",
            other.describe()
        )))),
    }
}

/// Accepts `expected` inbound connections and completes their HELLO
/// exchanges. Gives up when the handshake window closes.
fn accept_peers(
    listener: &TcpListener,
    me: &NodeId,
    expected: usize,
) -> Result<Vec<(NodeId, TcpStream)>> {
    let deadline = Instant::now() + Duration::from_secs(30);
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::from(TransportError::Io(e)))?;
    let mut conns = Vec::with_capacity(expected);
    while conns.len() < expected {
        let (mut stream, _addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::from(TransportError::Handshake(format!(
                        "only {} of {expected} peers connected",
                        conns.len()
                    ))));
                }
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(e) => return Err(Error::from(TransportError::Io(e)).with_context("accept")),
        };
        stream
            .set_nonblocking(false)
            .map_err(|e| Error::from(TransportError::Io(e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::from(TransportError::Io(e)))?;
        match envelope::read_frame(&mut stream)? {
            Msg::Hello { node } => {
                envelope::write_frame(&mut stream, &Msg::Hello { node: me.clone() })
                    .map_err(|e| Error::from(TransportError::Io(e)))?;
                conns.push((node, stream));
            }
            other => {
                return Err(Error::from(TransportError::Handshake(format!(
                    "expected HELLO, got {}",
                    other.describe()
                ))))
            }
        }
    }
    Ok(conns)
}

fn writer_loop(
    rt: &Arc<RtState>,
    comm: &Arc<Comm>,
    peer: &NodeId,
    mut stream: TcpStream,
    rx: &mpsc::Receiver<Msg>,
    failed: &AtomicBool,
) {
    loop {
        if rt.is_shutdown() || comm.is_chaos_dead() {
            // Flush whatever is still queued (the SHUTDOWN broadcast
            // in particular) before exiting.
            while let Ok(msg) = rx.try_recv() {
                if envelope::write_frame(&mut stream, &msg).is_err() {
                    break;
                }
            }
            return;
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(msg) => {
                if let Err(e) = envelope::write_frame(&mut stream, &msg) {
                    if !rt.is_shutdown() && !failed.swap(true, Ordering::SeqCst) {
                        debug_at!(DebugLevel::Failure, "write to {peer} failed: {e}");
                        rt.peer_failed(peer);
                    }
                    return;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn reader_loop(
    rt: &Arc<RtState>,
    comm: &Arc<Comm>,
    peer: &NodeId,
    mut stream: TcpStream,
    last_seen: &Arc<Mutex<Instant>>,
    failed: &AtomicBool,
) {
    // Reads block; shutdown and chaos death unblock them by closing
    // the socket, so frames are never torn by a mid-read timeout.
    loop {
        match envelope::read_frame(&mut stream) {
            Ok(msg) => {
                *last_seen.lock() = Instant::now();
                crate::comm::deliver(rt, peer, msg);
            }
            Err(e) => {
                if !rt.is_shutdown()
                    && !comm.is_chaos_dead()
                    && !failed.swap(true, Ordering::SeqCst)
                {
                    debug_at!(DebugLevel::Failure, "read from {peer} failed: {e}");
                    rt.peer_failed(peer);
                }
                return;
            }
        }
    }
}
