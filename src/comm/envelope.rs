//! Message envelopes and their wire form.
//!
//! Framing is big-endian: a 4-byte length prefix, a 1-byte tag, then a
//! tag-specific payload. Node identifiers encode as `(u16 length,
//! utf-8 bytes)`. A task closure encodes as `(u16 label length, label
//! bytes, supervision flag byte, payload bytes)` and is always the last
//! field of its envelope, so its payload runs to the end of the frame.
//!
//! | Tag | Payload | Meaning |
//! |-----|---------|---------|
//! | FISH | fisher | request a spark |
//! | SCHEDULE | fisher, spark closure | deliver a stolen spark |
//! | NOWORK | fisher | no spark to give |
//! | EXECUTE | closure | run this task (push) |
//! | RPUT | slot, value bytes | resolve a globalised cell |
//! | QUIESCE | counters | termination probe |
//! | SHUTDOWN | — | orderly exit |
//! | HEARTBEAT | seq | liveness for fault detection |
//! | HELLO | node | connection handshake |
//! | NODES | node list | main publishes the cluster |
//!
//! Truncated or malformed envelopes are
//! [`ErrorKind::WireDecode`](crate::ErrorKind::WireDecode) and fail the
//! connection they arrived on.

use crate::closure::TaskClosure;
use crate::error::{Error, ErrorKind, Result};
use crate::node::NodeId;
use crate::registry::Label;
use std::io::{Read, Write};

/// Largest accepted frame body.
pub(crate) const MAX_FRAME: usize = 64 * 1024 * 1024;

const TAG_FISH: u8 = 1;
const TAG_SCHEDULE: u8 = 2;
const TAG_NOWORK: u8 = 3;
const TAG_EXECUTE: u8 = 4;
const TAG_RPUT: u8 = 5;
const TAG_QUIESCE: u8 = 6;
const TAG_SHUTDOWN: u8 = 7;
const TAG_HEARTBEAT: u8 = 8;
const TAG_HELLO: u8 = 9;
const TAG_NODES: u8 = 10;

/// Counters carried by a termination probe around the node ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QuiesceProbe {
    /// Work-bearing messages sent, summed over visited nodes.
    pub(crate) sent: u64,
    /// Work-bearing messages received, summed over visited nodes.
    pub(crate) received: u64,
    /// True while every visited node was idle.
    pub(crate) all_idle: bool,
}

/// A scheduling message between two nodes.
#[derive(Debug, Clone)]
pub(crate) enum Msg {
    /// A fisher requests one spark.
    Fish {
        /// The requesting node.
        fisher: NodeId,
    },
    /// A victim delivers one stolen spark.
    Schedule {
        /// The requesting node (echoed).
        fisher: NodeId,
        /// The stolen spark.
        spark: TaskClosure,
    },
    /// The victim had no spark to give.
    NoWork {
        /// The requesting node (echoed).
        fisher: NodeId,
    },
    /// Eager placement: the target forks this task.
    Execute {
        /// The pushed task.
        task: TaskClosure,
    },
    /// Resolve a globalised cell on the receiving node.
    RPut {
        /// Slot in the owner's table.
        slot: u64,
        /// Serialized value.
        bytes: Vec<u8>,
    },
    /// Termination probe.
    Quiesce {
        /// Accumulated counters.
        probe: QuiesceProbe,
    },
    /// Orderly exit.
    Shutdown,
    /// Liveness signal.
    Heartbeat {
        /// Monotonic per-sender sequence number.
        seq: u64,
    },
    /// Handshake: identifies the dialing node.
    Hello {
        /// The dialer.
        node: NodeId,
    },
    /// The main node publishes the cluster, main first.
    Nodes {
        /// All nodes, main first.
        nodes: Vec<NodeId>,
    },
}

impl Msg {
    /// True for work-bearing messages, which the quiescence counters
    /// track. Control traffic (probes, heartbeats, handshake) is not
    /// counted, so the counters stabilise once work drains.
    pub(crate) fn counted(&self) -> bool {
        matches!(
            self,
            Self::Fish { .. }
                | Self::Schedule { .. }
                | Self::NoWork { .. }
                | Self::Execute { .. }
                | Self::RPut { .. }
        )
    }

    /// Short form for debug emission.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Fish { fisher } => format!("FISH({fisher})"),
            Self::Schedule { fisher, spark } => {
                format!("SCHEDULE({fisher}, {})", spark.label())
            }
            Self::NoWork { fisher } => format!("NOWORK({fisher})"),
            Self::Execute { task } => format!("EXECUTE({})", task.label()),
            Self::RPut { slot, bytes } => format!("RPUT({slot}, {} bytes)", bytes.len()),
            Self::Quiesce { probe } => format!(
                "QUIESCE(sent={}, received={}, idle={})",
                probe.sent, probe.received, probe.all_idle
            ),
            Self::Shutdown => "SHUTDOWN".to_owned(),
            Self::Heartbeat { seq } => format!("HEARTBEAT({seq})"),
            Self::Hello { node } => format!("HELLO({node})"),
            Self::Nodes { nodes } => format!("NODES({} nodes)", nodes.len()),
        }
    }
}

// === Encoding ===

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_node(out: &mut Vec<u8>, node: &NodeId) {
    let bytes = node.as_str().as_bytes();
    put_u16(out, bytes.len() as u16);
    out.extend_from_slice(bytes);
}

fn put_task(out: &mut Vec<u8>, task: &TaskClosure) {
    let (label, payload, supervised) = task.wire_parts();
    let label_bytes = label.as_str().as_bytes();
    put_u16(out, label_bytes.len() as u16);
    out.extend_from_slice(label_bytes);
    out.push(u8::from(supervised));
    out.extend_from_slice(payload);
}

/// Encodes a message body (tag and payload, without the length
/// prefix).
pub(crate) fn encode_body(msg: &Msg) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        Msg::Fish { fisher } => {
            out.push(TAG_FISH);
            put_node(&mut out, fisher);
        }
        Msg::Schedule { fisher, spark } => {
            out.push(TAG_SCHEDULE);
            put_node(&mut out, fisher);
            put_task(&mut out, spark);
        }
        Msg::NoWork { fisher } => {
            out.push(TAG_NOWORK);
            put_node(&mut out, fisher);
        }
        Msg::Execute { task } => {
            out.push(TAG_EXECUTE);
            put_task(&mut out, task);
        }
        Msg::RPut { slot, bytes } => {
            out.push(TAG_RPUT);
            put_u64(&mut out, *slot);
            out.extend_from_slice(bytes);
        }
        Msg::Quiesce { probe } => {
            out.push(TAG_QUIESCE);
            put_u64(&mut out, probe.sent);
            put_u64(&mut out, probe.received);
            out.push(u8::from(probe.all_idle));
        }
        Msg::Shutdown => out.push(TAG_SHUTDOWN),
        Msg::Heartbeat { seq } => {
            out.push(TAG_HEARTBEAT);
            put_u64(&mut out, *seq);
        }
        Msg::Hello { node } => {
            out.push(TAG_HELLO);
            put_node(&mut out, node);
        }
        Msg::Nodes { nodes } => {
            out.push(TAG_NODES);
            put_u16(&mut out, nodes.len() as u16);
            for n in nodes {
                put_node(&mut out, n);
            }
        }
    }
    out
}

// === Decoding ===

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let s = &self.buf[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(truncated()),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn node(&mut self) -> Result<NodeId> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| Error::new(ErrorKind::WireDecode).with_source(e))?;
        Ok(NodeId::new(s))
    }

    fn task(&mut self) -> Result<TaskClosure> {
        let len = self.u16()? as usize;
        let label = std::str::from_utf8(self.take(len)?)
            .map_err(|e| Error::new(ErrorKind::WireDecode).with_source(e))?
            .to_owned();
        let supervised = self.u8()? != 0;
        let payload = self.rest().to_vec();
        Ok(TaskClosure::from_wire_parts(
            Label::new(label),
            payload,
            supervised,
        ))
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

fn truncated() -> Error {
    Error::new(ErrorKind::WireDecode).with_context("truncated envelope")
}

/// Decodes a message body (tag and payload, without the length
/// prefix).
pub(crate) fn decode_body(body: &[u8]) -> Result<Msg> {
    let mut c = Cursor::new(body);
    let tag = c.u8()?;
    let msg = match tag {
        TAG_FISH => Msg::Fish { fisher: c.node()? },
        TAG_SCHEDULE => Msg::Schedule {
            fisher: c.node()?,
            spark: c.task()?,
        },
        TAG_NOWORK => Msg::NoWork { fisher: c.node()? },
        TAG_EXECUTE => Msg::Execute { task: c.task()? },
        TAG_RPUT => Msg::RPut {
            slot: c.u64()?,
            bytes: c.rest().to_vec(),
        },
        TAG_QUIESCE => Msg::Quiesce {
            probe: QuiesceProbe {
                sent: c.u64()?,
                received: c.u64()?,
                all_idle: c.u8()? != 0,
            },
        },
        TAG_SHUTDOWN => Msg::Shutdown,
        TAG_HEARTBEAT => Msg::Heartbeat { seq: c.u64()? },
        TAG_HELLO => Msg::Hello { node: c.node()? },
        TAG_NODES => {
            let count = c.u16()? as usize;
            let mut nodes = Vec::with_capacity(count);
            for _ in 0..count {
                nodes.push(c.node()?);
            }
            Msg::Nodes { nodes }
        }
        other => {
            return Err(Error::new(ErrorKind::WireDecode)
                .with_context(format!("unknown envelope tag {other}")))
        }
    };
    Ok(msg)
}

/// Writes one framed message.
pub(crate) fn write_frame(w: &mut impl Write, msg: &Msg) -> std::io::Result<()> {
    let body = encode_body(msg);
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(&body)?;
    w.flush()
}

/// Reads one framed message.
pub(crate) fn read_frame(r: &mut impl Read) -> Result<Msg> {
    let mut len_bytes = [0_u8; 4];
    r.read_exact(&mut len_bytes)
        .map_err(|e| Error::new(ErrorKind::WireDecode).with_context("frame length").with_source(e))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(Error::new(ErrorKind::WireDecode)
            .with_context(format!("frame length {len} out of range")));
    }
    let mut body = vec![0_u8; len];
    r.read_exact(&mut body)
        .map_err(|e| Error::new(ErrorKind::WireDecode).with_context("frame body").with_source(e))?;
    decode_body(&body)
}
