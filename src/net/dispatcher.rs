//! The per-worker I/O thread.
//!
//! One dispatcher owns every connection of its group. Each loop iteration
//! moves frames queued by emitters onto the wire (tracking partial writes)
//! and accumulates inbound bytes into whole frames for the multiplexer.
//! All sockets run in nonblocking mode; the loop sleeps briefly when neither
//! direction makes progress.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, trace};

use super::frame::{FrameHeader, FrameKind, HEADER_BYTES};
use super::{NetGroup, Stream};
use crate::buffer::BinaryBuffer;
use crate::channel::Multiplexer;
use crate::error::{Error, Result};

/// Encoded frames addressed to a destination rank.
pub(crate) type FrameSender = Sender<(usize, Vec<u8>)>;
pub(crate) type FrameReceiver = Receiver<(usize, Vec<u8>)>;

/// Outbound frames the dispatcher accepts before emitters block on it.
pub(crate) const SEND_QUEUE_DEPTH: usize = 64;

/// Accumulates bytes from a nonblocking stream into whole frames.
///
/// The read pattern is fixed: fill the 20-byte header, decode it, fill the
/// payload it announces, deliver, repeat.
struct FrameAccumulator {
    header: [u8; HEADER_BYTES],
    header_filled: usize,
    pending: Option<FrameHeader>,
    payload: Vec<u8>,
    payload_filled: usize,
}

enum ReadEvent {
    /// One whole frame.
    Frame(FrameHeader, Vec<u8>),
    /// The socket has no more bytes for now.
    NotReady,
    /// Clean end of stream at a frame boundary.
    Closed,
}

impl FrameAccumulator {
    fn new() -> Self {
        FrameAccumulator {
            header: [0; HEADER_BYTES],
            header_filled: 0,
            pending: None,
            payload: Vec::new(),
            payload_filled: 0,
        }
    }

    fn poll<S: Read>(&mut self, stream: &mut S) -> Result<ReadEvent> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                while self.header_filled < HEADER_BYTES {
                    match stream.read(&mut self.header[self.header_filled..]) {
                        Ok(0) if self.header_filled == 0 => return Ok(ReadEvent::Closed),
                        Ok(0) => {
                            return Err(Error::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed inside a frame header",
                            )))
                        }
                        Ok(n) => self.header_filled += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(ReadEvent::NotReady)
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(Error::Io(e)),
                    }
                }
                let header = FrameHeader::read_from(&self.header)?;
                self.header_filled = 0;
                self.payload.resize(header.length as usize, 0);
                self.payload_filled = 0;
                self.pending = Some(header);
                header
            }
        };

        while self.payload_filled < self.payload.len() {
            match stream.read(&mut self.payload[self.payload_filled..]) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a frame payload",
                    )))
                }
                Ok(n) => self.payload_filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadEvent::NotReady)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        self.pending = None;
        let payload = std::mem::take(&mut self.payload);
        self.payload_filled = 0;
        Ok(ReadEvent::Frame(header, payload))
    }
}

struct Connection<S: Stream> {
    rank: usize,
    stream: S,
    inbox: FrameAccumulator,
    outbox: VecDeque<Vec<u8>>,
    /// Bytes of `outbox.front()` already on the wire.
    written: usize,
    read_open: bool,
    write_open: bool,
}

/// Handle to the I/O thread. Dropping it flushes queued frames, write-shuts
/// every connection and joins the thread.
pub struct Dispatcher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn spawn<S: Stream>(
        group: NetGroup<S>,
        mux: Arc<Multiplexer>,
        outbound: FrameReceiver,
    ) -> Dispatcher {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let my_rank = group.my_rank();
        let handle = thread::Builder::new()
            .name(format!("dispatcher-{my_rank}"))
            .spawn(move || run(group, mux, outbound, flag))
            .expect("failed to spawn dispatcher thread");
        Dispatcher { shutdown, handle: Some(handle) }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<S: Stream>(
    group: NetGroup<S>,
    mux: Arc<Multiplexer>,
    outbound: FrameReceiver,
    shutdown: Arc<AtomicBool>,
) {
    let my_rank = group.my_rank();
    let mut connections: Vec<Option<Connection<S>>> = group
        .into_connections()
        .into_iter()
        .enumerate()
        .map(|(rank, stream)| {
            stream.and_then(|stream| match stream.set_nonblocking(true) {
                Ok(()) => Some(Connection {
                    rank,
                    stream,
                    inbox: FrameAccumulator::new(),
                    outbox: VecDeque::new(),
                    written: 0,
                    read_open: true,
                    write_open: true,
                }),
                Err(e) => {
                    error!(rank, error = %e, "failed to enter nonblocking mode");
                    mux.on_peer_lost(rank);
                    None
                }
            })
        })
        .collect();

    let mut last_expire = Instant::now();

    loop {
        let mut progressed = false;

        // Accept frames queued by emitters.
        loop {
            match outbound.try_recv() {
                Ok((dst, frame)) => {
                    progressed = true;
                    debug_assert_ne!(dst, my_rank, "self traffic must use the loopback path");
                    match connections.get_mut(dst).and_then(|c| c.as_mut()) {
                        Some(conn) if conn.write_open => conn.outbox.push_back(frame),
                        _ => error!(dst, "dropping frame for a dead connection"),
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        for conn in connections.iter_mut().flatten() {
            if conn.write_open {
                progressed |= pump_writes(conn, &mux);
            }
            if conn.read_open {
                progressed |= pump_reads(conn, &mux);
            }
        }

        if last_expire.elapsed() > Duration::from_secs(1) {
            mux.expire_pending();
            last_expire = Instant::now();
        }

        if shutdown.load(Ordering::Acquire)
            && outbound.is_empty()
            && connections.iter().flatten().all(|c| c.outbox.is_empty())
        {
            break;
        }

        if !progressed {
            thread::sleep(Duration::from_micros(100));
        }
    }

    // Everything queued is on the wire; peers read EOF after our last frame.
    for conn in connections.iter_mut().flatten() {
        let _ = conn.stream.shutdown(Shutdown::Write);
    }
    debug!(my_rank, "dispatcher stopped");
}

fn pump_writes<S: Stream>(conn: &mut Connection<S>, mux: &Multiplexer) -> bool {
    let mut progressed = false;
    while let Some(front) = conn.outbox.front() {
        let len = front.len();
        match conn.stream.write(&front[conn.written..]) {
            Ok(0) => {
                fail_connection(conn, mux, "zero-length write");
                break;
            }
            Ok(n) => {
                progressed = true;
                conn.written += n;
                if conn.written == len {
                    conn.outbox.pop_front();
                    conn.written = 0;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                fail_connection(conn, mux, &e.to_string());
                break;
            }
        }
    }
    progressed
}

fn pump_reads<S: Stream>(conn: &mut Connection<S>, mux: &Multiplexer) -> bool {
    let mut progressed = false;
    loop {
        match conn.inbox.poll(&mut conn.stream) {
            Ok(ReadEvent::Frame(header, payload)) => {
                progressed = true;
                if let Err(e) = deliver(mux, conn.rank, header, payload) {
                    fail_connection(conn, mux, &e.to_string());
                    break;
                }
            }
            Ok(ReadEvent::NotReady) => break,
            Ok(ReadEvent::Closed) => {
                // Clean EOF. Channels this peer closed are unaffected; any
                // still expecting it fail inside on_peer_lost.
                debug!(rank = conn.rank, "peer closed its stream");
                conn.read_open = false;
                mux.on_peer_lost(conn.rank);
                break;
            }
            Err(e) => {
                fail_connection(conn, mux, &e.to_string());
                break;
            }
        }
    }
    progressed
}

fn deliver(
    mux: &Multiplexer,
    rank: usize,
    header: FrameHeader,
    payload: Vec<u8>,
) -> Result<()> {
    let src = header.src_rank as usize;
    if src != rank {
        return Err(Error::Protocol(format!(
            "frame claims rank {src} on the connection to rank {rank}"
        )));
    }
    trace!(channel = header.channel, src, kind = ?header.kind, "frame received");
    match header.kind {
        FrameKind::Data => mux.on_data(
            header.channel,
            src,
            BinaryBuffer::from(payload),
            header.elements as usize,
        ),
        FrameKind::Close => mux.on_close(header.channel, src),
    }
}

fn fail_connection<S: Stream>(conn: &mut Connection<S>, mux: &Multiplexer, reason: &str) {
    error!(rank = conn.rank, reason, "connection failed");
    conn.read_open = false;
    conn.write_open = false;
    conn.outbox.clear();
    conn.written = 0;
    let _ = conn.stream.shutdown(Shutdown::Both);
    mux.on_peer_lost(conn.rank);
}
