//! Point-to-point connections between the workers of a group.

pub mod dispatcher;
pub mod frame;

use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, LittleEndian};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// An abstraction over full-duplex byte streams.
pub trait Stream: io::Read + io::Write + Send + 'static {
    /// Moves this stream into or out of nonblocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Shuts down the read, write, or both halves of this connection.
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }
}

#[cfg(unix)]
impl Stream for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        UnixStream::shutdown(self, how)
    }
}

/// The point-to-point connections of one worker to every peer in its group.
///
/// `connections[r]` is the stream to rank `r`; the entry at the worker's own
/// rank is absent.
pub struct NetGroup<S: Stream> {
    my_rank: usize,
    connections: Vec<Option<S>>,
}

impl<S: Stream> NetGroup<S> {
    /// Assembles a group from an already-connected mesh.
    pub fn new(my_rank: usize, connections: Vec<Option<S>>) -> Self {
        assert!(my_rank < connections.len());
        assert!(connections.len() <= u16::MAX as usize);
        assert!(connections[my_rank].is_none());
        NetGroup { my_rank, connections }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// Number of workers in the group, this one included.
    pub fn peers(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn into_connections(self) -> Vec<Option<S>> {
        self.connections
    }
}

/// Runs `body` once per rank of a synthetic in-process group.
///
/// Connects every pair `{i, j}` with a socket pair, spawns one thread per
/// rank and joins them, returning the bodies' results in rank order. A
/// panicking body panics the join.
#[cfg(unix)]
pub fn execute_local_mock<F, R>(peers: usize, body: F) -> Result<Vec<R>>
where
    F: Fn(NetGroup<UnixStream>) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let mut meshes: Vec<Vec<Option<UnixStream>>> = (0..peers)
        .map(|_| (0..peers).map(|_| None).collect())
        .collect();

    for i in 0..peers {
        for j in (i + 1)..peers {
            let (a, b) = UnixStream::pair()?;
            meshes[i][j] = Some(a);
            meshes[j][i] = Some(b);
        }
    }

    let body = Arc::new(body);
    let handles: Vec<_> = meshes
        .into_iter()
        .enumerate()
        .map(|(rank, connections)| {
            let body = Arc::clone(&body);
            thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || body(NetGroup::new(rank, connections)))
                .map_err(Error::Io)
        })
        .collect::<Result<_>>()?;

    let mut results = Vec::with_capacity(peers);
    for handle in handles {
        results.push(handle.join().expect("worker thread panicked"));
    }
    Ok(results)
}

/// Connects a TCP mesh from a list of worker addresses.
///
/// This worker dials every rank below it and accepts one connection from
/// every rank above it, each opened with a little-endian rank handshake.
/// Dialing retries until the peer's listener is up.
pub fn create_sockets(addresses: &[String], my_rank: usize) -> Result<NetGroup<TcpStream>> {
    assert!(my_rank < addresses.len());

    let listener = TcpListener::bind(addresses[my_rank].as_str())?;

    let mut connections: Vec<Option<TcpStream>> =
        (0..addresses.len()).map(|_| None).collect();

    for (rank, address) in addresses.iter().enumerate().take(my_rank) {
        let stream = connect_with_retry(address, my_rank)?;
        debug!(my_rank, rank, "connected to peer");
        connections[rank] = Some(stream);
    }

    for _ in (my_rank + 1)..addresses.len() {
        let (mut stream, _) = listener.accept()?;
        stream.set_nodelay(true)?;
        let rank = stream.read_u64::<LittleEndian>()? as usize;
        if rank <= my_rank || rank >= addresses.len() || connections[rank].is_some() {
            return Err(Error::Protocol(format!("unexpected handshake from rank {rank}")));
        }
        debug!(my_rank, rank, "accepted peer");
        connections[rank] = Some(stream);
    }

    Ok(NetGroup::new(my_rank, connections))
}

fn connect_with_retry(address: &str, my_rank: usize) -> Result<TcpStream> {
    loop {
        match TcpStream::connect(address) {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                stream.write_u64::<LittleEndian>(my_rank as u64)?;
                return Ok(stream);
            }
            Err(error) => {
                warn!(address, %error, "connect failed, retrying");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[cfg(unix)]
    #[test]
    fn local_mock_connects_every_pair() {
        let results = execute_local_mock(3, |group| {
            let rank = group.my_rank();
            let mut connections = group.into_connections();
            // Say hello to every peer, then read every peer's hello.
            for (peer, conn) in connections.iter_mut().enumerate() {
                if let Some(conn) = conn {
                    conn.write_all(&[rank as u8]).unwrap();
                    let mut byte = [0u8; 1];
                    conn.read_exact(&mut byte).unwrap();
                    assert_eq!(byte[0] as usize, peer);
                }
            }
            rank
        })
        .unwrap();
        assert_eq!(results, vec![0, 1, 2]);
    }
}
