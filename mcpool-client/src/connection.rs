//! # Backend Connection
//!
//! Purpose: Own one TCP transport to one backend host and expose the framing
//! primitives the protocol layer builds on: CRLF lines, exact byte counts,
//! and buffered writes.
//!
//! ## Design Principles
//! 1. **Host Tagging**: Every connection carries its `host:port`, so the pool
//!    can file it back into the right per-host set without a lookup table.
//! 2. **Shared Close Switch**: A [`CloseHandle`] shares the socket with the
//!    pool, which lets maintenance tear down a connection a caller still holds.
//!    The holder notices on its next read or write.
//! 3. **Bounded Connect**: Every resolved address shares one connect
//!    deadline. Nothing is left running once the deadline passes.
//! 4. **Buffer Reuse**: The line buffer lives on the connection.

use std::fmt;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{ConnError, ConnResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
pub type ConnectionId = u64;

/// Socket options applied when opening a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Zero means a plain blocking connect.
    pub connect_timeout: Duration,
    /// Read and write timeout; zero means none.
    pub io_timeout: Duration,
    pub no_delay: bool,
}

impl From<&PoolConfig> for ConnectOptions {
    fn from(config: &PoolConfig) -> Self {
        ConnectOptions {
            connect_timeout: config.connect_timeout,
            io_timeout: config.socket_timeout,
            no_delay: config.tcp_no_delay,
        }
    }
}

/// Close switch shared between a connection and the pool's busy set.
#[derive(Debug)]
pub(crate) struct CloseHandle {
    id: ConnectionId,
    open: AtomicBool,
    stream: TcpStream,
}

impl CloseHandle {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Shuts the socket down in both directions. Returns false if it was
    /// already closed.
    ///
    /// Shutdown errors are logged and swallowed: the peer may already have
    /// reset the connection.
    pub(crate) fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!(id = self.id, error = %err, "socket shutdown failed");
        }
        true
    }
}

struct Transport {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

/// A live transport to one backend host.
pub struct Connection {
    id: ConnectionId,
    host: Arc<str>,
    created_at: Instant,
    last_active: Instant,
    transport: Option<Transport>,
    handle: Arc<CloseHandle>,
    line_buf: Vec<u8>,
}

impl Connection {
    /// Connects to `host` (`host:port`), giving up after the connect timeout.
    pub fn open(host: impl Into<Arc<str>>, options: ConnectOptions) -> ConnResult<Self> {
        let host = host.into();
        let stream = connect_stream(&host, options.connect_timeout)?;

        let io_timeout = (!options.io_timeout.is_zero()).then_some(options.io_timeout);
        stream.set_read_timeout(io_timeout)?;
        stream.set_write_timeout(io_timeout)?;
        stream.set_nodelay(options.no_delay)?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(CloseHandle {
            id,
            open: AtomicBool::new(true),
            stream: stream.try_clone()?,
        });
        let writer = BufWriter::new(stream.try_clone()?);
        let now = Instant::now();

        debug!(id, host = %host, "connection opened");
        Ok(Connection {
            id,
            host,
            created_at: now,
            last_active: now,
            transport: Some(Transport {
                reader: BufReader::new(stream),
                writer,
            }),
            handle,
            line_buf: Vec::with_capacity(128),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The `host:port` this connection belongs to.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn handle(&self) -> &Arc<CloseHandle> {
        &self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time of the last successful read or write, or of the last return to
    /// the pool.
    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// True while neither side of the pool has closed the transport.
    ///
    /// Performs no I/O; a peer that silently went away is only noticed on
    /// the next read or write.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some() && self.handle.is_open()
    }

    /// Reads up to the next CRLF and returns the line without it.
    ///
    /// A bare LF does not end the line. If the stream ends mid-line the
    /// partial line is returned.
    pub fn read_line(&mut self) -> ConnResult<String> {
        let reader = reader_mut(&mut self.transport, &self.handle)?;
        read_crlf_line(reader, &mut self.line_buf)?;
        self.touch();
        Ok(String::from_utf8_lossy(&self.line_buf).into_owned())
    }

    /// Discards input through the next CRLF.
    pub fn clear_end_of_line(&mut self) -> ConnResult<()> {
        let reader = reader_mut(&mut self.transport, &self.handle)?;
        read_crlf_line(reader, &mut self.line_buf)?;
        self.line_buf.clear();
        self.touch();
        Ok(())
    }

    /// Reads exactly `len` bytes.
    pub fn read_exact(&mut self, len: usize) -> ConnResult<Bytes> {
        let reader = reader_mut(&mut self.transport, &self.handle)?;
        let mut buf = BytesMut::zeroed(len);
        let mut filled = 0;
        while filled < len {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(ConnError::UnexpectedEof {
                        expected: len,
                        received: filled,
                    })
                }
                Ok(read) => filled += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.touch();
        Ok(buf.freeze())
    }

    /// Buffers `bytes` for sending; call [`flush`](Self::flush) to send.
    pub fn write(&mut self, bytes: &[u8]) -> ConnResult<()> {
        writer_mut(&mut self.transport, &self.handle)?.write_all(bytes)?;
        self.touch();
        Ok(())
    }

    pub fn flush(&mut self) -> ConnResult<()> {
        writer_mut(&mut self.transport, &self.handle)?.flush()?;
        self.touch();
        Ok(())
    }

    /// Tears the transport down. Idempotent; never fails.
    ///
    /// Unflushed writes are discarded. To hand a healthy connection back for
    /// reuse, release it to the pool instead.
    pub fn close(&mut self) {
        let closed_here = self.handle.close();
        if self.transport.take().is_some() && closed_here {
            debug!(id = self.id, host = %self.host, "connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn reader_mut<'a>(
    transport: &'a mut Option<Transport>,
    handle: &CloseHandle,
) -> ConnResult<&'a mut BufReader<TcpStream>> {
    match transport {
        Some(transport) if handle.is_open() => Ok(&mut transport.reader),
        _ => Err(ConnError::ReadOnClosed),
    }
}

fn writer_mut<'a>(
    transport: &'a mut Option<Transport>,
    handle: &CloseHandle,
) -> ConnResult<&'a mut BufWriter<TcpStream>> {
    match transport {
        Some(transport) if handle.is_open() => Ok(&mut transport.writer),
        _ => Err(ConnError::WriteOnClosed),
    }
}

fn read_crlf_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ConnResult<()> {
    buf.clear();
    loop {
        let read = reader.read_until(b'\n', buf)?;
        if read == 0 {
            break;
        }
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            return Ok(());
        }
    }

    if buf.is_empty() {
        return Err(ConnError::StreamEmpty);
    }
    Ok(())
}

fn connect_stream(host: &str, timeout: Duration) -> ConnResult<TcpStream> {
    if timeout.is_zero() {
        return connect_any(host).map_err(|err| connect_failed(host, err));
    }

    let deadline = Instant::now() + timeout;
    let addrs: Vec<SocketAddr> = host
        .to_socket_addrs()
        .map_err(|err| connect_failed(host, err))?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(err) if Instant::now() < deadline => Err(connect_failed(host, err)),
        Some(_) => Err(ConnError::ConnectFailed {
            host: host.to_string(),
            reason: format!("timed out after {}ms", timeout.as_millis()),
        }),
        None => Err(connect_failed(host, no_addresses())),
    }
}

fn connect_any(host: &str) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = host.to_socket_addrs()?.collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(no_addresses))
}

fn no_addresses() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "host resolved to no addresses")
}

fn connect_failed(host: &str, err: io::Error) -> ConnError {
    ConnError::ConnectFailed {
        host: host.to_string(),
        reason: err.to_string(),
    }
}
