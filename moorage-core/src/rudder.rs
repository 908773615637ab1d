//! Rudders: the OS I/O resources an agent drives.
//!
//! A [`Rudder`] is handed to the multiplexer once and never touched directly again.
//! Streams are split into a [`ReadSide`] and a [`WriteSide`]; an I/O task takes one
//! side out of its state, works on it, and gives it back inside its letter.
use std::{
    fmt,
    io::{self, Read, Write},
    net::SocketAddr,
    path::Path,
};

use bytes::Bytes;
use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{AsyncReadRent, AsyncWriteRent, OwnedReadHalf, OwnedWriteHalf, Split, Splitable},
    net::{ListenerOpts, TcpListener, TcpStream},
    BufResult,
};
use tracing::trace;

/// Identity of a rudder within one multiplexer. Never reused, so a late letter can
/// not be mistaken for one belonging to a newer rudder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RudderId(pub(crate) u64);

impl fmt::Display for RudderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

pub enum Rudder {
    Listener(Listener),
    Stream(AcceptedStream),
    /// Blocking handles such as files and child process pipes.
    Pipe {
        reader: Option<Box<dyn Read + Send>>,
        writer: Option<Box<dyn Write + Send>>,
    },
    /// Outbound socket whose connect has not been requested yet.
    Pending,
}

impl Rudder {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Rudder::Pipe {
            reader: Some(Box::new(reader)),
            writer: None,
        }
    }

    pub fn pipe(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Rudder::Pipe {
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rudder::Listener(_) => "listener",
            Rudder::Stream(_) => "stream",
            Rudder::Pipe { .. } => "pipe",
            Rudder::Pending => "pending",
        }
    }
}

pub enum ListenerBuilder {
    Tcp(SocketAddr, ListenerOpts),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl ListenerBuilder {
    #[cfg(unix)]
    pub fn bind_unix<P: AsRef<Path>>(path: P) -> io::Result<ListenerBuilder> {
        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(path.as_ref());
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        // The epoll driver expects non-blocking fds.
        if monoio::utils::is_legacy() {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::Unix(listener))
    }

    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> io::Result<ListenerBuilder> {
        Ok(Self::Tcp(addr, opts))
    }

    /// Binds one listener for the calling agent. TCP listeners rely on `SO_REUSEPORT`
    /// so every agent owns its own accept queue.
    pub fn build(&self) -> io::Result<Listener> {
        match self {
            ListenerBuilder::Tcp(addr, opts) => {
                TcpListener::bind_with_config(addr, opts).map(Listener::Tcp)
            }
            #[cfg(unix)]
            ListenerBuilder::Unix(listener) => {
                let sys_listener = listener.try_clone()?;
                monoio::net::UnixListener::from_std(sys_listener).map(Listener::Unix)
            }
        }
    }
}

/// Unified listener.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
}

impl Listener {
    pub async fn accept(&self) -> io::Result<(AcceptedStream, AcceptedAddr)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                Ok((AcceptedStream::Tcp(stream), AcceptedAddr::Tcp(addr)))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, addr) = l.accept().await?;
                Ok((AcceptedStream::Unix(stream), AcceptedAddr::Unix(addr)))
            }
        }
    }
}

pub enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

unsafe impl Split for AcceptedStream {}

#[derive(Debug, Clone)]
pub enum AcceptedAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(monoio::net::unix::SocketAddr),
}

impl From<SocketAddr> for AcceptedAddr {
    fn from(value: SocketAddr) -> Self {
        Self::Tcp(value)
    }
}

#[cfg(unix)]
impl From<monoio::net::unix::SocketAddr> for AcceptedAddr {
    fn from(value: monoio::net::unix::SocketAddr) -> Self {
        Self::Unix(value)
    }
}

impl fmt::Display for AcceptedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptedAddr::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            AcceptedAddr::Unix(addr) => write!(f, "{addr:?}"),
        }
    }
}

impl AsyncReadRent for AcceptedStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.read(buf).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.read(buf).await,
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.readv(buf).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for AcceptedStream {
    #[inline]
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.write(buf).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.write(buf).await,
        }
    }

    #[inline]
    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.writev(buf_vec).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.writev(buf_vec).await,
        }
    }

    #[inline]
    async fn flush(&mut self) -> io::Result<()> {
        match self {
            AcceptedStream::Tcp(inner) => inner.flush().await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.flush().await,
        }
    }

    #[inline]
    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            AcceptedStream::Tcp(inner) => inner.shutdown().await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.shutdown().await,
        }
    }
}

pub(crate) fn split(stream: AcceptedStream) -> (ReadSide, WriteSide) {
    let (reader, writer) = stream.into_split();
    (ReadSide::Stream(reader), WriteSide::Stream(writer))
}

fn no_thread_pool() -> io::Error {
    io::Error::other("no blocking thread pool attached to the runtime")
}

pub enum ReadSide {
    Stream(OwnedReadHalf<AcceptedStream>),
    Blocking(Box<dyn Read + Send>),
}

impl ReadSide {
    /// Reads once into `buf`. On success the returned buffer holds exactly the bytes
    /// read; an empty buffer means end of stream.
    pub(crate) async fn read(self, mut buf: Vec<u8>) -> io::Result<(Vec<u8>, Self)> {
        match self {
            ReadSide::Stream(mut half) => {
                buf.clear();
                let (res, buf) = half.read(buf).await;
                res.map(|_| (buf, ReadSide::Stream(half)))
            }
            ReadSide::Blocking(mut reader) => {
                let capacity = buf.capacity().max(1);
                let joined = monoio::spawn_blocking(move || {
                    buf.resize(capacity, 0);
                    let res = reader.read(&mut buf);
                    buf.truncate(*res.as_ref().unwrap_or(&0));
                    res.map(|_| (buf, reader))
                })
                .await;
                match joined {
                    Ok(res) => res.map(|(buf, reader)| (buf, ReadSide::Blocking(reader))),
                    Err(_) => Err(no_thread_pool()),
                }
            }
        }
    }
}

pub enum WriteSide {
    Stream(OwnedWriteHalf<AcceptedStream>),
    Blocking(Box<dyn Write + Send>),
}

impl WriteSide {
    /// Writes once and reports how much of `buf` went out.
    pub(crate) async fn write(self, buf: Bytes) -> io::Result<(usize, Self)> {
        match self {
            WriteSide::Stream(mut half) => {
                let (res, _) = half.write(buf).await;
                res.map(|n| (n, WriteSide::Stream(half)))
            }
            WriteSide::Blocking(mut writer) => {
                let joined = monoio::spawn_blocking(move || {
                    let res = writer.write(&buf).and_then(|n| writer.flush().map(|_| n));
                    res.map(|n| (n, writer))
                })
                .await;
                match joined {
                    Ok(res) => res.map(|(n, writer)| (n, WriteSide::Blocking(writer))),
                    Err(_) => Err(no_thread_pool()),
                }
            }
        }
    }

    pub(crate) async fn shutdown(self) {
        if let WriteSide::Stream(mut half) = self {
            if let Err(err) = half.shutdown().await {
                trace!("write shutdown failed: {err}");
            }
        }
    }
}
