//! Networking runtimes.
//!
//! Two interchangeable implementations of [`Server`] share one wire protocol
//! and one buffer design:
//! - `mio`: single-threaded readiness loop (epoll on Linux, kqueue on macOS)
//! - `threaded`: one worker thread per connection over a mutex-guarded store
//!
//! Both share common abstractions:
//! - `ElasticBuffer`: per-connection read/write buffer
//! - `Connection`: socket plus buffers plus readiness flags
//! - `drain_requests`: decode, dispatch and frame every buffered request

mod buffer;
mod connection;
pub mod mio;
mod request;
pub mod threaded;

pub(crate) use buffer::ElasticBuffer;
pub(crate) use connection::{ConnState, Connection};
pub(crate) use request::drain_requests;

use crate::config::{Architecture, Config};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Listen backlog: the platform maximum.
#[cfg(unix)]
const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;
#[cfg(not(unix))]
const LISTEN_BACKLOG: i32 = 1024;

/// A key-value server bound to a listening socket.
pub trait Server {
    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Handle that stops [`run`](Server::run) from another thread.
    fn shutdown_handle(&self) -> ShutdownHandle;

    /// Serve connections until shut down.
    fn run(&mut self) -> io::Result<()>;
}

/// How a blocked server is woken after the shutdown flag is set.
#[derive(Clone)]
enum Wake {
    /// Readiness loop blocked in poll.
    Poll(Arc<::mio::Waker>),
    /// Acceptor blocked in accept; a throwaway connection unblocks it.
    Connect(SocketAddr),
}

/// Cloneable handle that requests a server shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Wake,
}

impl ShutdownHandle {
    fn for_poll(flag: Arc<AtomicBool>, waker: Arc<::mio::Waker>) -> Self {
        Self {
            flag,
            wake: Wake::Poll(waker),
        }
    }

    fn for_acceptor(flag: Arc<AtomicBool>, addr: SocketAddr) -> Self {
        Self {
            flag,
            wake: Wake::Connect(loopback(addr)),
        }
    }

    /// Ask the server to stop. Returns once the request is delivered, not
    /// once the server has stopped.
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::SeqCst);
        match &self.wake {
            Wake::Poll(waker) => waker.wake(),
            Wake::Connect(addr) => match TcpStream::connect(addr) {
                Ok(_) => Ok(()),
                // The acceptor may already be gone.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run the server selected by `config.architecture`.
pub fn run(config: Config) -> io::Result<()> {
    match config.architecture {
        Architecture::EventLoop => serve(mio::EventLoopServer::bind(&config)?),
        Architecture::Threaded => serve(threaded::ThreadedServer::bind(&config)?),
    }
}

fn serve<S: Server>(mut server: S) -> io::Result<()> {
    install_signal_handler(server.shutdown_handle())?;

    info!(addr = %server.local_addr()?, "Server listening");
    server.run()?;
    info!("Server stopped");
    Ok(())
}

/// Route SIGINT and SIGTERM to `handle`.
fn install_signal_handler(handle: ShutdownHandle) -> io::Result<()> {
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        if let Err(e) = handle.shutdown() {
            warn!(error = %e, "Failed to wake server for shutdown");
        }
    })
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Create a listening TCP socket with SO_REUSEADDR and the maximum backlog.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    nonblocking: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Map a wildcard bind address to the matching loopback address.
fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    }
}
