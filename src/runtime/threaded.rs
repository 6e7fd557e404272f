//! Thread-per-connection implementation.
//!
//! A blocking acceptor spawns one worker per connection. Each worker owns
//! its socket and buffers and runs its own read, decode, write loop. The
//! only shared state is the store, locked for the duration of one command.
//!
//! Workers are tracked by handle and capped at `max_connections`; on
//! shutdown the acceptor stops and joins them. Reads and writes use a
//! timeout so a worker blocked on an idle or non-reading peer periodically
//! observes the shutdown flag.

use crate::config::Config;
use crate::runtime::{bind_listener, drain_requests, Connection, Server, ShutdownHandle};
use crate::storage::{self, SharedStorage, Storage};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Pause after a failed accept so persistent errors (e.g. EMFILE) don't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Per-worker settings copied out of the config.
#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    read_chunk_size: usize,
    buffer_size: usize,
    idle_timeout: Duration,
}

/// Thread-per-connection server over a mutex-guarded store.
pub struct ThreadedServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    storage: SharedStorage,
    settings: WorkerSettings,
    max_connections: usize,
    workers: Vec<JoinHandle<()>>,
    next_worker_id: u64,
    shutdown: Arc<AtomicBool>,
}

impl ThreadedServer {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = config.listen_addr()?;
        let listener = bind_listener(addr, false)?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %addr,
            max_connections = config.max_connections,
            "Starting threaded runtime"
        );

        Ok(Self {
            listener,
            local_addr,
            storage: Storage::shared(),
            settings: WorkerSettings {
                read_chunk_size: config.read_chunk_size,
                buffer_size: config.initial_buffer_size,
                idle_timeout: config.idle_timeout,
            },
            max_connections: config.max_connections,
            workers: Vec::new(),
            next_worker_id: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Join workers whose connections have ended.
    fn reap_workers(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|handle| handle.is_finished());
        self.workers = running;
        for handle in finished {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let storage = Arc::clone(&self.storage);
        let settings = self.settings;
        let shutdown = self.shutdown_handle();

        let handle = thread::Builder::new()
            .name(format!("conn-{worker_id}"))
            .spawn(move || {
                match serve_connection(stream, &storage, settings, &shutdown) {
                    Ok(()) => debug!(worker = worker_id, peer = %peer, "Connection closed"),
                    Err(e) => {
                        debug!(worker = worker_id, peer = %peer, error = %e, "Connection error")
                    }
                }
            })?;

        self.workers.push(handle);
        Ok(())
    }
}

impl Server for ThreadedServer {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::for_acceptor(Arc::clone(&self.shutdown), self.local_addr)
    }

    fn run(&mut self) -> io::Result<()> {
        let shutdown = self.shutdown_handle();

        loop {
            let accepted = self.listener.accept();
            if shutdown.is_shutdown() {
                break;
            }

            match accepted {
                Ok((stream, peer)) => {
                    self.reap_workers();
                    if self.workers.len() >= self.max_connections {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }
                    if let Err(e) = self.spawn_worker(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to spawn worker");
                        continue;
                    }
                    debug!(peer = %peer, workers = self.workers.len(), "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }

        info!(workers = self.workers.len(), "Acceptor stopped, joining workers");
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        info!(keys = storage::lock(&self.storage).len(), "Workers joined");
        Ok(())
    }
}

/// Worker loop: read, drain every complete frame, flush, repeat.
fn serve_connection(
    stream: TcpStream,
    storage: &SharedStorage,
    settings: WorkerSettings,
    shutdown: &ShutdownHandle,
) -> io::Result<()> {
    stream.set_read_timeout(Some(settings.idle_timeout))?;
    stream.set_write_timeout(Some(settings.idle_timeout))?;
    let mut conn = Connection::new(stream, settings.buffer_size);
    let mut chunk = vec![0u8; settings.read_chunk_size];

    while !conn.want_close && !shutdown.is_shutdown() {
        match conn.stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => conn.read_buf.append(&chunk[..n]),
            // No data yet is not an error.
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(e),
        }

        let drained = drain_requests(&mut conn.read_buf, &mut conn.write_buf, |cmd| {
            storage::lock(storage).execute(cmd)
        });

        flush(&mut conn, shutdown)?;

        match drained {
            Ok(0) => {}
            Ok(n) => trace!(frames = n, "Processed requests"),
            Err(e) => {
                debug!(error = %e, "Protocol violation");
                conn.close();
            }
        }
    }

    Ok(())
}

/// Send the whole write buffer, giving up early only on shutdown.
fn flush(conn: &mut Connection<TcpStream>, shutdown: &ShutdownHandle) -> io::Result<()> {
    while !conn.write_buf.is_empty() {
        match conn.stream.write(conn.write_buf.data()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => conn.write_buf.consume(n),
            // Peer is not reading; keep waiting unless asked to stop.
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) =>
            {
                if shutdown.is_shutdown() {
                    debug!(pending = conn.write_buf.size(), "Dropping unsent responses");
                    return Ok(());
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
