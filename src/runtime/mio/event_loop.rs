//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//!
//! mio readiness is edge-triggered, so every handler runs until the socket
//! would block: the listener accepts until empty, a readable connection is
//! read until empty, and a writable connection is written until its buffer
//! drains or the kernel pushes back.

use crate::config::Config;
use crate::runtime::{
    bind_listener, drain_requests, ConnState, Connection, Server, ShutdownHandle,
};
use crate::storage::Storage;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Connection plus the interest currently registered for it.
struct MioConnection {
    conn: Connection<TcpStream>,
    peer: SocketAddr,
    interest: Option<Interest>,
}

/// Single-threaded readiness-driven server.
pub struct EventLoopServer {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<MioConnection>,
    /// Owned outright: only this thread touches it.
    storage: Storage,
    /// Scratch space for socket reads.
    chunk: Vec<u8>,
    max_connections: usize,
    max_events: usize,
    buffer_size: usize,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl EventLoopServer {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = config.listen_addr()?;
        let poll = Poll::new()?;

        let mut listener = TcpListener::from_std(bind_listener(addr, true)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        info!(
            addr = %addr,
            max_connections = config.max_connections,
            "Starting event loop runtime"
        );

        Ok(Self {
            poll,
            listener,
            connections: Slab::with_capacity(config.max_connections.min(4096)),
            storage: Storage::new(),
            chunk: vec![0u8; config.read_chunk_size],
            max_connections: config.max_connections,
            max_events: config.max_events,
            buffer_size: config.initial_buffer_size,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(conn_id), Interest::READABLE)
                    {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    entry.insert(MioConnection {
                        conn: Connection::new(stream, self.buffer_size),
                        peer,
                        interest: Some(Interest::READABLE),
                    });
                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, event: &Event) {
        let Some(entry) = self.connections.get_mut(conn_id) else {
            return;
        };
        let conn = &mut entry.conn;

        if event.is_readable() && conn.want_read {
            handle_readable(conn, &mut self.storage, &mut self.chunk);
        }
        if event.is_writable() && conn.want_write && !conn.want_close {
            handle_writable(conn);
        }
        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            conn.close();
        }

        if conn.state() == ConnState::Closing {
            self.close_connection(conn_id);
        } else if let Err(e) = self.update_interest(conn_id) {
            debug!(conn_id, error = %e, "Failed to update interest");
            self.close_connection(conn_id);
        }
    }

    /// Re-register the connection if its wanted directions changed.
    fn update_interest(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(entry) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        let wanted = match entry.conn.state() {
            ConnState::Reading => Some(Interest::READABLE),
            ConnState::Writing => Some(Interest::WRITABLE),
            ConnState::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
            ConnState::Idle | ConnState::Closing => None,
        };
        if wanted == entry.interest {
            return Ok(());
        }

        let registry = self.poll.registry();
        match wanted {
            Some(interest) if entry.interest.is_some() => {
                registry.reregister(&mut entry.conn.stream, Token(conn_id), interest)?
            }
            Some(interest) => registry.register(&mut entry.conn.stream, Token(conn_id), interest)?,
            None => registry.deregister(&mut entry.conn.stream)?,
        }
        entry.interest = wanted;
        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut entry) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut entry.conn.stream);
            debug!(
                conn_id,
                peer = %entry.peer,
                read_capacity = entry.conn.read_buf.capacity(),
                "Connection closed"
            );
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            self.close_connection(conn_id);
        }
    }
}

impl Server for EventLoopServer {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::for_poll(Arc::clone(&self.shutdown), Arc::clone(&self.waker))
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.max_events);
        let shutdown = self.shutdown_handle();

        while !shutdown.is_shutdown() {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.handle_connection_event(conn_id, event),
                }
            }
        }

        info!(
            open = self.connections.len(),
            keys = self.storage.len(),
            "Event loop shutting down"
        );
        self.close_all();
        Ok(())
    }
}

/// Read everything available, then answer every complete frame.
fn handle_readable(conn: &mut Connection<TcpStream>, storage: &mut Storage, chunk: &mut [u8]) {
    let mut peer_closed = false;
    loop {
        match conn.stream.read(chunk) {
            Ok(0) => {
                peer_closed = true;
                break;
            }
            Ok(n) => conn.read_buf.append(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Read error");
                conn.close();
                return;
            }
        }
    }

    match drain_requests(&mut conn.read_buf, &mut conn.write_buf, |cmd| {
        storage.execute(cmd)
    }) {
        Ok(0) => {}
        Ok(n) => trace!(frames = n, "Processed requests"),
        Err(e) => {
            debug!(error = %e, "Protocol violation");
            conn.finish();
        }
    }

    if peer_closed {
        if !conn.read_buf.is_empty() {
            debug!(pending = conn.read_buf.size(), "Peer closed mid-frame");
        }
        conn.finish();
    }

    if !conn.write_buf.is_empty() && !conn.want_close {
        conn.start_writing();
        handle_writable(conn);
    }
}

/// Send as much of the write buffer as the socket accepts.
fn handle_writable(conn: &mut Connection<TcpStream>) {
    while !conn.write_buf.is_empty() {
        match conn.stream.write(conn.write_buf.data()) {
            Ok(0) => {
                debug!("Write returned 0");
                conn.close();
                return;
            }
            Ok(n) if n == conn.write_buf.size() => conn.write_buf.clear(),
            Ok(n) => conn.write_buf.consume(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Write error");
                conn.close();
                return;
            }
        }
    }
    conn.start_reading();
}
