//! Per-client connection state.
//!
//! A connection owns its socket and two elastic buffers, and carries three
//! independent readiness flags. Only the component that owns the connection
//! ever mutates it.

use crate::runtime::ElasticBuffer;

/// Connection state as seen by the readiness loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for request bytes.
    Reading,
    /// Waiting to flush buffered responses.
    Writing,
    /// Both directions wanted.
    ReadWrite,
    /// Neither direction wanted, but not closing.
    Idle,
    /// Terminal; the owner will tear the connection down.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    /// Bytes received but not yet decoded.
    pub read_buf: ElasticBuffer,
    /// Encoded responses not yet sent.
    pub write_buf: ElasticBuffer,
    pub want_read: bool,
    pub want_write: bool,
    pub want_close: bool,
    /// No more input will be accepted; close once `write_buf` drains.
    pub close_after_flush: bool,
}

impl<S> Connection<S> {
    /// Create a new connection in the reading state.
    pub fn new(stream: S, buffer_size: usize) -> Self {
        Self {
            stream,
            read_buf: ElasticBuffer::with_capacity(buffer_size),
            write_buf: ElasticBuffer::with_capacity(buffer_size),
            want_read: true,
            want_write: false,
            want_close: false,
            close_after_flush: false,
        }
    }

    pub fn state(&self) -> ConnState {
        if self.want_close {
            return ConnState::Closing;
        }
        match (self.want_read, self.want_write) {
            (true, false) => ConnState::Reading,
            (false, true) => ConnState::Writing,
            (true, true) => ConnState::ReadWrite,
            (false, false) => ConnState::Idle,
        }
    }

    /// Stop reading until buffered responses are flushed.
    pub fn start_writing(&mut self) {
        self.want_read = false;
        self.want_write = true;
    }

    /// Resume reading after a full flush, or close if input has ended.
    pub fn start_reading(&mut self) {
        if self.close_after_flush {
            self.close();
            return;
        }
        self.want_read = true;
        self.want_write = false;
    }

    /// Stop reading for good. Pending responses are still sent; the
    /// connection closes as soon as the write buffer is empty.
    pub fn finish(&mut self) {
        self.close_after_flush = true;
        self.want_read = false;
        if self.write_buf.is_empty() {
            self.close();
        } else {
            self.want_write = true;
        }
    }

    /// Mark the connection for teardown.
    pub fn close(&mut self) {
        self.want_close = true;
    }
}
