//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! One thread owns every connection and the store, so nothing is locked.

mod event_loop;

pub use event_loop::EventLoopServer;
