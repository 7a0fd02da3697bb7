//! One accepted TCP stream and its teardown protocol.
//!
//! A [`Connection`] presents an accepted socket as a pair of in-memory byte
//! buffers. The owning worker's reactor thread fills the inbound buffer and
//! drains the outbound one; game threads call the public operations from
//! anywhere. Every operation is non-blocking with respect to I/O; blocking
//! happens only on short-lived mutex acquisition.
//!
//! # Detach protocol
//!
//! A connection is `LIVE` until the first [`close`](Connection::close), after
//! which it is permanently `DETACHED`. The transition:
//!
//! 1. Lock-free fast path: a detached flag read with `Acquire`. Detach is
//!    monotone, so a `true` here can be trusted without locks.
//! 2. Take the inbound lock, then the outbound lock.
//! 3. Re-check the flag; a racing closer may have won.
//! 4. Under the per-stream lock: deregister from the reactor (no further
//!    readiness callbacks), take the stream out of its slot, and publish the
//!    detached flag with `Release`.
//! 5. Drop the stream outside the per-stream lock, closing the fd.
//! 6. Fire the close notification exactly once.
//!
//! Any caller arriving after the publication sees the flag and returns the
//! detached sentinel before touching the stream slot; the reactor thread
//! re-checks the slot under the per-stream lock, so a callback already past
//! the flag check finds the slot empty instead of a dangling handle.
//!
//! Lock order is inbound → outbound → stream. [`Worker`](crate::worker::Worker)
//! set locks sit above all three; nothing acquires in the other direction.

use crate::handler::{FrameOutcome, MalformedPolicy, ProtocolHandler};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Scratch size for one socket read. Inbound bytes are drained in chunks of
/// this size until the socket would block.
const READ_CHUNK: usize = 4096;

/// Invoked exactly once when the connection detaches; supplied by the owning
/// worker to move the connection into its closing set.
pub(crate) type CloseNotify = Box<dyn FnOnce() + Send>;

/// One accepted TCP stream.
///
/// Cheap to share: the worker holds it in its live set and hands out
/// [`Arc`]s; game code may retain clones and call the public operations from
/// any thread. After [`close`](Self::close) every operation returns its
/// detached sentinel (`false`, `None`, `0`, or silence) without error.
pub struct Connection<H> {
    remote_address: String,
    remote_endpoint: String,
    token: Token,
    registry: Registry,
    /// Publication point of the detach protocol. Never cleared once set.
    detached: AtomicBool,
    /// Inbound bytes, filled by the reactor thread. Its mutex is the "read
    /// lock" serialising `read`/`read_skip`/`in_peek`/`read_length_remaining`.
    inbound: Mutex<BytesMut>,
    /// Outbound bytes awaiting transmission. Its mutex is the "write lock".
    outbound: Mutex<BytesMut>,
    /// The stream slot; the per-stream lock of the detach protocol. `None`
    /// once detached.
    stream: Mutex<Option<TcpStream>>,
    close_notify: Mutex<Option<CloseNotify>>,
    handler: Mutex<H>,
}

impl<H: ProtocolHandler> Connection<H> {
    pub(crate) fn new(
        registry: Registry,
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        handler: H,
        close_notify: CloseNotify,
    ) -> Self {
        let remote_address = peer.ip().to_string();
        let remote_endpoint = format!("{remote_address}:{}", peer.port());
        Self {
            remote_address,
            remote_endpoint,
            token,
            registry,
            detached: AtomicBool::new(false),
            inbound: Mutex::new(BytesMut::new()),
            outbound: Mutex::new(BytesMut::new()),
            stream: Mutex::new(Some(stream)),
            close_notify: Mutex::new(Some(close_notify)),
            handler: Mutex::new(handler),
        }
    }

    /// Registers the stream for readable events with the owning worker's
    /// reactor. Called once by the worker after the connection is in its live
    /// set, so no readiness event can arrive for an unknown token.
    pub(crate) fn register(&self) -> io::Result<()> {
        let mut stream = self.stream.lock().expect("stream lock poisoned");
        match stream.as_mut() {
            Some(s) => self.registry.register(s, self.token, Interest::READABLE),
            None => Ok(()),
        }
    }

    /// Copies exactly `dst.len()` bytes out of the inbound buffer.
    ///
    /// Returns `true` and consumes the bytes only when the buffer holds at
    /// least that many; otherwise nothing is consumed. Returns `false` on a
    /// detached connection.
    pub fn read(&self, dst: &mut [u8]) -> bool {
        if self.detached.load(Ordering::Acquire) {
            return false;
        }
        let mut inbound = self.inbound.lock().expect("inbound buffer lock poisoned");
        // A closer may have detached us while we waited for the lock.
        if self.detached.load(Ordering::Acquire) {
            return false;
        }
        if inbound.len() < dst.len() {
            return false;
        }
        inbound.copy_to_slice(dst);
        true
    }

    /// Drops up to `n` bytes from the head of the inbound buffer.
    pub fn read_skip(&self, n: usize) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let mut inbound = self.inbound.lock().expect("inbound buffer lock poisoned");
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let n = n.min(inbound.len());
        inbound.advance(n);
    }

    /// Non-consuming look at the first inbound byte.
    #[must_use]
    pub fn in_peek(&self) -> Option<u8> {
        if self.detached.load(Ordering::Acquire) {
            return None;
        }
        let inbound = self.inbound.lock().expect("inbound buffer lock poisoned");
        if self.detached.load(Ordering::Acquire) {
            return None;
        }
        inbound.first().copied()
    }

    /// Number of bytes currently queued inbound; zero once detached.
    #[must_use]
    pub fn read_length_remaining(&self) -> usize {
        if self.detached.load(Ordering::Acquire) {
            return 0;
        }
        let inbound = self.inbound.lock().expect("inbound buffer lock poisoned");
        if self.detached.load(Ordering::Acquire) {
            return 0;
        }
        inbound.len()
    }

    /// Queues `src` for asynchronous transmission.
    ///
    /// Bytes from a single thread are transmitted in call order. There is no
    /// backpressure; on a detached connection the bytes are silently dropped.
    pub fn write(&self, src: &[u8]) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        let mut outbound = self.outbound.lock().expect("outbound buffer lock poisoned");
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        outbound.extend_from_slice(src);
        // Still under the outbound lock so a concurrent flush cannot observe
        // the bytes and disarm before we arm.
        self.arm_write_interest();
    }

    /// Requests writable events. Caller holds the outbound lock.
    fn arm_write_interest(&self) {
        let mut stream = self.stream.lock().expect("stream lock poisoned");
        if let Some(s) = stream.as_mut() {
            if let Err(e) = self
                .registry
                .reregister(s, self.token, Interest::READABLE | Interest::WRITABLE)
            {
                tracing::debug!(
                    endpoint = %self.remote_endpoint,
                    error = %e,
                    "failed to arm write interest"
                );
            }
        }
    }

    /// Idempotent transition to `DETACHED`; see the module docs for the
    /// protocol. Safe to call from any thread, including reactor callbacks.
    pub fn close(&self) {
        // Fast path without locks: detach is monotone.
        if self.detached.load(Ordering::Acquire) {
            return;
        }

        let inbound = self.inbound.lock().expect("inbound buffer lock poisoned");
        let outbound = self.outbound.lock().expect("outbound buffer lock poisoned");

        // Someone beat us to it while we waited for the buffer locks.
        if self.detached.load(Ordering::Acquire) {
            return;
        }

        let taken = {
            let mut stream = self.stream.lock().expect("stream lock poisoned");
            if let Some(s) = stream.as_mut() {
                if let Err(e) = self.registry.deregister(s) {
                    tracing::debug!(
                        endpoint = %self.remote_endpoint,
                        error = %e,
                        "failed to deregister stream"
                    );
                }
            }
            let taken = stream.take();
            self.detached.store(true, Ordering::Release);
            taken
        };
        // Dropping the stream closes the fd; done outside the per-stream lock.
        drop(taken);

        drop(outbound);
        drop(inbound);

        let notify = self
            .close_notify
            .lock()
            .expect("close notify lock poisoned")
            .take();
        if let Some(notify) = notify {
            notify();
        }
    }

    /// Whether the connection has entered `DETACHED`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Remote peer as `"a.b.c.d:port"`. Immutable after construction.
    #[must_use]
    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    /// Remote peer address text without the port. Immutable after
    /// construction.
    #[must_use]
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Reactor callback: drain the socket into the inbound buffer, run the
    /// protocol handler, and close on EOF or transport error.
    pub(crate) fn on_readable(&self) {
        let mut eof = false;
        let mut failed = false;
        loop {
            let mut scratch = [0u8; READ_CHUNK];
            let read = {
                let mut stream = self.stream.lock().expect("stream lock poisoned");
                let Some(s) = stream.as_mut() else {
                    // Detached while this event was in flight.
                    return;
                };
                s.read(&mut scratch)
            };
            match read {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    let mut inbound = self.inbound.lock().expect("inbound buffer lock poisoned");
                    inbound.extend_from_slice(&scratch[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(
                        endpoint = %self.remote_endpoint,
                        error = %e,
                        "transport error on read"
                    );
                    failed = true;
                    break;
                }
            }
        }

        // Give buffered bytes to the handler even when the peer is gone, so a
        // frame completed by the final segment is still delivered.
        self.run_handler();

        if eof || failed {
            self.close();
        }
    }

    /// Feeds the protocol handler until it cannot complete one more frame.
    /// No buffer lock is held across the handler call.
    fn run_handler(&self) {
        let mut handler = self.handler.lock().expect("handler lock poisoned");
        while self.read_length_remaining() > 0 {
            match handler.process_incoming_data(self) {
                FrameOutcome::Consumed => {}
                FrameOutcome::Incomplete => break,
                FrameOutcome::Malformed => {
                    tracing::warn!(
                        endpoint = %self.remote_endpoint,
                        remaining = self.read_length_remaining(),
                        "malformed frame from peer"
                    );
                    if handler.malformed_policy() == MalformedPolicy::Close {
                        self.close();
                    }
                    break;
                }
            }
        }
    }

    /// Reactor callback: flush the outbound buffer; drop write interest once
    /// empty so the reactor can sleep.
    pub(crate) fn on_writable(&self) {
        let mut outbound = self.outbound.lock().expect("outbound buffer lock poisoned");
        let mut stream = self.stream.lock().expect("stream lock poisoned");
        let Some(s) = stream.as_mut() else {
            return;
        };
        while !outbound.is_empty() {
            match s.write(outbound.chunk()) {
                Ok(n) if n > 0 => outbound.advance(n),
                Ok(_) => {
                    // Zero-length write on a non-empty buffer: peer is gone.
                    drop(stream);
                    drop(outbound);
                    self.close();
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(
                        endpoint = %self.remote_endpoint,
                        error = %e,
                        "transport error on write"
                    );
                    drop(stream);
                    drop(outbound);
                    self.close();
                    return;
                }
            }
        }
        if let Err(e) = self.registry.reregister(s, self.token, Interest::READABLE) {
            tracing::debug!(
                endpoint = %self.remote_endpoint,
                error = %e,
                "failed to disarm write interest"
            );
        }
    }
}

impl<H> std::fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.remote_endpoint)
            .field("token", &self.token.0)
            .field("detached", &self.detached.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<H> Drop for Connection<H> {
    fn drop(&mut self) {
        // The worker reclaims a connection only after detach.
        debug_assert!(
            self.detached.load(Ordering::Relaxed),
            "connection dropped while live"
        );
    }
}
