//! The listening endpoint and its accept loop.
//!
//! An [`Acceptor`] binds one IPv4 listener, builds the worker pool, and runs
//! an acceptor thread that hands each accepted socket to the least-loaded
//! worker. A listener-level failure stops accepting; the workers and every
//! connection they already service keep running.

use crate::config::{ConfigError, ListenConfig};
use crate::handler::{HandlerFactory, ProtocolHandler};
use crate::worker::Worker;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const ACCEPT_WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);

/// Pending-connection queue length passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

const EVENTS_CAPACITY: usize = 16;

/// One bound listening socket feeding a fixed pool of workers.
///
/// Dropping the acceptor stops the accept loop, then tears the workers down
/// transitively (each closing its live connections first).
pub struct Acceptor<H: ProtocolHandler> {
    workers: Arc<Vec<Worker<H>>>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl<H: ProtocolHandler> Acceptor<H> {
    /// Validates `config`, builds the worker pool, binds the listener, and
    /// starts the acceptor thread. Nothing is spawned if validation fails.
    pub(crate) fn bind<F>(config: &ListenConfig, handler_factory: F) -> Result<Self, ConfigError>
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        let addr = config.socket_addr()?;

        let factory: HandlerFactory<H> = Arc::new(handler_factory);
        let mut workers = Vec::with_capacity(config.workers());
        for _ in 0..config.workers() {
            workers.push(Worker::new(Arc::clone(&factory))?);
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), ACCEPT_WAKER_TOKEN)?);
        let mut listener = bind_listener(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let workers = Arc::new(workers);
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new().name("shardnet-acceptor".into()).spawn({
            let workers = Arc::clone(&workers);
            let shutdown = Arc::clone(&shutdown);
            move || accept_loop(poll, listener, &workers, &shutdown)
        })?;

        tracing::debug!(addr = %local_addr, workers = workers.len(), "acceptor listening");
        Ok(Self {
            workers,
            shutdown,
            waker,
            thread: Some(thread),
            local_addr,
        })
    }

    /// The bound listening address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Snapshot of each worker's published live-connection count, in worker
    /// order.
    #[must_use]
    pub fn worker_sizes(&self) -> Vec<usize> {
        self.workers.iter().map(Worker::size).collect()
    }
}

impl<H: ProtocolHandler> Drop for Acceptor<H> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::debug!(error = %e, "acceptor waker failed during shutdown");
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // Workers (and their connections) are torn down when the pool drops.
    }
}

impl<H: ProtocolHandler> std::fmt::Debug for Acceptor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

/// Binds a reusable-address, non-blocking IPv4 listener.
fn bind_listener(addr: SocketAddrV4) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn accept_loop<H: ProtocolHandler>(
    mut poll: Poll,
    listener: TcpListener,
    workers: &[Worker<H>],
    shutdown: &AtomicBool,
) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    'dispatch: loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "acceptor poll failed; no longer accepting");
            break;
        }
        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let index = least_loaded_index(workers.iter().map(Worker::size));
                        if let Err(e) = workers[index].adopt(stream, peer) {
                            tracing::warn!(
                                peer = %peer,
                                worker = index,
                                error = %e,
                                "failed to adopt accepted connection"
                            );
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        // Listener is broken; stop accepting. Workers keep
                        // servicing the connections they already own.
                        tracing::error!(error = %e, "listener error; no longer accepting");
                        break 'dispatch;
                    }
                }
            }
        }
    }
}

/// Index of the smallest entry; the first worker is the initial minimum and
/// earlier workers win ties.
fn least_loaded_index<I>(sizes: I) -> usize
where
    I: IntoIterator<Item = usize>,
{
    let mut sizes = sizes.into_iter();
    let mut min_index = 0;
    let mut min_size = sizes.next().unwrap_or(0);
    for (index, size) in sizes.enumerate() {
        if size < min_size {
            min_size = size;
            min_index = index + 1;
        }
    }
    min_index
}
