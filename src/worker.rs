//! One I/O multiplexing context and its two service threads.
//!
//! A [`Worker`] owns every connection the acceptor hands it, split across two
//! containers: the *live set* (token → connection, still attached to the
//! reactor) and the *closing set* (detached, awaiting reclamation). A
//! connection is always in exactly one of live, closing, or destroyed.
//!
//! Two threads service the worker:
//!
//! - the **reactor thread** sleeps in `poll` and dispatches readiness events
//!   to connection callbacks. It never touches the sets itself; a callback
//!   that closes a connection moves it via the close notification.
//! - the **reaper thread** wakes every [`REAP_INTERVAL`] and drops every
//!   closing-set entry that has finished detaching. Reclamation is deferred
//!   one tick so an event already dispatched against a token can finish
//!   before the connection is destroyed.
//!
//! Set lock order is live before closing; connection locks sit below both.

use crate::connection::{CloseNotify, Connection};
use crate::handler::{HandlerFactory, ProtocolHandler};
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reserved token for the reactor's wake-up primitive.
const WAKER_TOKEN: Token = Token(0);

/// Connection tokens count up from here; they are never reused, so a stale
/// event can only miss in the live set, never hit the wrong connection.
const FIRST_CONNECTION_TOKEN: usize = 1;

/// How often the reaper reclaims detached connections.
pub(crate) const REAP_INTERVAL: Duration = Duration::from_millis(500);

const EVENTS_CAPACITY: usize = 1024;

/// One reactor loop plus the connections it services.
///
/// Dropping a worker closes every live connection, waits for the reaper to
/// reclaim them, breaks the reactor loop, and joins both threads.
pub struct Worker<H: ProtocolHandler> {
    state: Arc<WorkerState<H>>,
    waker: Arc<Waker>,
    reactor: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

struct WorkerState<H: ProtocolHandler> {
    live: Mutex<HashMap<Token, Arc<Connection<H>>>>,
    closing: Mutex<VecDeque<Arc<Connection<H>>>>,
    /// Published load; maintained by adopt/remove so the acceptor can read it
    /// without taking the live lock.
    live_count: AtomicUsize,
    shutdown: AtomicBool,
    registry: Registry,
    next_token: AtomicUsize,
    handler_factory: HandlerFactory<H>,
}

impl<H: ProtocolHandler> Worker<H> {
    pub(crate) fn new(handler_factory: HandlerFactory<H>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let state = Arc::new(WorkerState {
            live: Mutex::new(HashMap::new()),
            closing: Mutex::new(VecDeque::new()),
            live_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            registry,
            next_token: AtomicUsize::new(FIRST_CONNECTION_TOKEN),
            handler_factory,
        });

        let reactor = thread::Builder::new().name("shardnet-worker".into()).spawn({
            let state = Arc::clone(&state);
            move || state.reactor_loop(poll)
        })?;
        let reaper = thread::Builder::new().name("shardnet-reaper".into()).spawn({
            let state = Arc::clone(&state);
            move || state.reaper_loop()
        })?;

        Ok(Self {
            state,
            waker,
            reactor: Some(reactor),
            reaper: Some(reaper),
        })
    }

    /// Takes over an accepted stream: builds a connection around it, inserts
    /// it at the head of the live set, and registers it with this worker's
    /// reactor. Called synchronously from the acceptor thread.
    pub(crate) fn adopt(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        WorkerState::adopt(&self.state, stream, peer)
    }

    /// Published live-connection count, read without locking. Staleness is
    /// fine; this only steers the acceptor's load balancing.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.live_count.load(Ordering::Relaxed)
    }
}

impl<H: ProtocolHandler> Drop for Worker<H> {
    fn drop(&mut self) {
        // Close every live connection. The close notification moves each one
        // into the closing set, so the live set shrinks as we go; the live
        // lock is therefore never held across a close() call.
        loop {
            let head = {
                let live = self.state.live.lock().expect("live set lock poisoned");
                live.iter().next().map(|(t, c)| (*t, Arc::clone(c)))
            };
            let Some((token, conn)) = head else { break };
            if conn.is_closed() {
                // Already detached but never moved out; erase it directly.
                let mut live = self.state.live.lock().expect("live set lock poisoned");
                if live.remove(&token).is_some() {
                    self.state.live_count.fetch_sub(1, Ordering::Relaxed);
                }
            } else {
                conn.close();
            }
        }

        self.state.shutdown.store(true, Ordering::Release);
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
        if let Err(e) = self.waker.wake() {
            tracing::debug!(error = %e, "worker waker failed during shutdown");
        }
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }
        // The reactor poll is freed when the reactor thread returns.
    }
}

impl<H: ProtocolHandler> std::fmt::Debug for Worker<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("live", &self.state.live_count.load(Ordering::Relaxed))
            .field(
                "shutdown",
                &self.state.shutdown.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl<H: ProtocolHandler> WorkerState<H> {
    fn adopt(state: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let token = Token(state.next_token.fetch_add(1, Ordering::Relaxed));
        let registry = state.registry.try_clone()?;
        let handler = (state.handler_factory)();
        let notify: CloseNotify = {
            let state = Arc::clone(state);
            Box::new(move || state.remove_from_live(token))
        };
        let conn = Arc::new(Connection::new(
            registry, token, stream, peer, handler, notify,
        ));

        {
            let mut live = state.live.lock().expect("live set lock poisoned");
            live.insert(token, Arc::clone(&conn));
        }
        state.live_count.fetch_add(1, Ordering::Relaxed);

        // Registered only after the live-set insert so the first readiness
        // event always finds its connection.
        if let Err(e) = conn.register() {
            conn.close();
            return Err(e);
        }
        tracing::trace!(endpoint = %conn.remote_endpoint(), token = token.0, "adopted connection");
        Ok(())
    }

    /// Transfers one connection from the live set to the head of the closing
    /// set. Invoked by the connection's close notification.
    fn remove_from_live(&self, token: Token) {
        let mut live = self.live.lock().expect("live set lock poisoned");
        let mut closing = self.closing.lock().expect("closing set lock poisoned");
        if let Some(conn) = live.remove(&token) {
            closing.push_front(conn);
            self.live_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn reactor_loop(&self, mut poll: Poll) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "worker reactor poll failed");
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    // Shutdown is re-checked at the top of the loop.
                    continue;
                }
                let conn = {
                    let live = self.live.lock().expect("live set lock poisoned");
                    live.get(&token).cloned()
                };
                let Some(conn) = conn else {
                    // Event raced with a close; the token is gone.
                    continue;
                };
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                if readable {
                    conn.on_readable();
                }
                if event.is_writable() {
                    conn.on_writable();
                }
                if !readable && !event.is_writable() && !event.is_write_closed() {
                    tracing::debug!(token = token.0, "unhandled reactor event");
                }
            }
        }
    }

    fn reaper_loop(&self) {
        // Keeps running past shutdown until every pending free has happened.
        while !self.shutdown.load(Ordering::Acquire) || !self.closing_is_empty() {
            thread::sleep(REAP_INTERVAL);
            let mut closing = self.closing.lock().expect("closing set lock poisoned");
            closing.retain(|conn| !conn.is_closed());
        }
    }

    fn closing_is_empty(&self) -> bool {
        self.closing
            .lock()
            .expect("closing set lock poisoned")
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FrameOutcome;
    use crate::test_utils::init_test_logging;
    use std::io::Read;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::time::Instant;

    /// Never consumes; counts drops so tests can observe reclamation.
    struct DropFlag {
        dropped: Arc<AtomicUsize>,
    }

    impl ProtocolHandler for DropFlag {
        fn process_incoming_data(&mut self, _conn: &Connection<Self>) -> FrameOutcome {
            FrameOutcome::Incomplete
        }
    }

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn drop_flag_worker() -> (Worker<DropFlag>, Arc<AtomicUsize>) {
        init_test_logging();
        let dropped = Arc::new(AtomicUsize::new(0));
        let factory_dropped = Arc::clone(&dropped);
        let worker = Worker::new(Arc::new(move || DropFlag {
            dropped: Arc::clone(&factory_dropped),
        }))
        .expect("worker");
        (worker, dropped)
    }

    /// Connects `n` clients through a throwaway listener and adopts the
    /// accepted ends into the worker.
    fn feed_clients(worker: &Worker<DropFlag>, n: usize) -> Vec<StdStream> {
        let listener = StdListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let mut clients = Vec::with_capacity(n);
        for _ in 0..n {
            let client = StdStream::connect(addr).expect("connect");
            let (accepted, peer) = listener.accept().expect("accept");
            accepted.set_nonblocking(true).expect("nonblocking");
            worker
                .adopt(TcpStream::from_std(accepted), peer)
                .expect("adopt");
            clients.push(client);
        }
        clients
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn adopt_publishes_load() {
        crate::test_phase!("adopt_publishes_load");
        let (worker, _dropped) = drop_flag_worker();
        let clients = feed_clients(&worker, 3);
        let size = worker.size();
        crate::assert_with_log!(size == 3, "three live connections", 3, size);
        drop(clients);
        let drained = wait_for(|| worker.size() == 0);
        crate::assert_with_log!(drained, "EOF drains live set", true, drained);
        crate::test_complete!("adopt_publishes_load");
    }

    #[test]
    fn reaper_frees_within_one_period() {
        crate::test_phase!("reaper_frees_within_one_period");
        let (worker, dropped) = drop_flag_worker();
        let clients = feed_clients(&worker, 1);
        drop(clients);
        // EOF moves the connection to the closing set; the reaper must then
        // destroy it within one period plus one iteration.
        let reclaimed = wait_for(|| dropped.load(Ordering::SeqCst) == 1);
        crate::assert_with_log!(reclaimed, "connection reclaimed", 1, dropped.load(Ordering::SeqCst));
        crate::test_complete!("reaper_frees_within_one_period");
    }

    #[test]
    fn shutdown_closes_live_connections() {
        crate::test_phase!("shutdown_closes_live_connections");
        let (worker, dropped) = drop_flag_worker();
        let mut clients = feed_clients(&worker, 3);
        assert_eq!(worker.size(), 3);

        drop(worker);

        // Worker teardown closed, reaped, and joined before returning.
        let freed = dropped.load(Ordering::SeqCst);
        crate::assert_with_log!(freed == 3, "all three reclaimed", 3, freed);
        for client in &mut clients {
            client
                .set_read_timeout(Some(Duration::from_secs(1)))
                .expect("timeout");
            let mut buf = [0u8; 8];
            let n = client.read(&mut buf).unwrap_or(0);
            crate::assert_with_log!(n == 0, "client sees EOF", 0, n);
        }
        crate::test_complete!("shutdown_closes_live_connections");
    }

    #[test]
    fn idle_worker_shuts_down_cleanly() {
        crate::test_phase!("idle_worker_shuts_down_cleanly");
        let (worker, dropped) = drop_flag_worker();
        assert_eq!(worker.size(), 0);
        drop(worker);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        crate::test_complete!("idle_worker_shuts_down_cleanly");
    }
}
