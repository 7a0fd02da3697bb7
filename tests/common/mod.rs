//! Shared fixtures for the end-to-end suite.

use shardnet::{Connection, FrameOutcome, NetFactory, ProtocolHandler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// The process-wide network stack; initialization is one-shot, so every test
/// goes through this accessor.
pub fn factory() -> &'static NetFactory {
    static FACTORY: OnceLock<NetFactory> = OnceLock::new();
    FACTORY.get_or_init(|| NetFactory::init().expect("network stack init"))
}

/// Echoes every inbound burst back to the peer, treating whatever has arrived
/// as one message. Counts handler drops so tests can observe reclamation.
pub struct Echo {
    pub dropped: Arc<AtomicUsize>,
}

impl ProtocolHandler for Echo {
    fn process_incoming_data(&mut self, conn: &Connection<Self>) -> FrameOutcome {
        let n = conn.read_length_remaining();
        if n == 0 {
            return FrameOutcome::Incomplete;
        }
        let mut buf = vec![0u8; n];
        if !conn.read(&mut buf) {
            return FrameOutcome::Incomplete;
        }
        conn.write(&buf);
        FrameOutcome::Consumed
    }
}

impl Drop for Echo {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Consumes fixed-length frames and counts them; partial frames stay queued.
pub struct FixedFrames {
    pub frame_len: usize,
    pub frames: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicUsize>,
}

impl ProtocolHandler for FixedFrames {
    fn process_incoming_data(&mut self, conn: &Connection<Self>) -> FrameOutcome {
        if conn.read_length_remaining() < self.frame_len {
            return FrameOutcome::Incomplete;
        }
        let mut frame = vec![0u8; self.frame_len];
        if !conn.read(&mut frame) {
            return FrameOutcome::Incomplete;
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        FrameOutcome::Consumed
    }
}

impl Drop for FixedFrames {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `cond` for up to three seconds, enough for one reaper period plus
/// slack.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
