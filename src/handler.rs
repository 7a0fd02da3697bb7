//! The protocol-handler seam between the substrate and the game protocol.
//!
//! The core moves raw bytes; framing is entirely the handler's business. A
//! handler is constructed per connection (via the factory closure given to
//! [`NetFactory::listen`](crate::factory::NetFactory::listen)) and its
//! [`process_incoming_data`](ProtocolHandler::process_incoming_data) is driven
//! on the owning worker's reactor thread while inbound bytes remain, so it is
//! never invoked concurrently with itself for one connection.

use crate::connection::Connection;
use std::sync::Arc;

/// Result of one attempt to decode the inbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Exactly one complete message was consumed; the core will call again if
    /// bytes remain.
    Consumed,
    /// The buffer does not yet hold a full header or body. Bytes stay queued
    /// and the handler is called again on the next readable event.
    Incomplete,
    /// The buffer head is not a valid frame and was not consumed. The core
    /// logs it and then applies the handler's
    /// [`malformed_policy`](ProtocolHandler::malformed_policy).
    Malformed,
}

/// What the core does with a connection after a [`FrameOutcome::Malformed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Leave the connection open with the bytes still queued.
    #[default]
    KeepOpen,
    /// Close the connection.
    Close,
}

/// Per-connection decoder for one application protocol.
///
/// Implementations read through the connection's own operations
/// ([`read`](Connection::read), [`in_peek`](Connection::in_peek),
/// [`read_skip`](Connection::read_skip),
/// [`read_length_remaining`](Connection::read_length_remaining)) and reply
/// with [`write`](Connection::write). None of the connection's buffer locks
/// are held when the handler runs.
///
/// # Example
///
/// ```ignore
/// use shardnet::{Connection, FrameOutcome, ProtocolHandler};
///
/// /// One-byte length prefix, then that many payload bytes.
/// struct LenPrefixed;
///
/// impl ProtocolHandler for LenPrefixed {
///     fn process_incoming_data(&mut self, conn: &Connection<Self>) -> FrameOutcome {
///         let Some(len) = conn.in_peek() else {
///             return FrameOutcome::Incomplete;
///         };
///         if conn.read_length_remaining() < 1 + usize::from(len) {
///             return FrameOutcome::Incomplete;
///         }
///         conn.read_skip(1);
///         let mut body = vec![0u8; usize::from(len)];
///         if !conn.read(&mut body) {
///             return FrameOutcome::Incomplete;
///         }
///         conn.write(&body);
///         FrameOutcome::Consumed
///     }
/// }
/// ```
pub trait ProtocolHandler: Send + Sized + 'static {
    /// Attempts to decode and consume exactly one message from the inbound
    /// buffer.
    fn process_incoming_data(&mut self, conn: &Connection<Self>) -> FrameOutcome;

    /// Policy applied after a malformed frame. Defaults to
    /// [`MalformedPolicy::KeepOpen`].
    fn malformed_policy(&self) -> MalformedPolicy {
        MalformedPolicy::default()
    }
}

/// Shared constructor for per-connection handlers.
pub(crate) type HandlerFactory<H> = Arc<dyn Fn() -> H + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_policy_defaults_to_keep_open() {
        assert_eq!(MalformedPolicy::default(), MalformedPolicy::KeepOpen);
    }
}
