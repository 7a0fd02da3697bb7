//! Shardnet: reactor-per-worker TCP connection substrate for game shard
//! servers.
//!
//! # Overview
//!
//! Shardnet accepts inbound TCP connections on one bound endpoint and spreads
//! them across a fixed pool of workers. Each worker runs its own reactor
//! thread and multiplexes many connections, presenting every accepted socket
//! as a length-agnostic framed byte stream to a caller-supplied
//! [`ProtocolHandler`]. The substrate moves raw bytes; what a frame means is
//! entirely the handler's business.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Acceptor (1 thread)                                        │
//! │   listener ── least-loaded pick ──┐                        │
//! └───────────────────────────────────┼────────────────────────┘
//!                                     ▼
//! ┌─────────────────────┐   ┌─────────────────────┐
//! │ Worker 0            │   │ Worker N-1          │
//! │  reactor thread     │ … │  reactor thread     │
//! │  reaper thread      │   │  reaper thread      │
//! │  live / closing set │   │  live / closing set │
//! └─────────┬───────────┘   └─────────────────────┘
//!           ▼
//!   Connection ──ProtocolHandler::process_incoming_data()──▶ game logic
//! ```
//!
//! # Core Guarantees
//!
//! - **Idempotent teardown**: any number of [`Connection::close`] calls from
//!   any threads produce exactly one close notification and one fd close
//! - **Post-detach safety**: after `close` returns, every operation on the
//!   connection is a harmless sentinel, never a dangling handle
//! - **Per-connection FIFO**: writes from one thread reach the peer in call
//!   order; inbound bytes reach the handler in arrival order, never
//!   concurrently with themselves
//! - **Deferred reclamation**: detached connections are destroyed by the
//!   owning worker's reaper, at least one tick after detach
//!
//! # Module Structure
//!
//! - [`config`]: endpoint configuration and construction errors
//! - [`handler`]: the protocol-handler seam ([`ProtocolHandler`],
//!   [`FrameOutcome`], [`MalformedPolicy`])
//! - [`connection`]: one accepted stream and the detach protocol
//! - [`worker`]: reactor + reaper threads, live/closing ownership sets
//! - [`acceptor`]: the listener and least-loaded distribution
//! - [`factory`]: one-shot process initialization
//! - [`test_utils`]: logging/assertion helpers shared by the test suites

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod factory;
pub mod handler;
pub mod test_utils;
pub mod worker;

pub use acceptor::Acceptor;
pub use config::{ConfigError, ListenConfig};
pub use connection::Connection;
pub use factory::NetFactory;
pub use handler::{FrameOutcome, MalformedPolicy, ProtocolHandler};
pub use worker::Worker;
