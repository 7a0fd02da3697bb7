//! Listener endpoint configuration and construction errors.
//!
//! A [`ListenConfig`] is validated in full before any socket is bound or any
//! thread is spawned; every rejection is a [`ConfigError`]. Runtime
//! per-connection failures never surface here; they resolve locally inside
//! the worker that owns the connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Errors that prevent the network stack or an acceptor from being created.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The bind address is not an IPv4 literal.
    #[error("invalid bind address {addr:?}: an IPv4 literal is required")]
    InvalidBindAddress {
        /// The rejected address text.
        addr: String,
    },

    /// The listen port was zero.
    #[error("listen port must be in 1..=65535")]
    InvalidPort,

    /// The worker pool would be empty.
    #[error("worker count must be at least 1")]
    ZeroWorkers,

    /// [`NetFactory::init`](crate::factory::NetFactory::init) was called a
    /// second time in the same process.
    #[error("network stack is already initialized")]
    AlreadyInitialized,

    /// The OS reactor, listener socket, or a service thread could not be
    /// created.
    #[error("reactor initialization failed: {source}")]
    Reactor {
        /// The underlying OS error.
        #[from]
        source: io::Error,
    },
}

/// Where to listen and how many workers service the accepted connections.
///
/// The bind address must be an IPv4 literal such as `"0.0.0.0"`; hostname
/// resolution is the caller's concern.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    bind_ip: String,
    port: u16,
    workers: usize,
}

impl ListenConfig {
    /// Creates a configuration. Validation happens in [`validate`](Self::validate)
    /// or when an acceptor is constructed from it.
    #[must_use]
    pub fn new(bind_ip: impl Into<String>, port: u16, workers: usize) -> Self {
        Self {
            bind_ip: bind_ip.into(),
            port,
            workers,
        }
    }

    /// The configured bind address text.
    #[must_use]
    pub fn bind_ip(&self) -> &str {
        &self.bind_ip
    }

    /// The configured TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The configured worker count.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Checks the configuration without binding anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr().map(|_| ())
    }

    /// Parses and validates the full endpoint.
    pub(crate) fn socket_addr(&self) -> Result<SocketAddrV4, ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let ip: Ipv4Addr = self
            .bind_ip
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress {
                addr: self.bind_ip.clone(),
            })?;
        Ok(SocketAddrV4::new(ip, self.port))
    }
}
