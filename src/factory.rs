//! Process-wide, one-shot initialization of the network stack.
//!
//! The underlying event library's process setup must happen exactly once, so
//! [`NetFactory::init`] guards itself with a global flag and every later call
//! fails. The factory is then the only way to construct an
//! [`Acceptor`](crate::acceptor::Acceptor).

use crate::acceptor::Acceptor;
use crate::config::{ConfigError, ListenConfig};
use crate::handler::ProtocolHandler;
use mio::{Poll, Token, Waker};
use std::sync::atomic::{AtomicBool, Ordering};

static STACK_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// One-shot initializer and acceptor constructor.
///
/// ```ignore
/// use shardnet::{ListenConfig, NetFactory};
///
/// let factory = NetFactory::init()?;
/// let acceptor = factory.listen(
///     ListenConfig::new("0.0.0.0", 8085, 4),
///     || MyGameHandler::new(),
/// )?;
/// ```
#[derive(Debug)]
pub struct NetFactory {
    _private: (),
}

impl NetFactory {
    /// Initializes the stack. A second call in the same process returns
    /// [`ConfigError::AlreadyInitialized`]; a reactor probe failure is fatal
    /// for the process's networking and is reported as
    /// [`ConfigError::Reactor`].
    pub fn init() -> Result<Self, ConfigError> {
        if STACK_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyInitialized);
        }
        // Probe the OS event facility once, so a missing epoll/kqueue shows
        // up here rather than as a confusing per-acceptor failure later.
        let probe = Poll::new()?;
        let _waker = Waker::new(probe.registry(), Token(0))?;
        tracing::debug!("network stack initialized");
        Ok(Self { _private: () })
    }

    /// Binds an acceptor for the given endpoint; `handler_factory` is invoked
    /// once per accepted connection to build its protocol handler.
    pub fn listen<H, F>(
        &self,
        config: ListenConfig,
        handler_factory: F,
    ) -> Result<Acceptor<H>, ConfigError>
    where
        H: ProtocolHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Acceptor::bind(&config, handler_factory)
    }
}
