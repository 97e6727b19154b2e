#[macro_use]
extern crate enum_display_derive;

pub use config::SyncConfig;
pub use p2p::PeerId;

pub mod config;
pub mod p2p;
pub mod sync;

use std::fmt::{self, Debug, Display};

use errors::{Error, ErrorKind};
use failure::{err_msg, Backtrace, Context, Fail};
use slog::Drain;

/// Builds the root logger used by the sync service, a compact terminal
/// drain behind an async buffer.
pub fn stdout_logger(log_level: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build();
    let drain = match log_level {
        "trace" => drain.filter_level(slog::Level::Trace),
        "debug" => drain.filter_level(slog::Level::Debug),
        "warn" => drain.filter_level(slog::Level::Warning),
        "error" => drain.filter_level(slog::Level::Error),
        "crit" => drain.filter_level(slog::Level::Critical),
        _ => drain.filter_level(slog::Level::Info),
    };

    slog::Logger::root(drain.fuse(), slog::o!())
}

//////////////////////////////////////////////////////////////////
#[derive(Debug)]
pub struct SyncError {
    kind: Context<SyncErrorKind>,
}

#[derive(Debug, Clone, Eq, PartialEq, Display)]
pub enum SyncErrorKind {
    /// Network or peer-side failure; recovered by retrying on another peer.
    Transport,
    /// The peer negotiated an unsupported protocol.
    BadProtocol,
    /// A response is missing a header that the request asked for.
    IncompleteHeader,
    /// A response is missing a body or justification that the request asked for.
    IncompleteBlockData,
    /// Adjacent blocks of a response do not form a parent/child chain.
    NonContiguousChain,
    /// A response contains a blacklisted block.
    BadBlock,
    /// The announced block is already tracked in the pending set.
    AlreadyInSet,
    /// The parent of a block to import is not in local state.
    FailedToGetParent,
    /// Header or justification verification failed.
    Verification,
    /// The runtime rejected the block.
    Execution,
    /// A storage or block-state lookup failed.
    State,
    /// The block state is paused and not accepting sync requests.
    Paused,
    /// Shutdown did not drain within its deadline.
    StopTimeout,
}

impl SyncErrorKind {
    /// Errors that never escape an assembler cycle; the request is retried
    /// on a different peer.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncErrorKind::Transport
            | SyncErrorKind::BadProtocol
            | SyncErrorKind::IncompleteHeader
            | SyncErrorKind::IncompleteBlockData
            | SyncErrorKind::NonContiguousChain
            | SyncErrorKind::BadBlock => true,
            _ => false,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(cause) = self.cause() {
            write!(f, "{}({})", self.kind(), cause)
        } else {
            write!(f, "{}", self.kind())
        }
    }
}

impl From<SyncError> for Error {
    fn from(error: SyncError) -> Self {
        error.context(ErrorKind::Sync).into()
    }
}

impl From<SyncErrorKind> for SyncError {
    fn from(kind: SyncErrorKind) -> Self {
        SyncError {
            kind: Context::new(kind),
        }
    }
}

impl SyncErrorKind {
    pub fn cause<F: Fail>(self, cause: F) -> SyncError {
        SyncError {
            kind: cause.context(self),
        }
    }

    pub fn reason<S: Display + Debug + Sync + Send + 'static>(self, reason: S) -> SyncError {
        SyncError {
            kind: err_msg(reason).compat().context(self),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> &SyncErrorKind {
        self.kind.get_context()
    }
}

impl Fail for SyncError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.kind.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.kind.backtrace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert!(SyncErrorKind::Transport.is_recoverable());
        assert!(SyncErrorKind::BadBlock.is_recoverable());
        assert!(!SyncErrorKind::Execution.is_recoverable());
        assert!(!SyncErrorKind::Paused.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err: SyncError = SyncErrorKind::FailedToGetParent.into();
        assert_eq!(format!("{}", err), "FailedToGetParent");

        let err = SyncErrorKind::State.reason("disk failure");
        assert_eq!(format!("{}", err), "State(disk failure)");
    }
}
