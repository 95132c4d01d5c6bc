//! Error type shared by every registry operation.
//!
//! Errors are `Clone` so the one-shot steps (inherit, start, kill) can hand
//! the same failure to every caller. OS errors are kept behind an `Arc`.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("cannot resolve {network} address {address:?}: {reason}")]
    Resolve {
        network: String,
        address: String,
        reason: String,
    },

    #[error("found invalid count value: {key}={value}")]
    Config { key: &'static str, value: String },

    #[error("error inheriting socket fd {fd}: {source}")]
    Inherit {
        fd: RawFd,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("listen {network} {address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("cannot extract descriptor from listener fd {fd}: {source}")]
    DescriptorExtraction {
        fd: RawFd,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("cannot locate executable {program:?}: {source}")]
    PathResolution {
        program: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("cannot start process {program:?}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("cannot send signal {signal} to pid {pid}: {source}")]
    Signal {
        pid: i32,
        signal: i32,
        #[source]
        source: Arc<io::Error>,
    },
}

impl Error {
    pub(crate) fn inherit(fd: RawFd, source: io::Error) -> Self {
        Error::Inherit {
            fd,
            source: Arc::new(source),
        }
    }

    pub(crate) fn bind(network: impl ToString, address: impl ToString, source: io::Error) -> Self {
        Error::Bind {
            network: network.to_string(),
            address: address.to_string(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn resolve(
        network: impl ToString,
        address: impl ToString,
        reason: impl ToString,
    ) -> Self {
        Error::Resolve {
            network: network.to_string(),
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The underlying OS error, when there is one.
    ///
    /// Bind failures keep the error from the `bind`/`listen` call untouched,
    /// so callers can match on [`io::ErrorKind::AddrInUse`] and friends.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            Error::Inherit { source, .. }
            | Error::Bind { source, .. }
            | Error::DescriptorExtraction { source, .. }
            | Error::PathResolution { source, .. }
            | Error::Launch { source, .. }
            | Error::Signal { source, .. } => Some(source.as_ref()),
            Error::UnknownNetwork(_) | Error::Resolve { .. } | Error::Config { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = Error::Config {
            key: "LISTEN_FDS",
            value: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "found invalid count value: LISTEN_FDS=abc");
        assert!(err.io_error().is_none());
    }

    #[test]
    fn test_bind_error_keeps_io_kind() {
        let err = Error::bind(
            "tcp",
            ":9000",
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(err.to_string().starts_with("listen tcp :9000: "));
        assert_eq!(
            err.io_error().map(io::Error::kind),
            Some(io::ErrorKind::AddrInUse)
        );

        // Replayed clones share the same OS error.
        let replay = err.clone();
        assert_eq!(
            replay.io_error().map(io::Error::kind),
            Some(io::ErrorKind::AddrInUse)
        );
    }
}
