//! Fatal startup errors.
//!
//! Anything that fails before the accept loop starts ends the process with a
//! nonzero status. Each variant names the operation that failed so the log
//! line points straight at the offending call.

use crate::config::ConfigError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("open store: {0}")]
    StoreOpen(#[source] io::Error),
    #[error("socket: {0}")]
    Socket(#[source] io::Error),
    #[error("setsockopt: {0}")]
    SetSockOpt(#[source] io::Error),
    #[error("bind: {0}")]
    Bind(#[source] io::Error),
    #[error("listen: {0}")]
    Listen(#[source] io::Error),
    #[error("poll: {0}")]
    Poll(#[source] io::Error),
    #[error("daemon: {0}")]
    Daemon(#[source] io::Error),
    #[error("signal: {0}")]
    Signal(#[source] io::Error),
}

impl SetupError {
    /// Name of the failing operation, used as a structured log field.
    pub fn operation(&self) -> &'static str {
        match self {
            SetupError::Config(_) => "config",
            SetupError::StoreOpen(_) => "open",
            SetupError::Socket(_) => "socket",
            SetupError::SetSockOpt(_) => "setsockopt",
            SetupError::Bind(_) => "bind",
            SetupError::Listen(_) => "listen",
            SetupError::Poll(_) => "poll",
            SetupError::Daemon(_) => "daemon",
            SetupError::Signal(_) => "signal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_operation() {
        let err = SetupError::Bind(io::Error::from(io::ErrorKind::AddrInUse));
        assert!(err.to_string().starts_with("bind: "));
        assert_eq!(err.operation(), "bind");
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: SetupError = ConfigError::InvalidHost("nowhere".to_string()).into();
        assert_eq!(err.to_string(), "Invalid listen host 'nowhere'");
        assert_eq!(err.operation(), "config");
    }
}
