// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use tankd_core::TankdError;
use thiserror::Error;

/// Failure classes reported by the ZFS adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZfsErrorKind {
    NotFound,
    Busy,
    Exists,
    CryptoKeyMissing,
    CryptoWrongKey,
    ChildPresent,
    ReadOnly,
    Io,
}

impl ZfsErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZfsErrorKind::NotFound => "NOT_FOUND",
            ZfsErrorKind::Busy => "BUSY",
            ZfsErrorKind::Exists => "EXISTS",
            ZfsErrorKind::CryptoKeyMissing => "CRYPTO_KEY_MISSING",
            ZfsErrorKind::CryptoWrongKey => "CRYPTO_WRONG_KEY",
            ZfsErrorKind::ChildPresent => "CHILD_PRESENT",
            ZfsErrorKind::ReadOnly => "READ_ONLY",
            ZfsErrorKind::Io => "IO",
        }
    }
}

/// Error type for ZFS and host operations
#[derive(Error, Debug, Diagnostic)]
pub enum ZfsError {
    #[error("{name}: dataset does not exist")]
    #[diagnostic(
        code(tankd::zfs::not_found),
        help("Verify the dataset exists with `zfs list`")
    )]
    NotFound {
        #[allow(unused)]
        name: String,
    },

    #[error("{name}: {message}")]
    #[diagnostic(
        code(tankd::zfs::busy),
        help("Stop processes using the dataset, or retry with force")
    )]
    Busy {
        #[allow(unused)]
        name: String,
        #[allow(unused)]
        message: String,
    },

    #[error("{name}: dataset already exists")]
    #[diagnostic(code(tankd::zfs::exists), help("Choose a different name"))]
    Exists {
        #[allow(unused)]
        name: String,
    },

    #[error("{name}: encryption key not loaded")]
    #[diagnostic(
        code(tankd::zfs::crypto_key_missing),
        help("Load the key of the encryption root first")
    )]
    CryptoKeyMissing {
        #[allow(unused)]
        name: String,
    },

    #[error("{name}: incorrect key provided")]
    #[diagnostic(
        code(tankd::zfs::crypto_wrong_key),
        help("Double-check the key or passphrase")
    )]
    CryptoWrongKey {
        #[allow(unused)]
        name: String,
    },

    #[error("cannot destroy '{name}': filesystem has children")]
    #[diagnostic(
        code(tankd::zfs::child_present),
        help("Destroy recursively or remove the children first")
    )]
    ChildPresent {
        #[allow(unused)]
        name: String,
    },

    #[error("{name}: dataset is read-only")]
    #[diagnostic(
        code(tankd::zfs::read_only),
        help("Turn off the readonly property first")
    )]
    ReadOnly {
        #[allow(unused)]
        name: String,
    },

    #[error("{property}: {message}")]
    #[diagnostic(
        code(tankd::zfs::invalid_property),
        help("Check the property name and accepted values with `zfs get`")
    )]
    InvalidProperty {
        #[allow(unused)]
        property: String,
        #[allow(unused)]
        message: String,
    },

    #[error("Invalid argument: {message}")]
    #[diagnostic(code(tankd::zfs::invalid_argument), help("{message}"))]
    InvalidArgument {
        #[allow(unused)]
        message: String,
    },

    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(tankd::zfs::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    #[error("I/O error: {message}")]
    #[diagnostic(
        code(tankd::zfs::io),
        help("Check filesystem permissions and the system log")
    )]
    Io {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, ZfsError>;

impl ZfsError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn busy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Busy {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn exists(name: impl Into<String>) -> Self {
        Self::Exists { name: name.into() }
    }

    pub fn crypto_key_missing(name: impl Into<String>) -> Self {
        Self::CryptoKeyMissing { name: name.into() }
    }

    pub fn crypto_wrong_key(name: impl Into<String>) -> Self {
        Self::CryptoWrongKey { name: name.into() }
    }

    pub fn child_present(name: impl Into<String>) -> Self {
        Self::ChildPresent { name: name.into() }
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        Self::ReadOnly { name: name.into() }
    }

    pub fn invalid_property(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidProperty {
            property: property.into(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Adapter failure class
    pub fn kind(&self) -> ZfsErrorKind {
        match self {
            ZfsError::NotFound { .. } => ZfsErrorKind::NotFound,
            ZfsError::Busy { .. } => ZfsErrorKind::Busy,
            ZfsError::Exists { .. } => ZfsErrorKind::Exists,
            ZfsError::CryptoKeyMissing { .. } => ZfsErrorKind::CryptoKeyMissing,
            ZfsError::CryptoWrongKey { .. } => ZfsErrorKind::CryptoWrongKey,
            ZfsError::ChildPresent { .. } => ZfsErrorKind::ChildPresent,
            ZfsError::ReadOnly { .. } => ZfsErrorKind::ReadOnly,
            ZfsError::InvalidProperty { .. }
            | ZfsError::InvalidArgument { .. }
            | ZfsError::CommandFailed { .. }
            | ZfsError::Io { .. } => ZfsErrorKind::Io,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ZfsErrorKind::NotFound
    }
}

impl From<std::io::Error> for ZfsError {
    fn from(err: std::io::Error) -> Self {
        ZfsError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<ZfsError> for TankdError {
    fn from(err: ZfsError) -> Self {
        let message = err.to_string();
        match err {
            ZfsError::NotFound { .. } => TankdError::not_found(message),
            ZfsError::Busy { name, .. } => TankdError::busy(message, vec![name]),
            ZfsError::ChildPresent { name } => TankdError::busy(message, vec![name]),
            ZfsError::Exists { .. } => TankdError::exists(message),
            ZfsError::CryptoKeyMissing { .. } => TankdError::crypto_key_missing(message),
            ZfsError::CryptoWrongKey { .. } => TankdError::crypto_key_invalid(message),
            ZfsError::InvalidProperty { property, message } => {
                TankdError::validation(property, message)
            }
            other => TankdError::external(message, Some(Box::new(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tankd_core::ErrorKind;

    #[test]
    fn test_kinds_map_into_taxonomy() {
        let cases: Vec<(ZfsError, ErrorKind)> = vec![
            (ZfsError::not_found("tank/x"), ErrorKind::NotFound),
            (ZfsError::busy("tank/x", "pool is busy"), ErrorKind::Busy),
            (ZfsError::child_present("tank/x"), ErrorKind::Busy),
            (ZfsError::exists("tank/x"), ErrorKind::Exists),
            (ZfsError::crypto_key_missing("tank/x"), ErrorKind::CryptoKeyMissing),
            (ZfsError::crypto_wrong_key("tank/x"), ErrorKind::CryptoKeyInvalid),
            (ZfsError::read_only("tank/x"), ErrorKind::External),
            (
                ZfsError::invalid_property("compression", "bad value"),
                ErrorKind::Validation,
            ),
            (ZfsError::io("disk gone"), ErrorKind::External),
        ];
        for (err, expected) in cases {
            let converted: TankdError = err.into();
            assert_eq!(converted.kind(), expected);
        }
    }

    #[test]
    fn test_child_present_message() {
        let err = ZfsError::child_present("tank/a");
        assert_eq!(err.kind().as_str(), "CHILD_PRESENT");
        assert_eq!(
            err.to_string(),
            "cannot destroy 'tank/a': filesystem has children"
        );
    }
}
