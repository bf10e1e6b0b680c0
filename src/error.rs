use std::error;
use std::fmt;
use std::os::raw::c_int;

/// The error type tree builders use to abort a parse.
///
/// Anything a [`crate::TreeBuilder`] returns in here travels back to the caller of
/// [`crate::Session::feed`] untouched, as the `source` of [`Error::HostCallback`].
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Everything that can go wrong during a [`crate::Session`].
///
/// None of these are retryable: once a session returned an error it has to be abandoned. Misuse
/// of the session API itself (feeding after `end()`, calling `end()` twice, removing a detached
/// node in the default tree builder) is a programming error and panics with a message starting
/// with `precondition violation` instead.
#[derive(Debug)]
pub enum Error {
    /// The parser refused to construct, `new_parser` returned a null pointer.
    ConstructionFailure,

    /// The parser returned a failure status while no error from the tree builder was pending.
    ///
    /// This means the parser side broke one of its own invariants (or panicked), there is nothing
    /// the caller can do about it.
    ForeignFault {
        /// The parser entry point that failed, `"feed"` or `"end"`.
        operation: &'static str,
        /// The raw status code, always negative.
        status: c_int,
    },

    /// The tree builder returned an error from inside one of the parser's callbacks.
    ///
    /// The error could not propagate through the parser's stack frames, so it was held back until
    /// control returned to the session.
    HostCallback {
        /// Name of the callback that failed, e.g. `"append_node"`.
        callback: &'static str,
        /// The original error, as returned by the tree builder.
        source: BoxError,
    },
}

impl Error {
    /// Get the error originally returned by the tree builder, if this is a
    /// [`Error::HostCallback`].
    #[must_use]
    pub fn into_host_error(self) -> Option<BoxError> {
        match self {
            Error::HostCallback { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConstructionFailure => f.write_str("the parser could not be constructed"),
            Error::ForeignFault { operation, status } => {
                write!(f, "parser failed during {} with status {}", operation, status)
            }
            Error::HostCallback { callback, source } => {
                write!(f, "tree builder failed in {}: {}", callback, source)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::HostCallback { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

#[test]
fn test_host_error_is_source() {
    let err = Error::HostCallback {
        callback: "append_node",
        source: "no room".into(),
    };
    assert_eq!(err.to_string(), "tree builder failed in append_node: no room");
    assert_eq!(
        error::Error::source(&err).map(ToString::to_string),
        Some("no room".to_owned())
    );
    assert_eq!(err.into_host_error().unwrap().to_string(), "no room");
}
