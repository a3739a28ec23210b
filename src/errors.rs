//! Library error types.

use thiserror::Error;

/// Crate-wide result alias, normally returning an [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while loading and verifying a user's
/// identity state.
///
/// Each variant carries a message, never a backtrace. GPG listing
/// problems keep their own type so the line number survives.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: bad JSON, bad hex, a field that failed to decode.
    #[error("parse error: {0}")]
    Parse(String),

    /// A GPG listing line that could not be handled.
    #[error(transparent)]
    GpgIndex(#[from] GpgIndexError),

    /// Requested KID or fingerprint has no entry in the key family.
    #[error("no key: {0}")]
    NoKey(String),

    /// The entry exists but is unusable (unknown algorithm, revoked,
    /// not a sibkey where a sibkey is required, import failed).
    #[error("bad key: {0}")]
    BadKey(String),

    /// Structural inconsistency in an imported key family.
    #[error("key family error: {0}")]
    KeyFamily(String),

    /// Link-to-link integrity failure.
    #[error("chain error: {0}")]
    Chain(String),

    /// The server's view of the chain cannot be reconciled with ours.
    #[error("server chain error: {0}")]
    ServerChain(String),

    /// The chain does not bind to the claimed (uid, username).
    #[error("identity error: {0}")]
    Identity(String),

    /// A revocation referenced a sigid that was never a delegation.
    #[error("bad revocation: {0}")]
    BadRevocation(String),

    /// HTTP or subprocess failure from a collaborator.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// A line of a GPG listing that could not be handled.
///
/// These are usually downgraded to [`Warning`]s by the index parser so
/// one odd line does not sink the whole listing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("gpg listing line {lineno}: {msg}")]
pub struct GpgIndexError {
    /// 1-based line number in the listing.
    pub lineno: usize,

    /// What was wrong with it.
    pub msg: String,
}

impl GpgIndexError {
    pub fn new(lineno: usize, msg: impl Into<String>) -> Self {
        Self {
            lineno,
            msg: msg.into(),
        }
    }
}

/// A non-fatal problem noted while parsing.
#[derive(Debug, Clone)]
pub struct Warning(String);

impl Warning {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<Error> for Warning {
    fn from(err: Error) -> Self {
        Warning(err.to_string())
    }
}

impl From<GpgIndexError> for Warning {
    fn from(err: GpgIndexError) -> Self {
        Warning(err.to_string())
    }
}

/// Warnings accumulated across a parse, for later inspection.
#[derive(Debug, Clone, Default)]
pub struct Warnings(Vec<Warning>);

impl Warnings {
    pub fn push(&mut self, w: Warning) {
        self.0.push(w);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpg_index_error_display() {
        let err = GpgIndexError::new(7, "too few fields");
        assert_eq!(format!("{err}"), "gpg listing line 7: too few fields");
        let err: Error = err.into();
        assert_eq!(format!("{err}"), "gpg listing line 7: too few fields");
    }

    #[test]
    fn test_error_display() {
        let err = Error::ServerChain("version-rollback suspected".into());
        assert_eq!(
            format!("{err}"),
            "server chain error: version-rollback suspected"
        );
    }

    #[test]
    fn test_warnings_accumulate() {
        let mut w = Warnings::default();
        assert!(w.is_empty());
        w.push(Warning::new("odd record"));
        w.push(Error::Parse("bad hex".into()).into());
        assert_eq!(w.len(), 2);
        assert_eq!(w.iter().next().unwrap().message(), "odd record");
    }
}
