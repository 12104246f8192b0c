//! Error types for the challenge authentication protocol

use std::error::Error as StdError;

use http::{Method, StatusCode};
use thiserror::Error;

/// Any failure raised by the challenge authentication protocol
///
/// Transport failures are not represented here. They are returned by the
/// HTTP client unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// The server did not follow the challenge handshake
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Credentials could not be obtained for a required challenge
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// Message protection or unprotection failed
    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl Error {
    /// Whether the error is a protocol violation
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Whether the error is a failure to acquire credentials
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Whether the error is a message-security failure
    #[must_use]
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// The server response does not form a valid challenge handshake
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The unauthenticated probe returned neither 200 nor 401
    #[error("unexpected unauthorized response: probe returned {status}")]
    UnexpectedStatus {
        /// The status returned by the probe
        status: StatusCode,
    },

    /// A 401 response carried no usable challenge
    #[error("401 response did not carry a `{scheme}` challenge")]
    MissingChallenge {
        /// The expected challenge scheme
        scheme: String,
    },

    /// A challenge parameter was not a `key=value` pair
    #[error("malformed challenge parameter `{pair}`")]
    MalformedChallenge {
        /// The offending parameter
        pair: String,
    },

    /// The challenge does not name an authority to request tokens from
    #[error("challenge does not name an authority")]
    MissingAuthority,

    /// No probe request can be derived for the request method
    #[error("cannot send an authentication probe for {method} requests")]
    UnsupportedMethod {
        /// The request method
        method: Method,
    },

    /// The request body is a stream and cannot be sent more than once
    #[error("request body cannot be replayed for authentication")]
    UnreplayableRequest,

    /// The request target could not be represented as a URI
    #[error("request target `{target}` is not a valid URI")]
    InvalidTarget {
        /// The request target
        target: String,
    },
}

pub(crate) fn malformed_challenge(pair: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedChallenge { pair: pair.into() }
}

/// Credentials could not be acquired for a challenge
#[derive(Debug, Error)]
#[error("unable to acquire credentials from authority `{authority}`")]
pub struct AuthenticationError {
    authority: String,
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl AuthenticationError {
    /// Wraps a failure reported by a credential provider
    pub fn new(
        authority: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            authority: authority.into(),
            source: source.into(),
        }
    }

    /// The authority the credentials were requested from
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

/// A message could not be protected or unprotected
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecurityError {
    /// A server-advertised or proof-of-possession key could not be read
    #[error("invalid {which} key")]
    InvalidKey {
        /// Which key was rejected
        which: &'static str,
        /// The reason the key was rejected
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    /// The access token cannot be carried in an `Authorization` header
    #[error("access token contains characters not allowed in a header")]
    InvalidAccessToken(#[source] http::header::InvalidHeaderValue),

    /// Message security was negotiated, but no proof-of-possession key was provided
    #[error("message security requires a proof-of-possession key")]
    MissingPopKey,

    /// The envelope is not well formed
    #[error("malformed protected message: {reason}")]
    MalformedEnvelope {
        /// A description of the defect
        reason: &'static str,
    },

    /// The envelope signature could not be produced
    #[error("unable to sign protected message")]
    Signing(#[source] aliri::error::SigningError),

    /// The envelope signature did not verify
    #[error("protected message failed verification")]
    Verification(#[source] aliri::error::JwkVerifyError),

    /// Encryption or decryption of the message body failed
    #[error("unable to {0} message body")]
    Cipher(&'static str),

    /// The envelope timestamp lies outside the accepted window
    #[error("protected message timestamp {timestamp} is outside the accepted window")]
    Stale {
        /// The timestamp carried in the envelope
        timestamp: u64,
    },
}

pub(crate) fn invalid_key(
    which: &'static str,
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> SecurityError {
    SecurityError::InvalidKey {
        which,
        source: source.into(),
    }
}

pub(crate) const fn malformed_envelope(reason: &'static str) -> SecurityError {
    SecurityError::MalformedEnvelope { reason }
}
