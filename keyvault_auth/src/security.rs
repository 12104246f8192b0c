//! Protection of individual request/response exchanges
//!
//! A [`MessageSecurityContext`] is built for a single request attempt from
//! the credentials answering a challenge and the message-security keys the
//! server advertised alongside it. When the server advertised no keys, the
//! context only attaches a bearer token. Otherwise the request body is
//! sealed into an [`envelope`] signed with the proof-of-possession key, and
//! protected responses are verified and opened again.

use aliri::Jwk;
use aliri_clock::{Clock, System};
use bytes::{BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderValue, Method, Request, Response};
use std::fmt;

use crate::{
    error::{invalid_key, SecurityError},
    AccessToken, AuthenticationResult, Challenge,
};

pub mod envelope;

use envelope::{Claims, ContentKey};

const BEARER_PREFIX: &[u8] = b"Bearer ";
const POP_PREFIX: &[u8] = b"PoP ";
const UNPROTECTED_CONTENT_TYPE: &str = "application/json";

struct ProtectionKeys {
    content_key: ContentKey,
    server_signing_key: Jwk,
    pop_key: Jwk,
}

/// Protects one request and unprotects its response
pub struct MessageSecurityContext<C = System> {
    access_token: AccessToken,
    keys: Option<ProtectionKeys>,
    clock: C,
}

impl<C: fmt::Debug> fmt::Debug for MessageSecurityContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageSecurityContext")
            .field("access_token", &self.access_token)
            .field("protected", &self.keys.is_some())
            .field("clock", &self.clock)
            .finish()
    }
}

impl MessageSecurityContext<System> {
    /// Constructs a context from credentials and the server's message-security keys
    ///
    /// Message security is enabled only when both server keys are present.
    ///
    /// # Errors
    ///
    /// Both server keys are present, but one of them or the
    /// proof-of-possession key is missing or cannot be read.
    pub fn new(
        credentials: AuthenticationResult,
        encryption_key: Option<&str>,
        signing_key: Option<&str>,
    ) -> Result<Self, SecurityError> {
        let (access_token, pop_key) = credentials.into_parts();

        let keys = match (encryption_key, signing_key) {
            (Some(encryption_key), Some(signing_key)) => {
                let pop_key = pop_key.ok_or(SecurityError::MissingPopKey)?;
                Some(ProtectionKeys {
                    content_key: ContentKey::from_json(encryption_key)?,
                    server_signing_key: parse_jwk("signing", signing_key)?,
                    pop_key: parse_jwk("proof-of-possession", pop_key.as_str())?,
                })
            }
            (None, None) => None,
            _ => {
                tracing::warn!(
                    "server advertised only one message-security key, falling back to plain bearer"
                );
                None
            }
        };

        Ok(Self {
            access_token,
            keys,
            clock: System,
        })
    }

    /// Constructs a context using the keys carried by a challenge
    ///
    /// # Errors
    ///
    /// See [`new()`][Self::new()].
    pub fn for_challenge(
        credentials: AuthenticationResult,
        challenge: &Challenge,
    ) -> Result<Self, SecurityError> {
        Self::new(
            credentials,
            challenge.encryption_key(),
            challenge.signing_key(),
        )
    }
}

impl<C> MessageSecurityContext<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> MessageSecurityContext<D> {
        MessageSecurityContext {
            access_token: self.access_token,
            keys: self.keys,
            clock,
        }
    }

    /// Whether bodies are encrypted and signed, rather than only a token attached
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.keys.is_some()
    }

    /// Whether a response with these headers must be passed through [`unprotect()`][Self::unprotect()]
    #[must_use]
    pub fn expects_protected(&self, headers: &HeaderMap) -> bool {
        self.is_protected() && is_envelope(headers)
    }

    fn authorization(&self) -> Result<HeaderValue, SecurityError> {
        let prefix = if self.is_protected() {
            POP_PREFIX
        } else {
            BEARER_PREFIX
        };

        let token = self.access_token.as_str();
        let mut header_value = BytesMut::with_capacity(prefix.len() + token.len());
        header_value.put_slice(prefix);
        header_value.put_slice(token.as_bytes());

        let mut value = HeaderValue::from_maybe_shared(header_value.freeze())
            .map_err(SecurityError::InvalidAccessToken)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl<C: Clock> MessageSecurityContext<C> {
    /// Attaches the access token to a request, sealing its body if required
    ///
    /// The method and target of the request are never altered. Requests
    /// without a body, and reads, keep their body untouched.
    ///
    /// # Errors
    ///
    /// The token cannot be used as a header value, or the body cannot be sealed.
    pub fn protect(&self, request: Request<Bytes>) -> Result<Request<Bytes>, SecurityError> {
        let (mut parts, body) = request.into_parts();

        let body = match &self.keys {
            Some(keys) if carries_body(&parts.method, &body) => {
                let claims = Claims {
                    access_token: Some(self.access_token.clone()),
                    timestamp: self.clock.now().0,
                    method: Some(parts.method.as_str().to_owned()),
                    target: parts.uri.path_and_query().map(|pq| pq.as_str().to_owned()),
                };

                let sealed = envelope::seal(&claims, &body, &keys.content_key, &keys.pop_key)?;

                parts.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(envelope::CONTENT_TYPE),
                );
                parts.headers.remove(header::CONTENT_LENGTH);

                tracing::trace!(method = %parts.method, "sealed request body");
                Bytes::from(sealed)
            }
            _ => body,
        };

        parts.headers.insert(header::AUTHORIZATION, self.authorization()?);
        Ok(Request::from_parts(parts, body))
    }

    /// Verifies and opens a protected response
    ///
    /// Responses that were not protected are returned unchanged.
    ///
    /// # Errors
    ///
    /// The response failed verification, could not be decrypted, or is too
    /// old or too far in the future.
    pub fn unprotect(&self, response: Response<Bytes>) -> Result<Response<Bytes>, SecurityError> {
        let keys = match &self.keys {
            Some(keys) if is_envelope(response.headers()) => keys,
            _ => return Ok(response),
        };

        let (mut parts, body) = response.into_parts();
        let opened = envelope::open(&body, &keys.content_key, &keys.server_signing_key)?;

        let now = self.clock.now().0;
        if opened.claims.timestamp.abs_diff(now) > envelope::FRESHNESS_WINDOW {
            return Err(SecurityError::Stale {
                timestamp: opened.claims.timestamp,
            });
        }

        parts.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(UNPROTECTED_CONTENT_TYPE),
        );
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(opened.body.len()));

        tracing::debug!(status = %parts.status, "unprotected response");
        Ok(Response::from_parts(parts, Bytes::from(opened.body)))
    }
}

fn parse_jwk(which: &'static str, json: &str) -> Result<Jwk, SecurityError> {
    serde_json::from_str(json).map_err(|e| invalid_key(which, e))
}

fn carries_body(method: &Method, body: &Bytes) -> bool {
    !body.is_empty() && *method != Method::GET && *method != Method::HEAD
}

fn is_envelope(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with(envelope::CONTENT_TYPE))
}
