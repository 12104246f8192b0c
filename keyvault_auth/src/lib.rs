//! Challenge-based authentication for vault services
//!
//! Vault services announce how a client should authenticate by rejecting an
//! unauthenticated request with `401 Unauthorized` and a `WWW-Authenticate`
//! challenge naming the token-issuing authority, the target resource, and
//! whether proof-of-possession (PoP) tokens are supported. When the service
//! also advertises message-security keys, request and response bodies are
//! encrypted and signed end to end, independent of TLS.
//!
//! This crate holds the transport-neutral pieces of that protocol:
//!
//! * [`Challenge`] and [`challenge::parse_challenge`] to read the
//!   challenge parameters out of a `WWW-Authenticate` header.
//! * [`ChallengeCache`] and [`InMemoryChallengeCache`] to remember the last
//!   challenge observed for each origin, so that later requests can skip the
//!   unauthenticated probe.
//! * [`CredentialProvider`], the hook through which the caller actually
//!   obtains tokens. This crate never talks to an authority itself.
//! * [`MessageSecurityContext`] to protect an outgoing request and
//!   unprotect the matching response.
//!
//! The `keyvault_auth_reqwest` crate wires these together into a
//! `reqwest-middleware` middleware.
//!
//! ```
//! use keyvault_auth::{
//!     challenge::parse_challenge, AuthenticationSchema, CredentialRequest,
//! };
//!
//! let header = r#"Bearer authorization="https://login.example/tenant", resource="https://vault.example""#;
//! let challenge = parse_challenge(Some(header), "Bearer ")
//!     .unwrap()
//!     .expect("a bearer challenge");
//!
//! let request = CredentialRequest::from_challenge(&challenge).unwrap();
//! assert_eq!(request.authority, "https://login.example/tenant");
//! assert_eq!(request.resource.as_deref(), Some("https://vault.example"));
//! assert_eq!(request.schema, AuthenticationSchema::Bearer);
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod cache;
pub mod challenge;
pub mod credentials;
pub mod error;
pub mod security;

pub use braids::*;
pub use cache::{ChallengeCache, InMemoryChallengeCache};
pub use challenge::Challenge;
pub use credentials::{
    AuthenticationResult, AuthenticationSchema, CredentialProvider, CredentialRequest,
};
pub use error::{AuthenticationError, Error, ProtocolError, SecurityError};
pub use security::MessageSecurityContext;
