//! Credential acquisition in response to a challenge
//!
//! This crate does not obtain tokens itself. Instead, a [`CredentialProvider`]
//! is asked for an [`AuthenticationResult`] each time a challenge needs to be
//! answered. Providers should do their own token caching; the middleware
//! only caches challenge parameters and will call the provider once per
//! request.
//!
//! Simple providers can be built from closures:
//!
//! ```
//! use keyvault_auth::{
//!     credentials::{provider_fn, token_fn},
//!     AccessToken, AuthenticationResult, CredentialRequest,
//! };
//!
//! let full = provider_fn(|req: CredentialRequest| async move {
//!     Ok::<_, std::io::Error>(AuthenticationResult::bearer(AccessToken::from(
//!         format!("token-for-{}", req.authority),
//!     )))
//! });
//!
//! let token_only = token_fn(|_: CredentialRequest| async {
//!     Ok::<_, std::io::Error>(AccessToken::from_static("opaque"))
//! });
//! # let _ = (full, token_only);
//! ```

use std::{error, fmt, future::Future, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{AuthenticationError, Error, ProtocolError},
    AccessToken, AccessTokenRef, Challenge, PopKey, PopKeyRef,
};

/// The kind of token requested from an authority
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AuthenticationSchema {
    /// A plain bearer token
    Bearer,
    /// A proof-of-possession token bound to a key held by the client
    Pop,
}

impl AuthenticationSchema {
    /// The wire name of the schema
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::Pop => "pop",
        }
    }
}

impl fmt::Display for AuthenticationSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parameters a provider needs to answer a challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRequest {
    /// The URL of the authority to request a token from
    pub authority: String,
    /// The resource the token is for
    pub resource: Option<String>,
    /// The scope the token is for
    pub scope: Option<String>,
    /// The kind of token to request
    pub schema: AuthenticationSchema,
}

impl CredentialRequest {
    /// Derives a credential request from a challenge
    ///
    /// # Errors
    ///
    /// Fails if the challenge does not name an authority.
    pub fn from_challenge(challenge: &Challenge) -> Result<Self, ProtocolError> {
        let authority = challenge
            .authority()
            .ok_or(ProtocolError::MissingAuthority)?;

        Ok(Self {
            authority: authority.to_owned(),
            resource: challenge.resource().map(str::to_owned),
            scope: challenge.scope().map(str::to_owned),
            schema: challenge.schema(),
        })
    }
}

/// An access token and the proof-of-possession key bound to it
#[derive(Clone, Debug)]
pub struct AuthenticationResult {
    access_token: AccessToken,
    pop_key: Option<PopKey>,
}

impl AuthenticationResult {
    /// Constructs a result from a token and its proof-of-possession key
    pub fn new(access_token: AccessToken, pop_key: PopKey) -> Self {
        Self {
            access_token,
            pop_key: Some(pop_key),
        }
    }

    /// Constructs a result holding only a bearer token
    pub fn bearer(access_token: AccessToken) -> Self {
        Self {
            access_token,
            pop_key: None,
        }
    }

    /// The access token
    #[must_use]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// The proof-of-possession key, if any
    #[must_use]
    pub fn pop_key(&self) -> Option<&PopKeyRef> {
        self.pop_key.as_deref()
    }

    /// Splits the result into its parts
    pub fn into_parts(self) -> (AccessToken, Option<PopKey>) {
        (self.access_token, self.pop_key)
    }
}

/// A source of credentials for answering challenges
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The error type returned if credentials cannot be acquired
    type Error: error::Error + Send + Sync + 'static;

    /// Acquires credentials for the given challenge parameters
    ///
    /// May be called repeatedly, once per challenge that needs answering.
    async fn acquire(&self, request: CredentialRequest)
        -> Result<AuthenticationResult, Self::Error>;
}

#[async_trait]
impl<P: CredentialProvider + ?Sized> CredentialProvider for Arc<P> {
    type Error = P::Error;

    async fn acquire(
        &self,
        request: CredentialRequest,
    ) -> Result<AuthenticationResult, Self::Error> {
        (**self).acquire(request).await
    }
}

/// Asks a provider for credentials answering a challenge
///
/// # Errors
///
/// The challenge names no authority or the provider fails. Also fails if the
/// provider returns an empty access token, or returns no proof-of-possession
/// key although the challenge requires message security.
pub async fn acquire_for_challenge<P>(
    provider: &P,
    challenge: &Challenge,
) -> Result<AuthenticationResult, Error>
where
    P: CredentialProvider + ?Sized,
{
    let request = CredentialRequest::from_challenge(challenge)?;
    let authority = request.authority.clone();

    tracing::debug!(%authority, schema = %request.schema, "acquiring credentials for challenge");

    let result = provider
        .acquire(request)
        .await
        .map_err(|e| AuthenticationError::new(authority.as_str(), e))?;

    if result.access_token().as_str().is_empty() {
        return Err(AuthenticationError::new(
            authority,
            "credential provider returned an empty access token",
        )
        .into());
    }

    let requires_pop = challenge.encryption_key().is_some() && challenge.signing_key().is_some();
    if requires_pop && result.pop_key().is_none() {
        return Err(AuthenticationError::new(
            authority,
            "credential provider returned no proof-of-possession key for a message-security challenge",
        )
        .into());
    }

    Ok(result)
}

/// A credential provider backed by an async closure
#[derive(Clone, Copy)]
pub struct ProviderFn<F>(F);

impl<F> fmt::Debug for ProviderFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderFn")
    }
}

/// Creates a credential provider from an async closure
pub fn provider_fn<F, Fut, E>(f: F) -> ProviderFn<F>
where
    F: Fn(CredentialRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AuthenticationResult, E>> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    ProviderFn(f)
}

#[async_trait]
impl<F, Fut, E> CredentialProvider for ProviderFn<F>
where
    F: Fn(CredentialRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AuthenticationResult, E>> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn acquire(
        &self,
        request: CredentialRequest,
    ) -> Result<AuthenticationResult, Self::Error> {
        (self.0)(request).await
    }
}

/// A credential provider that only issues access tokens
///
/// Requests answered by this provider can never use message security, as
/// no proof-of-possession key is available.
#[derive(Clone, Copy)]
pub struct TokenOnly<F>(F);

impl<F> fmt::Debug for TokenOnly<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenOnly")
    }
}

/// Creates a credential provider from an async closure returning a token
pub fn token_fn<F, Fut, E>(f: F) -> TokenOnly<F>
where
    F: Fn(CredentialRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AccessToken, E>> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    TokenOnly(f)
}

#[async_trait]
impl<F, Fut, E> CredentialProvider for TokenOnly<F>
where
    F: Fn(CredentialRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AccessToken, E>> + Send + 'static,
    E: error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn acquire(
        &self,
        request: CredentialRequest,
    ) -> Result<AuthenticationResult, Self::Error> {
        (self.0)(request).await.map(AuthenticationResult::bearer)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::challenge::{parse_challenge, BEARER_SCHEME};

    fn challenge(header: &str) -> Challenge {
        parse_challenge(Some(header), BEARER_SCHEME)
            .unwrap()
            .unwrap()
    }

    mod credential_request {
        use super::*;

        #[test]
        fn carries_all_challenge_parameters() {
            let request = CredentialRequest::from_challenge(&challenge(
                r#"Bearer authorization="https://login.example/t", resource="https://vault.example", scope="vault.all", supportspop="true""#,
            ))
            .unwrap();

            assert_eq!(
                request,
                CredentialRequest {
                    authority: "https://login.example/t".into(),
                    resource: Some("https://vault.example".into()),
                    scope: Some("vault.all".into()),
                    schema: AuthenticationSchema::Pop,
                }
            );
        }

        #[test]
        fn requires_an_authority() {
            let err = CredentialRequest::from_challenge(&Challenge::default()).unwrap_err();
            assert!(matches!(err, ProtocolError::MissingAuthority));
        }
    }

    mod providers {
        use super::*;

        #[tokio::test]
        async fn provider_fn_passes_request_through() {
            let provider = provider_fn(|req: CredentialRequest| async move {
                Ok::<_, io::Error>(AuthenticationResult::new(
                    AccessToken::new(format!("{}|{}", req.authority, req.schema)),
                    PopKey::from_static("{}"),
                ))
            });

            let result = provider
                .acquire(CredentialRequest::from_challenge(&challenge(
                    r#"Bearer authorization="https://login.example""#,
                ))
                .unwrap())
                .await
                .unwrap();

            assert_eq!(
                result.access_token().as_str(),
                "https://login.example|bearer"
            );
            assert!(result.pop_key().is_some());
        }

        #[tokio::test]
        async fn token_only_has_no_pop_key() {
            let provider = Arc::new(token_fn(|_: CredentialRequest| async {
                Ok::<_, io::Error>(AccessToken::from_static("opaque"))
            }));

            let result = provider
                .acquire(CredentialRequest::from_challenge(&challenge(
                    r#"Bearer authorization="https://login.example""#,
                ))
                .unwrap())
                .await
                .unwrap();

            assert_eq!(result.access_token().as_str(), "opaque");
            assert!(result.pop_key().is_none());
        }

        #[tokio::test]
        async fn provider_failures_are_returned() {
            let provider = provider_fn(|_: CredentialRequest| async {
                Err::<AuthenticationResult, _>(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "denied",
                ))
            });

            let err = provider
                .acquire(CredentialRequest::from_challenge(&challenge(
                    r#"Bearer authorization="https://login.example""#,
                ))
                .unwrap())
                .await
                .unwrap_err();

            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        }
    }

    mod acquire_for_challenge {
        use super::*;

        #[tokio::test]
        async fn wraps_provider_failures_as_authentication_errors() {
            let provider = provider_fn(|_: CredentialRequest| async {
                Err::<AuthenticationResult, _>(io::Error::new(io::ErrorKind::Other, "offline"))
            });

            let err = acquire_for_challenge(
                &provider,
                &challenge(r#"Bearer authorization="https://login.example""#),
            )
            .await
            .unwrap_err();

            match err {
                Error::Authentication(e) => assert_eq!(e.authority(), "https://login.example"),
                other => panic!("unexpected error: {}", other),
            }
        }

        #[tokio::test]
        async fn rejects_empty_tokens() {
            let provider = token_fn(|_: CredentialRequest| async {
                Ok::<_, io::Error>(AccessToken::from_static(""))
            });

            let err = acquire_for_challenge(
                &provider,
                &challenge(r#"Bearer authorization="https://login.example""#),
            )
            .await
            .unwrap_err();

            assert!(err.is_authentication());
        }

        #[tokio::test]
        async fn requires_a_pop_key_when_server_advertises_keys() {
            let provider = token_fn(|_: CredentialRequest| async {
                Ok::<_, io::Error>(AccessToken::from_static("opaque"))
            });
            let mut challenge = challenge(r#"Bearer authorization="https://login.example""#);
            challenge.insert(crate::challenge::ENCRYPTION_KEY_HEADER, "{}");
            challenge.insert(crate::challenge::SIGNING_KEY_HEADER, "{}");

            let err = acquire_for_challenge(&provider, &challenge)
                .await
                .unwrap_err();

            match err {
                Error::Authentication(e) => assert_eq!(e.authority(), "https://login.example"),
                other => panic!("unexpected error: {}", other),
            }
        }

        #[tokio::test]
        async fn accepts_bearer_tokens_when_server_advertises_one_key() {
            let provider = token_fn(|_: CredentialRequest| async {
                Ok::<_, io::Error>(AccessToken::from_static("opaque"))
            });
            let mut challenge = challenge(r#"Bearer authorization="https://login.example""#);
            challenge.insert(crate::challenge::SIGNING_KEY_HEADER, "{}");

            let result = acquire_for_challenge(&provider, &challenge).await.unwrap();

            assert!(result.pop_key().is_none());
        }

        #[tokio::test]
        async fn does_not_call_provider_without_authority() {
            use std::sync::atomic::{AtomicBool, Ordering};

            let called = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&called);
            let provider = provider_fn(move |_: CredentialRequest| {
                flag.store(true, Ordering::SeqCst);
                async {
                    Ok::<_, io::Error>(AuthenticationResult::bearer(AccessToken::from_static(
                        "never",
                    )))
                }
            });

            let err = acquire_for_challenge(&provider, &Challenge::default())
                .await
                .unwrap_err();

            assert!(err.is_protocol());
            assert!(!called.load(Ordering::SeqCst));
        }
    }
}
