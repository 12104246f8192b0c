//! Middleware to answer authentication challenges on outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`ChallengeAuthMiddleware`] in the middleware stack to have
//! each outbound request authenticated against the challenge its server
//! issues. The first request to an origin is preceded by an unauthenticated
//! probe; the challenge it returns is cached per origin and answered with
//! credentials from a [`CredentialProvider`].
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the request is sent as it is,
//! allowing overrides to be specified as required.
//!
//! ```
//! use keyvault_auth::{credentials::token_fn, AccessToken};
//! use keyvault_auth_reqwest::ChallengeAuthMiddleware;
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! let provider = token_fn(|_request| async {
//!     Ok::<_, std::io::Error>(AccessToken::from_static("token"))
//! });
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(ChallengeAuthMiddleware::new(provider))
//!     .build();
//! ```
//!
//! The middleware can also be configured to authenticate requests only
//! conditionally. These predicates can be composed together to evaluate
//! more complex requirements prior to authenticating a request.
//!
//! ```
//! use keyvault_auth::{credentials::token_fn, AccessToken};
//! use keyvault_auth_reqwest::{ChallengeAuthMiddleware, ExactHostMatch, HttpsOnly};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! # let provider = token_fn(|_request| async {
//! #     Ok::<_, std::io::Error>(AccessToken::from_static("token"))
//! # });
//! ChallengeAuthMiddleware::new(provider)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("myvault.vault.azure.net")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use aliri_clock::{Clock, System};
use keyvault_auth::{
    credentials, Challenge, ChallengeCache, CredentialProvider, InMemoryChallengeCache,
    MessageSecurityContext, Origin, OriginRef, ProtocolError,
};
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{self, HeaderValue},
    Body, Method, Request, Response, StatusCode, Url,
};
use reqwest_middleware::{Middleware, Next, Result};

mod exchange;

pub use exchange::ProtectedExchange;

/// Body sent with probes for requests that carry a body
const PROBE_BODY: &str = "{}";

/// A middleware that authenticates outgoing requests by answering the
/// server's authentication challenge
#[derive(Debug)]
pub struct ChallengeAuthMiddleware<P, C = InMemoryChallengeCache, Pr = HttpsOnly, K = System> {
    provider: P,
    cache: Arc<C>,
    predicate: Pr,
    clock: K,
}

impl<P: Clone, C, Pr: Clone, K: Clone> Clone for ChallengeAuthMiddleware<P, C, Pr, K> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            cache: Arc::clone(&self.cache),
            predicate: self.predicate.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<P> ChallengeAuthMiddleware<P> {
    /// Construct a new middleware from a credential provider
    ///
    /// By default, challenges are cached in a fresh in-memory cache, and
    /// requests are only authenticated if they are being sent via HTTPS. To
    /// change this behavior, provide a shared cache with
    /// [`with_cache()`][Self::with_cache()] or a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cache: Arc::new(InMemoryChallengeCache::new()),
            predicate: HttpsOnly,
            clock: System,
        }
    }
}

impl<P, C, Pr, K> ChallengeAuthMiddleware<P, C, Pr, K> {
    /// Replaces the challenge cache, allowing it to be shared between clients
    pub fn with_cache<D>(self, cache: Arc<D>) -> ChallengeAuthMiddleware<P, D, Pr, K> {
        ChallengeAuthMiddleware {
            provider: self.provider,
            cache,
            predicate: self.predicate,
            clock: self.clock,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> ChallengeAuthMiddleware<P, C, Q, K> {
        ChallengeAuthMiddleware {
            provider: self.provider,
            cache: self.cache,
            predicate,
            clock: self.clock,
        }
    }

    /// Replaces the clock used to timestamp protected messages
    pub fn with_clock<L>(self, clock: L) -> ChallengeAuthMiddleware<P, C, Pr, L> {
        ChallengeAuthMiddleware {
            provider: self.provider,
            cache: self.cache,
            predicate: self.predicate,
            clock,
        }
    }

    /// The cache holding the challenges seen so far
    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }
}

impl<P, C, Pr, K> ChallengeAuthMiddleware<P, C, Pr, K>
where
    P: CredentialProvider,
    C: ChallengeCache,
    K: Clock + Clone,
{
    /// Extracts the challenge from a 401 response and caches it for `origin`
    fn refresh_challenge(
        &self,
        origin: &OriginRef,
        response: &Response,
    ) -> std::result::Result<Challenge, ProtocolError> {
        let challenge = Challenge::from_headers(response.headers())?;

        tracing::debug!(
            %origin,
            authority = challenge.authority().unwrap_or_default(),
            protected = challenge.encryption_key().is_some(),
            "caching challenge"
        );
        self.cache.put(origin.to_owned(), challenge.clone());

        Ok(challenge)
    }

    /// Answers `challenge` and sends a protected copy of `request`
    async fn send_authenticated(
        &self,
        request: &Request,
        challenge: &Challenge,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<(Response, ProtectedExchange<K>)> {
        let credentials = credentials::acquire_for_challenge(&self.provider, challenge)
            .await
            .map_err(reqwest_middleware::Error::middleware)?;

        let context = MessageSecurityContext::for_challenge(credentials, challenge)
            .map_err(middleware_error)?
            .with_clock(self.clock.clone());

        let (protected, exchange) = ProtectedExchange::protect(request, context)
            .map_err(reqwest_middleware::Error::middleware)?;

        let response = next.run(protected, extensions).await?;
        Ok((response, exchange))
    }
}

#[async_trait::async_trait]
impl<P, C, Pr, K> Middleware for ChallengeAuthMiddleware<P, C, Pr, K>
where
    P: CredentialProvider + 'static,
    C: ChallengeCache + 'static,
    Pr: Predicate<Request> + Send + Sync + 'static,
    K: Clock + Clone + Send + Sync + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request already carries authorization, sending as is");
            return next.run(req, extensions).await;
        }

        if req.body().map_or(false, |b| b.as_bytes().is_none()) {
            return Err(middleware_error(ProtocolError::UnreplayableRequest));
        }

        let origin = origin_of(req.url());

        let (mut response, mut exchange) = if let Some(challenge) = self.cache.get(&origin) {
            tracing::trace!(%origin, "answering cached challenge");
            self.send_authenticated(&req, &challenge, extensions, next.clone())
                .await?
        } else {
            let probe = probe_for(&req).map_err(middleware_error)?;
            tracing::debug!(%origin, method = %req.method(), "no challenge cached, probing");

            let response = next.clone().run(probe, extensions).await?;
            match response.status() {
                StatusCode::OK => {
                    tracing::debug!(%origin, "probe succeeded without authentication");
                    return Ok(response);
                }
                StatusCode::UNAUTHORIZED => {}
                status => {
                    tracing::warn!(%origin, %status, "probe returned an unexpected status");
                    return Err(middleware_error(ProtocolError::UnexpectedStatus { status }));
                }
            }

            let challenge = self
                .refresh_challenge(&origin, &response)
                .map_err(middleware_error)?;
            self.send_authenticated(&req, &challenge, extensions, next.clone())
                .await?
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!(%origin, "authenticated request was rejected, answering fresh challenge");
            let challenge = self
                .refresh_challenge(&origin, &response)
                .map_err(middleware_error)?;
            (response, exchange) = self
                .send_authenticated(&req, &challenge, extensions, next)
                .await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                tracing::warn!(%origin, "request still unauthorized after answering fresh challenge");
            }
        }

        if response.status() == StatusCode::OK {
            exchange.unprotect(response).await
        } else {
            Ok(response)
        }
    }
}

fn middleware_error(err: impl Into<keyvault_auth::Error>) -> reqwest_middleware::Error {
    reqwest_middleware::Error::middleware(err.into())
}

fn origin_of(url: &Url) -> Origin {
    Origin::new(url.origin().ascii_serialization())
}

/// Derives the unauthenticated probe sent to discover a challenge
///
/// The probe never carries the request payload. Writes are probed with an
/// empty JSON document, reads and deletes with no body at all.
fn probe_for(req: &Request) -> std::result::Result<Request, ProtocolError> {
    let method = req.method();

    let is_write = method == Method::POST || method == Method::PUT || method == Method::PATCH;
    let is_bodiless = method == Method::GET || method == Method::HEAD || method == Method::DELETE;
    if !is_write && !is_bodiless {
        return Err(ProtocolError::UnsupportedMethod {
            method: method.clone(),
        });
    }

    let mut probe = Request::new(method.clone(), req.url().clone());
    *probe.headers_mut() = req.headers().clone();
    *probe.timeout_mut() = req.timeout().copied();
    *probe.version_mut() = req.version();
    probe.headers_mut().remove(header::CONTENT_LENGTH);

    if is_write {
        probe.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(keyvault_auth::security::envelope::CONTENT_TYPE),
        );
        *probe.body_mut() = Some(Body::from(PROBE_BODY));
    } else if req.body().is_some() {
        probe.headers_mut().remove(header::CONTENT_TYPE);
    }

    Ok(probe)
}

/// Only authenticate a request if it is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only authenticate a request if it is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url().host_str().unwrap_or("<no host>").to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
