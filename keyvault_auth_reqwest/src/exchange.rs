//! Bridging between `reqwest` messages and the message-security context

use aliri_clock::Clock;
use bytes::Bytes;
use keyvault_auth::{Error, MessageSecurityContext, ProtocolError};
use reqwest::{Body, Request, Response, ResponseBuilderExt};

/// A protected request attempt, holding what is needed to unprotect its response
///
/// Valid for a single attempt only; a retry builds a fresh exchange.
#[derive(Debug)]
pub struct ProtectedExchange<K> {
    context: MessageSecurityContext<K>,
}

impl<K: Clock> ProtectedExchange<K> {
    /// Protects a copy of `request`, leaving the original available for retries
    pub(crate) fn protect(
        request: &Request,
        context: MessageSecurityContext<K>,
    ) -> Result<(Request, Self), Error> {
        let mut outgoing = request
            .try_clone()
            .ok_or(ProtocolError::UnreplayableRequest)?;

        let had_body = request.body().is_some();
        let body = request
            .body()
            .and_then(Body::as_bytes)
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();

        let uri = request
            .url()
            .as_str()
            .parse::<http::Uri>()
            .map_err(|_| ProtocolError::InvalidTarget {
                target: request.url().to_string(),
            })?;

        let mut plain = http::Request::new(body);
        *plain.method_mut() = request.method().clone();
        *plain.uri_mut() = uri;
        *plain.headers_mut() = request.headers().clone();

        let (parts, body) = context.protect(plain)?.into_parts();

        *outgoing.headers_mut() = parts.headers;
        if had_body || !body.is_empty() {
            *outgoing.body_mut() = Some(Body::from(body));
        }

        Ok((outgoing, Self { context }))
    }

    /// Unprotects the response to this exchange
    ///
    /// Responses that were not protected are returned as they are, without
    /// reading their body.
    pub async fn unprotect(self, response: Response) -> reqwest_middleware::Result<Response> {
        if !self.context.expects_protected(response.headers()) {
            return Ok(response);
        }

        let status = response.status();
        let version = response.version();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        let mut protected = http::Response::new(body);
        *protected.status_mut() = status;
        *protected.version_mut() = version;
        *protected.headers_mut() = headers;

        let (parts, body) = self
            .context
            .unprotect(protected)
            .map_err(|e| reqwest_middleware::Error::middleware(Error::from(e)))?
            .into_parts();

        let mut unprotected = http::Response::builder()
            .url(url)
            .body(body)
            .expect("a builder holding only a url is always valid");
        *unprotected.status_mut() = parts.status;
        *unprotected.version_mut() = parts.version;
        *unprotected.headers_mut() = parts.headers;

        Ok(Response::from(unprotected))
    }
}
