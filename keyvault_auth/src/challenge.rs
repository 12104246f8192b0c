//! Authentication challenges and their parsing

use std::collections::BTreeMap;

use http::HeaderMap;

use crate::{
    credentials::AuthenticationSchema,
    error::{malformed_challenge, ProtocolError},
};

/// The challenge scheme used by vault services
pub const BEARER_SCHEME: &str = "Bearer ";

/// The response header carrying the server's message-encryption key
pub const ENCRYPTION_KEY_HEADER: &str = "x-ms-message-encryption-key";

/// The response header carrying the server's message-signing key
pub const SIGNING_KEY_HEADER: &str = "x-ms-message-signing-key";

/// Parameters of a challenge returned with a `401 Unauthorized` response
///
/// Parameter names are normalized to lower case. Besides the parameters
/// named in the `WWW-Authenticate` header, a challenge extracted from a
/// response also carries the message-security keys advertised in the
/// response headers, stored under the header names.
///
/// A parsed challenge always names an authority.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Challenge {
    params: BTreeMap<String, String>,
}

impl Challenge {
    /// Extracts a challenge from the headers of a `401 Unauthorized` response
    ///
    /// # Errors
    ///
    /// Fails if the `WWW-Authenticate` header is missing, is not a bearer
    /// challenge, or is malformed.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ProtocolError> {
        let header = headers
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok());

        let mut challenge = parse_challenge(header, BEARER_SCHEME)?.ok_or_else(|| {
            ProtocolError::MissingChallenge {
                scheme: BEARER_SCHEME.trim_end().to_owned(),
            }
        })?;

        for name in [ENCRYPTION_KEY_HEADER, SIGNING_KEY_HEADER] {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                challenge.insert(name, value);
            }
        }

        Ok(challenge)
    }

    /// Looks up a parameter by its case-insensitive name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Sets a parameter, replacing any existing value
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.params
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Iterates over all parameters, including ones unknown to this crate
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The number of parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the challenge has no parameters
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// The URL of the token-issuing authority
    ///
    /// Read from `authorization`, falling back to `authorization_uri`.
    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        self.get("authorization")
            .or_else(|| self.get("authorization_uri"))
    }

    /// The resource the token must be issued for
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.get("resource")
    }

    /// The scope the token must be issued for
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.get("scope")
    }

    /// Whether the server accepts proof-of-possession tokens
    #[must_use]
    pub fn supports_pop(&self) -> bool {
        self.get("supportspop") == Some("true")
    }

    /// The authentication schema to request tokens for
    #[must_use]
    pub fn schema(&self) -> AuthenticationSchema {
        if self.supports_pop() {
            AuthenticationSchema::Pop
        } else {
            AuthenticationSchema::Bearer
        }
    }

    /// The message-encryption key advertised by the server
    #[must_use]
    pub fn encryption_key(&self) -> Option<&str> {
        self.get(ENCRYPTION_KEY_HEADER)
    }

    /// The message-signing key advertised by the server
    #[must_use]
    pub fn signing_key(&self) -> Option<&str> {
        self.get(SIGNING_KEY_HEADER)
    }
}

/// Parses the value of a `WWW-Authenticate` header
///
/// Returns `Ok(None)` when the header is absent, empty, or does not begin
/// with `scheme` (compared case-insensitively). The remainder is read as a
/// comma-separated list of `key=value` pairs with optional surrounding
/// quotes. When a key repeats, the last occurrence wins. Unknown keys are
/// retained.
///
/// # Errors
///
/// A pair without `=` or with an empty key rejects the whole header, as
/// does a challenge that names no authority.
pub fn parse_challenge(
    header: Option<&str>,
    scheme: &str,
) -> Result<Option<Challenge>, ProtocolError> {
    let header = match header {
        Some(h) if !h.is_empty() => h,
        _ => return Ok(None),
    };

    let params = match header.get(..scheme.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(scheme) => &header[scheme.len()..],
        _ => return Ok(None),
    };

    let mut challenge = Challenge::default();
    for pair in split_params(params) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) if !key.trim().trim_matches('"').is_empty() => (key, value),
            _ => {
                tracing::warn!(header, pair, "malformed challenge parameter");
                return Err(malformed_challenge(pair));
            }
        };

        let key = key.trim().trim_matches('"');

        challenge.insert(key, value.trim().trim_matches('"'));
    }

    if challenge.authority().is_none() {
        tracing::warn!(header, "challenge does not name an authority");
        return Err(ProtocolError::MissingAuthority);
    }

    Ok(Some(challenge))
}

/// Splits challenge parameters on commas that are not inside quotes
fn split_params(params: &str) -> impl Iterator<Item = &str> {
    let mut quoted = false;
    params
        .split(move |c| {
            if c == '"' {
                quoted = !quoted;
            }
            c == ',' && !quoted
        })
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    const VAULT_CHALLENGE: &str =
        r#"Bearer authorization="https://login.example/tenant", resource="https://vault.example""#;

    fn parse(header: &str) -> Result<Option<Challenge>, ProtocolError> {
        parse_challenge(Some(header), BEARER_SCHEME)
    }

    mod parse_challenge {
        use super::*;

        #[test]
        fn strips_quotes_from_values() {
            let challenge = parse(VAULT_CHALLENGE).unwrap().unwrap();

            assert_eq!(
                challenge.get("authorization"),
                Some("https://login.example/tenant")
            );
            assert_eq!(challenge.get("resource"), Some("https://vault.example"));
            assert_eq!(challenge.len(), 2);
        }

        #[test]
        fn accepts_scheme_in_any_case() {
            let header = VAULT_CHALLENGE.replacen("Bearer", "bEARER", 1);
            assert!(parse(&header).unwrap().is_some());
        }

        #[test]
        fn keeps_case_of_values() {
            let challenge = parse(r#"Bearer Authorization="https://Login.Example/Tenant""#)
                .unwrap()
                .unwrap();

            assert_eq!(
                challenge.authority(),
                Some("https://Login.Example/Tenant")
            );
        }

        #[test]
        fn ignores_other_schemes() {
            assert!(parse(r#"Basic realm="vault""#).unwrap().is_none());
        }

        #[test]
        fn ignores_absent_header() {
            assert!(parse_challenge(None, BEARER_SCHEME).unwrap().is_none());
        }

        #[test]
        fn ignores_empty_header() {
            assert!(parse("").unwrap().is_none());
        }

        #[test]
        fn ignores_header_shorter_than_scheme() {
            assert!(parse("Bear").unwrap().is_none());
        }

        #[test]
        fn last_duplicate_key_wins() {
            let challenge = parse(
                r#"Bearer authorization="https://first.example", authorization="https://second.example""#,
            )
            .unwrap()
            .unwrap();

            assert_eq!(challenge.authority(), Some("https://second.example"));
        }

        #[test]
        fn retains_unknown_keys() {
            let challenge = parse(r#"Bearer authorization="https://login.example", flavor="mint""#)
                .unwrap()
                .unwrap();

            assert_eq!(challenge.get("flavor"), Some("mint"));
        }

        #[test]
        fn keeps_commas_inside_quoted_values() {
            let challenge = parse(
                r#"Bearer authorization="https://login.example/t", scope="a,b",resource="https://vault.example""#,
            )
            .unwrap()
            .unwrap();

            assert_eq!(challenge.scope(), Some("a,b"));
            assert_eq!(challenge.resource(), Some("https://vault.example"));
        }

        #[test]
        fn keeps_equals_signs_inside_values() {
            let challenge = parse(r#"Bearer authorization="https://login.example/?a=b""#)
                .unwrap()
                .unwrap();

            assert_eq!(challenge.authority(), Some("https://login.example/?a=b"));
        }

        #[test]
        fn rejects_pair_without_equals() {
            let err = parse(r#"Bearer authorization="https://login.example", garbage"#).unwrap_err();

            assert!(
                matches!(err, ProtocolError::MalformedChallenge { ref pair } if pair == "garbage")
            );
        }

        #[test]
        fn rejects_pair_with_empty_key() {
            let err = parse(r#"Bearer authorization="https://login.example", ="x""#).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedChallenge { .. }));
        }

        #[test]
        fn rejects_challenge_without_authority() {
            let err = parse(r#"Bearer resource="https://vault.example""#).unwrap_err();
            assert!(matches!(err, ProtocolError::MissingAuthority));
        }
    }

    mod challenge {
        use super::*;

        #[test]
        fn authority_falls_back_to_authorization_uri() {
            let challenge = parse(r#"Bearer authorization_uri="https://login.example/uri""#)
                .unwrap()
                .unwrap();

            assert_eq!(challenge.authority(), Some("https://login.example/uri"));
        }

        #[test]
        fn schema_is_pop_only_when_advertised() {
            let pop = parse(r#"Bearer authorization="https://a.example", supportspop="true""#)
                .unwrap()
                .unwrap();
            let bearer = parse(r#"Bearer authorization="https://a.example", supportspop="false""#)
                .unwrap()
                .unwrap();

            assert_eq!(pop.schema(), AuthenticationSchema::Pop);
            assert_eq!(bearer.schema(), AuthenticationSchema::Bearer);
        }

        #[test]
        fn lookups_are_case_insensitive() {
            let challenge = parse(VAULT_CHALLENGE).unwrap().unwrap();
            assert_eq!(challenge.get("RESOURCE"), Some("https://vault.example"));
        }
    }

    mod from_headers {
        use super::*;

        #[test]
        fn copies_message_security_keys() {
            let mut headers = HeaderMap::new();
            headers.insert(
                http::header::WWW_AUTHENTICATE,
                HeaderValue::from_static(VAULT_CHALLENGE),
            );
            headers.insert(ENCRYPTION_KEY_HEADER, HeaderValue::from_static("enc"));
            headers.insert(SIGNING_KEY_HEADER, HeaderValue::from_static("sig"));

            let challenge = Challenge::from_headers(&headers).unwrap();

            assert_eq!(challenge.encryption_key(), Some("enc"));
            assert_eq!(challenge.signing_key(), Some("sig"));
            assert_eq!(challenge.resource(), Some("https://vault.example"));
        }

        #[test]
        fn leaves_keys_absent_when_not_advertised() {
            let mut headers = HeaderMap::new();
            headers.insert(
                http::header::WWW_AUTHENTICATE,
                HeaderValue::from_static(VAULT_CHALLENGE),
            );

            let challenge = Challenge::from_headers(&headers).unwrap();

            assert_eq!(challenge.encryption_key(), None);
            assert_eq!(challenge.signing_key(), None);
        }

        #[test]
        fn fails_without_challenge_header() {
            let err = Challenge::from_headers(&HeaderMap::new()).unwrap_err();
            assert!(matches!(err, ProtocolError::MissingChallenge { .. }));
        }
    }
}
