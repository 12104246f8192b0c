use aliri_braid::braid;
use std::fmt;

/// Implements `Debug` and `Display` for a secret so that it prints as
/// `***LABEL***`, revealing a prefix only under the alternate flag
macro_rules! redacted {
    ($ty:ty, $label:literal, reveal = $reveal:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }

                let limit = f.width().unwrap_or($reveal);
                f.write_str("\"")?;
                reveal_prefix(self.as_str(), f, limit)?;
                f.write_str("\"")
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }

                let limit = f.width().unwrap_or(usize::MAX);
                reveal_prefix(self.as_str(), f, limit)
            }
        }
    };
}

/// Writes at most `limit` characters of `secret`, the last being `…` when cut
fn reveal_prefix(secret: &str, f: &mut fmt::Formatter, limit: usize) -> fmt::Result {
    if limit <= 1 {
        return f.write_str("…");
    }

    match secret.char_indices().nth(limit - 1) {
        Some((end, _)) => {
            f.write_str(&secret[..end])?;
            f.write_str("…")
        }
        None => f.write_str(secret),
    }
}

/// The origin of a request: scheme, host and port
///
/// Challenges are cached per origin, never per path.
#[braid(serde)]
pub struct Origin;

/// An access token issued by an authority
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef, "ACCESS TOKEN", reveal = 15);

/// Proof-of-possession key material, as a serialized JSON Web Key
#[braid(serde, debug = "owned", display = "owned")]
pub struct PopKey;

redacted!(PopKeyRef, "POP KEY", reveal = 5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_is_redacted_by_default() {
        let token = AccessToken::from_static("super-secret-token-value");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(token.to_string(), "***ACCESS TOKEN***");
    }

    #[test]
    fn access_token_reveals_a_prefix_when_alternate() {
        let token = AccessToken::from_static("super-secret-token-value");
        assert_eq!(format!("{:#?}", token), "\"super-secret-t…\"");
        assert_eq!(format!("{:#}", token), "super-secret-token-value");
    }

    #[test]
    fn pop_key_is_redacted_by_default() {
        let key = PopKey::from_static(r#"{"kty":"oct","k":"c2VjcmV0"}"#);
        assert_eq!(format!("{:?}", key), "***POP KEY***");
    }

    #[test]
    fn reveal_width_counts_the_ellipsis() {
        let key = PopKey::from_static("abcde");
        assert_eq!(format!("{:#5?}", key), "\"abcd…\"");
        assert_eq!(format!("{:#6?}", key), "\"abcde\"");
        assert_eq!(format!("{:#1?}", key), "\"…\"");
    }
}
