//! The protected message envelope
//!
//! A protected body is a flattened JSON Web Signature whose payload carries
//! a few signed [`Claims`] together with the original body, encrypted as a
//! compact JSON Web Encryption using direct AES-256-GCM with the content key
//! advertised by the server:
//!
//! ```text
//! {
//!   "protected": BASE64URL({"alg":"RS256","kid":"..."}),
//!   "payload":   BASE64URL({"at":"...","ts":1700000000,"m":"POST","u":"/keys","b":"<jwe>"}),
//!   "signature": BASE64URL(signature)
//! }
//! ```
//!
//! Both parties of an exchange use [`seal`] and [`open`] with matching keys.

use aliri::{
    jwa,
    jws::{Signer, Verifier},
    Jwk,
};
use aliri_base64::{Base64Url, Base64UrlRef};
use ring::{
    aead::{self, Aad, LessSafeKey, Nonce, UnboundKey},
    rand::{SecureRandom, SystemRandom},
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    error::{invalid_key, malformed_envelope, SecurityError},
    AccessToken,
};

/// The content type of a protected body
pub const CONTENT_TYPE: &str = "application/jose+json";

/// Maximum difference, in seconds, between an envelope timestamp and the
/// local clock
pub const FRESHNESS_WINDOW: u64 = 300;

const KEY_TYPE: &str = "oct";
const KEY_MANAGEMENT: &str = "dir";
const CONTENT_ENCRYPTION: &str = "A256GCM";
const DEFAULT_SIGNING_ALGORITHM: jwa::Algorithm = jwa::Algorithm::RS256;

/// A symmetric content-encryption key, serialized as an `oct` JSON Web Key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKey {
    kty: String,
    #[serde(rename = "kid", default, skip_serializing_if = "Option::is_none")]
    key_id: Option<String>,
    #[serde(rename = "k")]
    secret: Base64Url,
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ContentKey {
    /// Constructs a content key from a 256-bit secret
    pub fn new(key_id: Option<String>, secret: [u8; 32]) -> Self {
        Self {
            kty: KEY_TYPE.to_owned(),
            key_id,
            secret: Base64Url::from_raw(secret.to_vec()),
        }
    }

    /// Generates a fresh random content key
    ///
    /// # Errors
    ///
    /// The system random number generator failed.
    pub fn generate(key_id: Option<String>) -> Result<Self, SecurityError> {
        let mut secret = [0; 32];
        SystemRandom::new()
            .fill(&mut secret)
            .map_err(|_| SecurityError::Cipher("generate key for"))?;
        Ok(Self::new(key_id, secret))
    }

    /// Reads a content key from its JSON Web Key form
    ///
    /// # Errors
    ///
    /// The JSON is not an `oct` key holding a 256-bit secret.
    pub fn from_json(json: &str) -> Result<Self, SecurityError> {
        let key: Self = serde_json::from_str(json).map_err(|e| invalid_key("encryption", e))?;

        if key.kty != KEY_TYPE {
            return Err(invalid_key("encryption", "key type must be `oct`"));
        }

        if key.secret.as_slice().len() != aead::AES_256_GCM.key_len() {
            return Err(invalid_key("encryption", "key must be 256 bits"));
        }

        Ok(key)
    }

    /// Serializes the key as a JSON Web Key
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("content keys always serialize")
    }

    /// The key identifier
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    fn cipher(&self) -> Result<LessSafeKey, SecurityError> {
        UnboundKey::new(&aead::AES_256_GCM, self.secret.as_slice())
            .map(LessSafeKey::new)
            .map_err(|_| invalid_key("encryption", "key must be 256 bits"))
    }
}

/// The signed metadata of an envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// The access token the message was sent with
    #[serde(rename = "at", default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,

    /// When the envelope was sealed, in seconds since the Unix epoch
    #[serde(rename = "ts")]
    pub timestamp: u64,

    /// The request method
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// The request path and query
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Claims {
    /// Claims carrying only a timestamp
    pub fn at(timestamp: u64) -> Self {
        Self {
            access_token: None,
            timestamp,
            method: None,
            target: None,
        }
    }
}

/// The contents of an opened envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opened {
    /// The verified metadata
    pub claims: Claims,
    /// The decrypted body
    pub body: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Payload {
    #[serde(flatten)]
    claims: Claims,
    #[serde(rename = "b")]
    body: String,
}

#[derive(Serialize, Deserialize)]
struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct SignatureHeader {
    alg: jwa::Algorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct EncryptionHeader {
    alg: String,
    enc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// Encrypts `body` under `content_key` and signs it with `signing_key`
///
/// The signing algorithm is taken from the key, defaulting to `RS256`.
///
/// # Errors
///
/// Encryption or signing failed.
pub fn seal(
    claims: &Claims,
    body: &[u8],
    content_key: &ContentKey,
    signing_key: &Jwk,
) -> Result<Vec<u8>, SecurityError> {
    let payload = Payload {
        claims: claims.clone(),
        body: encrypt(content_key, body)?,
    };

    let header = SignatureHeader {
        alg: signing_key.algorithm().unwrap_or(DEFAULT_SIGNING_ALGORITHM),
        kid: signing_key.key_id().map(|k| k.as_str().to_owned()),
    };

    let protected = encode_json(&header);
    let payload = encode_json(&payload);
    let signing_input = format!("{}.{}", protected, payload);

    let signature = signing_key
        .sign(header.alg, signing_input.as_bytes())
        .map_err(SecurityError::Signing)?;

    let jws = FlattenedJws {
        protected,
        payload,
        signature: Base64Url::from_raw(signature).to_string(),
    };

    tracing::trace!(alg = %header.alg, "sealed protected message");
    Ok(serde_json::to_vec(&jws).expect("envelopes always serialize"))
}

/// Verifies an envelope with `verifying_key` and decrypts it with `content_key`
///
/// # Errors
///
/// The envelope is malformed, its signature does not verify, or its body
/// cannot be decrypted.
pub fn open(
    envelope: &[u8],
    content_key: &ContentKey,
    verifying_key: &Jwk,
) -> Result<Opened, SecurityError> {
    let jws: FlattenedJws =
        serde_json::from_slice(envelope).map_err(|_| malformed_envelope("not a JWS object"))?;

    let header: SignatureHeader = decode_json(&jws.protected)?;
    let signature = Base64Url::from_encoded(&jws.signature)
        .map_err(|_| malformed_envelope("signature is not base64url"))?;

    let signing_input = format!("{}.{}", jws.protected, jws.payload);
    verifying_key
        .verify(header.alg, signing_input.as_bytes(), signature.as_slice())
        .map_err(SecurityError::Verification)?;

    let payload: Payload = decode_json(&jws.payload)?;
    let body = decrypt(content_key, &payload.body)?;

    Ok(Opened {
        claims: payload.claims,
        body,
    })
}

fn encrypt(key: &ContentKey, plaintext: &[u8]) -> Result<String, SecurityError> {
    let header = encode_json(&EncryptionHeader {
        alg: KEY_MANAGEMENT.to_owned(),
        enc: CONTENT_ENCRYPTION.to_owned(),
        kid: key.key_id.clone(),
    });

    let mut iv = [0; aead::NONCE_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| SecurityError::Cipher("encrypt"))?;

    let mut ciphertext = plaintext.to_vec();
    let tag = key
        .cipher()?
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(header.as_bytes()),
            &mut ciphertext,
        )
        .map_err(|_| SecurityError::Cipher("encrypt"))?;

    Ok(format!(
        "{}..{}.{}.{}",
        header,
        Base64UrlRef::from_slice(&iv),
        Base64Url::from_raw(ciphertext),
        Base64UrlRef::from_slice(tag.as_ref()),
    ))
}

fn decrypt(key: &ContentKey, compact: &str) -> Result<Vec<u8>, SecurityError> {
    let parts: Vec<&str> = compact.split('.').collect();
    let (header, encrypted_key, iv, ciphertext, tag) = match parts.as_slice() {
        [h, k, i, c, t] => (*h, *k, *i, *c, *t),
        _ => return Err(malformed_envelope("body is not a compact JWE")),
    };

    if !encrypted_key.is_empty() {
        return Err(malformed_envelope("only direct encryption is supported"));
    }

    let parsed: EncryptionHeader = decode_json(header)?;
    if parsed.alg != KEY_MANAGEMENT || parsed.enc != CONTENT_ENCRYPTION {
        return Err(malformed_envelope("unsupported encryption algorithm"));
    }

    if let (Some(expected), Some(actual)) = (key.key_id(), parsed.kid.as_deref()) {
        if expected != actual {
            return Err(malformed_envelope("body encrypted for a different key"));
        }
    }

    let iv = decode(iv)?;
    let nonce =
        Nonce::try_assume_unique_for_key(iv.as_slice()).map_err(|_| malformed_envelope("bad iv"))?;

    let mut in_out = decode(ciphertext)?.into_inner();
    in_out.extend_from_slice(decode(tag)?.as_slice());

    let plaintext = key
        .cipher()?
        .open_in_place(nonce, Aad::from(header.as_bytes()), &mut in_out)
        .map_err(|_| SecurityError::Cipher("decrypt"))?;

    Ok(plaintext.to_vec())
}

fn encode_json<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_vec(value).expect("envelope headers always serialize");
    Base64Url::from_raw(json).to_string()
}

fn decode_json<T: serde::de::DeserializeOwned>(encoded: &str) -> Result<T, SecurityError> {
    serde_json::from_slice(decode(encoded)?.as_slice())
        .map_err(|_| malformed_envelope("segment is not valid JSON"))
}

fn decode(encoded: &str) -> Result<Base64Url, SecurityError> {
    Base64Url::from_encoded(encoded).map_err(|_| malformed_envelope("segment is not base64url"))
}
