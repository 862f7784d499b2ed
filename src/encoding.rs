//! Signed URL codec
//!
//! A signed URL is `/<digest>/<url>` where digest is HMAC-SHA1 over the raw
//! URL bytes. Both parts are either lowercase hex or unpadded url-safe base64.
//! A 40 character digest is hex; anything else is treated as base64.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::error::{DecodeError, InvalidKey};

type HmacSha1 = Hmac<Sha1>;

const HEX_DIGEST_LEN: usize = 40;

/// Wire encoding of a signed URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Hex,
    Base64,
}

impl Codec {
    fn encode(self, data: &[u8]) -> String {
        match self {
            Codec::Hex => hex::encode(data),
            Codec::Base64 => URL_SAFE_NO_PAD.encode(data),
        }
    }

    fn decode(self, data: &str) -> Option<Vec<u8>> {
        match self {
            Codec::Hex => hex::decode(data).ok(),
            Codec::Base64 => URL_SAFE_NO_PAD.decode(data).ok(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Codec::Hex => "hex",
            Codec::Base64 => "base64",
        }
    }
}

/// Keyed HMAC state, built once and cloned per signature
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha1,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(key: &[u8]) -> Result<Self, InvalidKey> {
        let mac = HmacSha1::new_from_slice(key).map_err(|_| InvalidKey)?;
        Ok(Self { mac })
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Sign `url` and return the request path `/<digest>/<url>`
    pub fn encode(&self, codec: Codec, url: &str) -> String {
        let digest = self.digest(url.as_bytes());
        format!("/{}/{}", codec.encode(&digest), codec.encode(url.as_bytes()))
    }

    pub fn hex_encode(&self, url: &str) -> String {
        self.encode(Codec::Hex, url)
    }

    pub fn b64_encode(&self, url: &str) -> String {
        self.encode(Codec::Base64, url)
    }

    /// Verify and decode a signed URL, choosing the codec by digest length
    pub fn decode(&self, digest: &str, payload: &str) -> Result<String, DecodeError> {
        let codec = if digest.len() == HEX_DIGEST_LEN {
            Codec::Hex
        } else {
            Codec::Base64
        };
        self.decode_with(codec, digest, payload)
    }

    pub fn hex_decode(&self, digest: &str, payload: &str) -> Result<String, DecodeError> {
        self.decode_with(Codec::Hex, digest, payload)
    }

    pub fn b64_decode(&self, digest: &str, payload: &str) -> Result<String, DecodeError> {
        self.decode_with(Codec::Base64, digest, payload)
    }

    fn decode_with(
        &self,
        codec: Codec,
        digest: &str,
        payload: &str,
    ) -> Result<String, DecodeError> {
        let supplied = codec
            .decode(digest)
            .ok_or(DecodeError::Digest(codec.name()))?;
        let url = codec
            .decode(payload)
            .ok_or(DecodeError::Payload(codec.name()))?;

        let expected = self.digest(&url);
        if supplied.len() != expected.len() || !bool::from(supplied.ct_eq(&expected)) {
            return Err(DecodeError::Mismatch);
        }

        String::from_utf8(url).map_err(|_| DecodeError::Utf8)
    }
}

/// Sign `url` with `key` in one call
pub fn encode_url(codec: Codec, key: &[u8], url: &str) -> Result<String, InvalidKey> {
    Ok(UrlSigner::new(key)?.encode(codec, url))
}

/// Verify and decode a signed URL with `key` in one call
pub fn decode_url(key: &[u8], digest: &str, payload: &str) -> Result<String, DecodeError> {
    UrlSigner::new(key)
        .map_err(|_| DecodeError::Mismatch)?
        .decode(digest, payload)
}

pub fn hex_encode_url(key: &[u8], url: &str) -> Result<String, InvalidKey> {
    encode_url(Codec::Hex, key, url)
}

pub fn b64_encode_url(key: &[u8], url: &str) -> Result<String, InvalidKey> {
    encode_url(Codec::Base64, key, url)
}

pub fn hex_decode_url(key: &[u8], digest: &str, payload: &str) -> Result<String, DecodeError> {
    UrlSigner::new(key)
        .map_err(|_| DecodeError::Mismatch)?
        .hex_decode(digest, payload)
}

pub fn b64_decode_url(key: &[u8], digest: &str, payload: &str) -> Result<String, DecodeError> {
    UrlSigner::new(key)
        .map_err(|_| DecodeError::Mismatch)?
        .b64_decode(digest, payload)
}
