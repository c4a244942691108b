//! Signed read URLs for stored objects.
//!
//! A signature is `base64url(sha256(secret | bucket | key | expires))`, with
//! `expires` as unix seconds. URLs point at the `/objects/{bucket}/{key}` route.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::Url;

/// Expiry used for derivative links; far enough out to never lapse in practice.
pub fn far_future_expiry() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2491, 3, 9, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone, Debug)]
pub struct UrlSigner {
    base_url: Url,
    secret: String,
}

impl UrlSigner {
    pub fn new(base_url: &str, secret: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            secret: secret.into(),
        })
    }

    fn digest(&self, bucket: &str, key: &str, expires: i64) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires.to_string().as_bytes());
        hasher.finalize().to_vec()
    }

    fn signature(&self, bucket: &str, key: &str, expires: i64) -> String {
        URL_SAFE_NO_PAD.encode(self.digest(bucket, key, expires))
    }

    /// Build a signed read URL for `bucket/key` valid until `expires`.
    pub fn sign(&self, bucket: &str, key: &str, expires: DateTime<Utc>) -> String {
        let expires = expires.timestamp();
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("objects")
                .push(bucket)
                .extend(key.split('/'));
        }
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.signature(bucket, key, expires));
        url.into()
    }

    /// Check a presented signature against `bucket/key` and its expiry.
    /// Digests are compared in constant time.
    pub fn verify(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(presented) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        self.digest(bucket, key, expires)
            .as_slice()
            .ct_eq(&presented)
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signer() -> UrlSigner {
        UrlSigner::new("http://media.local:3000", "secret").unwrap()
    }

    #[test]
    fn signed_url_round_trips_through_verify() {
        let signer = signer();
        let expires = far_future_expiry();
        let url = Url::parse(&signer.sign("bucket-a", "images/a b.webp", expires)).unwrap();
        assert_eq!(url.path(), "/objects/bucket-a/images/a%20b.webp");

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        let presented = pairs["signature"].clone();
        let exp: i64 = pairs["expires"].parse().unwrap();
        assert_eq!(exp, expires.timestamp());
        assert!(signer.verify("bucket-a", "images/a b.webp", exp, &presented));
        assert!(!signer.verify("bucket-a", "images/other.webp", exp, &presented));
    }

    #[test]
    fn expired_signature_is_rejected() {
        let signer = signer();
        let past = Utc::now() - Duration::hours(1);
        let sig = signer.signature("bucket-a", "k", past.timestamp());
        assert!(!signer.verify("bucket-a", "k", past.timestamp(), &sig));
    }

    #[test]
    fn malformed_or_truncated_signatures_are_rejected() {
        let signer = signer();
        let exp = far_future_expiry().timestamp();
        let sig = signer.signature("bucket-a", "k", exp);

        assert!(signer.verify("bucket-a", "k", exp, &sig));
        assert!(!signer.verify("bucket-a", "k", exp, &sig[..sig.len() - 4]));
        assert!(!signer.verify("bucket-a", "k", exp, "not*base64!"));
        assert!(!signer.verify("bucket-a", "k", exp, ""));

        let mut flipped = signer.digest("bucket-a", "k", exp);
        flipped[0] ^= 1;
        assert!(!signer.verify("bucket-a", "k", exp, &URL_SAFE_NO_PAD.encode(flipped)));
    }
}
