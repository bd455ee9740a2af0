//! Signed, time-limited stream links.
//!
//! A link binds a channel id and the second it was issued:
//! `signature = hex(HMAC-SHA256("{channel_id}:{issued_at}", key))`.
//! Verification checks authenticity only; freshness is checked separately
//! against the link TTL.

use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::OnceLock;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
}

impl UrlSigner {
    pub fn new(secret: &[u8]) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::validation(format!("unusable signing key: {e}")))?;
        Ok(Self { mac })
    }

    pub fn sign(&self, channel_id: i64, issued_at: i64) -> String {
        let mut mac = self.mac.clone();
        mac.update(format!("{channel_id}:{issued_at}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check. Anything that is not a well-formed hex digest is
    /// simply invalid.
    pub fn verify(&self, channel_id: i64, issued_at: i64, signature: &str) -> bool {
        let Ok(raw) = hex::decode(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(format!("{channel_id}:{issued_at}").as_bytes());
        mac.verify_slice(&raw).is_ok()
    }
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

/// Raw query parameters of a stream request. Everything is optional text so
/// malformed input turns into a 400 from us rather than an extractor error.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub channel_id: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    pub hls: Option<String>,
    pub segment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub channel_id: i64,
    pub issued_at: i64,
    pub signature: String,
    pub wants_hls: bool,
    pub segment: Option<String>,
}

impl SignedRequest {
    pub fn from_params(params: StreamParams) -> Result<Self> {
        let channel_id = parse_int(params.channel_id.as_deref(), "channel_id")?;
        let issued_at = parse_int(params.timestamp.as_deref(), "timestamp")?;
        let signature = params
            .signature
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::validation("missing signature"))?;
        let wants_hls = params.hls.as_deref().map(parse_flag).unwrap_or(false);
        let segment = match params.segment.filter(|s| !s.is_empty()) {
            Some(name) if is_segment_name(&name) => Some(name),
            Some(name) => return Err(Error::validation(format!("invalid segment name: {name}"))),
            None => None,
        };

        Ok(Self {
            channel_id,
            issued_at,
            signature,
            wants_hls,
            segment,
        })
    }

    /// Signature first, then freshness: a forged link is reported as
    /// invalid even when it is also stale.
    pub fn authenticate(&self, signer: &UrlSigner, now: i64, ttl_secs: u64) -> Result<()> {
        if !signer.verify(self.channel_id, self.issued_at, &self.signature) {
            return Err(Error::SignatureInvalid);
        }
        if now - self.issued_at > ttl_secs as i64 {
            return Err(Error::LinkExpired);
        }
        Ok(())
    }
}

fn parse_int(value: Option<&str>, field: &str) -> Result<i64> {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| Error::validation(format!("invalid {field}")))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

pub fn is_segment_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+\.ts$").expect("static segment pattern"))
        .is_match(name)
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
