//! Webhook signing schemes.
//!
//! Two schemes are accepted:
//! - timestamped hex (`t=<unix>,v1=<hex>`), HMAC-SHA256 over `"{t}.{body}"`,
//!   used by the email provider and the payment processor;
//! - telephony form signing, base64 HMAC-SHA256 over the full callback URL
//!   followed by every form parameter, sorted by key, as `key` + `value`.
//!
//! Every function fails closed: no secret, no header, or any parse problem is
//! a rejection.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Why a signature was refused. Internal only; callers see a uniform rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureFailure {
    NoSecret,
    MissingHeader,
    MalformedHeader,
    StaleTimestamp,
    Mismatch,
}

impl SignatureFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSecret => "no signing secret configured",
            Self::MissingHeader => "missing signature header",
            Self::MalformedHeader => "malformed signature header",
            Self::StaleTimestamp => "timestamp outside tolerance",
            Self::Mismatch => "signature mismatch",
        }
    }
}

fn mac_for(secret: &str) -> Result<HmacSha256, SignatureFailure> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureFailure::NoSecret)
}

/// Build a `t=..,v1=..` header for `body`.
pub fn timestamped_signature(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let Ok(mut mac) = mac_for(secret) else {
        return String::new();
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={timestamp},v1={:x}", mac.finalize().into_bytes())
}

pub fn verify_timestamped(
    secret: Option<&SecretString>,
    header: Option<&str>,
    body: &[u8],
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), SignatureFailure> {
    let secret = secret.ok_or(SignatureFailure::NoSecret)?;
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(SignatureFailure::MissingHeader)?;

    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<String> = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => candidates.push(value.to_ascii_lowercase()),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureFailure::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(SignatureFailure::MalformedHeader);
    }
    // Unsigned distance; `t` is attacker-controlled and may sit at the i64 extremes.
    if now_unix.abs_diff(timestamp) > tolerance_secs.max(0).unsigned_abs() {
        return Err(SignatureFailure::StaleTimestamp);
    }

    let mut mac = mac_for(secret.expose_secret())?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = format!("{:x}", mac.finalize().into_bytes());

    // Check every candidate so timing does not reveal which one matched.
    let matched = candidates.iter().fold(0u8, |acc, candidate| {
        acc | candidate.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8()
    });
    if matched == 1 {
        Ok(())
    } else {
        Err(SignatureFailure::Mismatch)
    }
}

fn telephony_mac(
    secret: &str,
    url: &str,
    params: &[(String, String)],
) -> Result<HmacSha256, SignatureFailure> {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut mac = mac_for(secret)?;
    mac.update(url.as_bytes());
    for (key, value) in sorted {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    Ok(mac)
}

/// Base64 signature a telephony provider would send for this callback.
pub fn telephony_signature(secret: &str, url: &str, params: &[(String, String)]) -> String {
    match telephony_mac(secret, url, params) {
        Ok(mac) => STANDARD.encode(mac.finalize().into_bytes()),
        Err(_) => String::new(),
    }
}

pub fn verify_telephony(
    secret: Option<&SecretString>,
    header: Option<&str>,
    url: &str,
    params: &[(String, String)],
) -> Result<(), SignatureFailure> {
    let secret = secret.ok_or(SignatureFailure::NoSecret)?;
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(SignatureFailure::MissingHeader)?;
    let provided = STANDARD
        .decode(header)
        .map_err(|_| SignatureFailure::MalformedHeader)?;

    telephony_mac(secret.expose_secret(), url, params)?
        .verify_slice(&provided)
        .map_err(|_| SignatureFailure::Mismatch)
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{
        SignatureFailure, telephony_signature, timestamped_signature, verify_telephony,
        verify_timestamped,
    };

    const NOW: i64 = 1_760_000_000;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn timestamped_round_trip_and_tamper() {
        let key = secret("whsec_test");
        let body = br#"{"message_id":"m1","status":"delivered"}"#;
        let header = timestamped_signature("whsec_test", NOW, body);

        assert_eq!(verify_timestamped(Some(&key), Some(&header), body, 300, NOW), Ok(()));
        assert_eq!(
            verify_timestamped(Some(&key), Some(&header), b"{}", 300, NOW),
            Err(SignatureFailure::Mismatch)
        );
        assert_eq!(
            verify_timestamped(Some(&key), Some(&header), body, 300, NOW + 301),
            Err(SignatureFailure::StaleTimestamp)
        );
    }

    #[test]
    fn timestamped_fails_closed() {
        let key = secret("whsec_test");
        let body = b"{}";
        let header = timestamped_signature("whsec_test", NOW, body);
        assert_eq!(
            verify_timestamped(None, Some(&header), body, 300, NOW),
            Err(SignatureFailure::NoSecret)
        );
        assert_eq!(
            verify_timestamped(Some(&key), None, body, 300, NOW),
            Err(SignatureFailure::MissingHeader)
        );
        assert_eq!(
            verify_timestamped(Some(&key), Some("v1=abc"), body, 300, NOW),
            Err(SignatureFailure::MalformedHeader)
        );
        assert_eq!(
            verify_timestamped(Some(&key), Some(&format!("t={NOW}")), body, 300, NOW),
            Err(SignatureFailure::MalformedHeader)
        );
    }

    #[test]
    fn extreme_timestamps_are_stale_not_a_panic() {
        let key = secret("whsec_test");
        let body = b"{}";
        for t in [i64::MIN, i64::MAX, i64::MIN + 1] {
            let header = format!("t={t},v1=00");
            assert_eq!(
                verify_timestamped(Some(&key), Some(&header), body, 300, NOW),
                Err(SignatureFailure::StaleTimestamp),
                "t={t}"
            );
        }
        let header = "t=-9223372036854775808,v1=00";
        assert_eq!(
            verify_timestamped(Some(&key), Some(header), body, 300, i64::MAX),
            Err(SignatureFailure::StaleTimestamp)
        );
        // A negative tolerance accepts nothing but an exact match.
        let header = timestamped_signature("whsec_test", NOW, body);
        assert_eq!(
            verify_timestamped(Some(&key), Some(&header), body, -5, NOW + 1),
            Err(SignatureFailure::StaleTimestamp)
        );
    }

    #[test]
    fn any_listed_v1_may_match() {
        let key = secret("rotated");
        let body = b"payload";
        let good = timestamped_signature("rotated", NOW, body);
        let good_sig = good.split_once("v1=").map(|(_, s)| s).expect("sig");
        let header = format!("t={NOW},v1=deadbeef,v1={}", good_sig.to_uppercase());
        assert_eq!(verify_timestamped(Some(&key), Some(&header), body, 300, NOW), Ok(()));
    }

    #[test]
    fn telephony_signature_ignores_param_order() {
        let key = secret("twilio-secret");
        let url = "https://collect.example.com/webhook/twilio?ref=msg_1";
        let params = vec![
            ("MessageStatus".to_string(), "delivered".to_string()),
            ("MessageSid".to_string(), "SM1".to_string()),
        ];
        let mut reordered = params.clone();
        reordered.reverse();

        let header = telephony_signature("twilio-secret", url, &params);
        assert_eq!(verify_telephony(Some(&key), Some(&header), url, &reordered), Ok(()));
        assert_eq!(
            verify_telephony(
                Some(&key),
                Some(&header),
                "https://collect.example.com/webhook/twilio",
                &params
            ),
            Err(SignatureFailure::Mismatch)
        );
        assert_eq!(
            verify_telephony(Some(&key), Some("%%%"), url, &params),
            Err(SignatureFailure::MalformedHeader)
        );
    }
}
