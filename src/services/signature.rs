//! HMAC verification of WebSub deliveries (`X-Hub-Signature`).

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

const SHA1_HEX_LEN: usize = 40;
const SHA256_HEX_LEN: usize = 64;

/// Check `header` (`sha1=<hex>`, `sha256=<hex>`, or a bare hex digest) against
/// the HMAC of `body` keyed with `secret`. The digest comparison is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let header = header.trim();

    let (algorithm, hex_sig) = match header.split_once('=') {
        Some((algorithm, hex_sig)) => (algorithm.to_ascii_lowercase(), hex_sig),
        None => match header.len() {
            SHA1_HEX_LEN => ("sha1".to_string(), header),
            SHA256_HEX_LEN => ("sha256".to_string(), header),
            _ => return false,
        },
    };

    let expected = match hex::decode(hex_sig) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    match algorithm.as_str() {
        "sha1" => {
            let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        "sha256" => {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&expected).is_ok()
        }
        _ => false,
    }
}

#[cfg(test)]
pub(crate) fn sign_sha1(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
pub(crate) fn sign_sha256(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "channel-secret";
    const BODY: &[u8] = b"<feed>payload</feed>";

    #[test]
    fn accepts_both_prefixes() {
        let sha1 = sign_sha1(SECRET, BODY);
        let sha256 = sign_sha256(SECRET, BODY);

        assert!(verify_signature(SECRET, BODY, &format!("sha1={}", sha1)));
        assert!(verify_signature(SECRET, BODY, &format!("sha256={}", sha256)));
        assert!(verify_signature(SECRET, BODY, &format!("SHA1={}", sha1)));
    }

    #[test]
    fn accepts_bare_digests() {
        assert!(verify_signature(SECRET, BODY, &sign_sha1(SECRET, BODY)));
        assert!(verify_signature(SECRET, BODY, &sign_sha256(SECRET, BODY)));
    }

    #[test]
    fn rejects_wrong_secret_or_body() {
        let sig = format!("sha1={}", sign_sha1(SECRET, BODY));
        assert!(!verify_signature("other-secret", BODY, &sig));
        assert!(!verify_signature(SECRET, b"<feed>tampered</feed>", &sig));
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(!verify_signature(SECRET, BODY, ""));
        assert!(!verify_signature(SECRET, BODY, "sha1=zzzz"));
        assert!(!verify_signature(SECRET, BODY, "md5=abcd"));
        assert!(!verify_signature(SECRET, BODY, "deadbeef"));
        // Digest of the right algorithm but the wrong length.
        assert!(!verify_signature(
            SECRET,
            BODY,
            &format!("sha256={}", sign_sha1(SECRET, BODY))
        ));
    }
}
