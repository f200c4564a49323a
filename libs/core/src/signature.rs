//! HMAC-SHA-256 payload signatures, used both to verify the provider's
//! webhook deliveries and to sign our own outbound subscriber calls.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Computes `sha256=<hex>` over the exact payload bytes.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("{SIGNATURE_PREFIX}{}", hex_encode(&digest))
}

/// Verifies a `sha256=<hex>` header value against the payload bytes.
/// The comparison runs in constant time; the signature covers raw bytes, so
/// callers must pass the body exactly as received.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(provided) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    constant_time_eq(provided.as_bytes(), hex_encode(&digest).as_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_verifies() {
        let body = br#"{"entry":[]}"#;
        let sig = compute_signature("secret", body);
        assert!(sig.starts_with(SIGNATURE_PREFIX));
        assert!(verify_signature("secret", body, &sig));
    }

    #[test]
    fn any_single_byte_change_fails() {
        let body = b"payload-bytes";
        let sig = compute_signature("secret", body);

        let mut mutated = body.to_vec();
        mutated[0] ^= 1;
        assert!(!verify_signature("secret", &mutated, &sig));

        let mut bad_sig = sig.clone().into_bytes();
        let last = bad_sig.len() - 1;
        bad_sig[last] = if bad_sig[last] == b'0' { b'1' } else { b'0' };
        assert!(!verify_signature(
            "secret",
            body,
            std::str::from_utf8(&bad_sig).unwrap()
        ));

        assert!(!verify_signature("secrer", body, &sig));
    }

    #[test]
    fn missing_prefix_is_rejected() {
        let body = b"x";
        let sig = compute_signature("secret", body);
        assert!(!verify_signature("secret", body, &sig[SIGNATURE_PREFIX.len()..]));
        assert!(!verify_signature("secret", body, "md5=abc"));
    }

    #[test]
    fn constant_time_eq_needs_equal_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
