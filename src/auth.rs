use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Checks an `Authorization: Bearer <token>` header value against the
/// configured token. Both sides are compared as SHA-256 digests.
pub fn check_token(header_value: Option<&str>, expected: &str) -> bool {
    let Some(token) = header_value.and_then(|v| v.strip_prefix("Bearer ")) else {
        return false;
    };
    digest(token.trim()) == digest(expected)
}

pub fn authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => check_token(
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok()),
            expected,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_token() {
        assert!(check_token(Some("Bearer secret"), "secret"));
        assert!(!check_token(Some("Bearer wrong"), "secret"));
        assert!(!check_token(Some("secret"), "secret"));
        assert!(!check_token(None, "secret"));
    }

    #[test]
    fn test_authorized_without_configured_token() {
        assert!(authorized(&HeaderMap::new(), None));
        assert!(!authorized(&HeaderMap::new(), Some("secret")));
    }

    #[test]
    fn test_authorized_reads_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(authorized(&headers, Some("secret")));
        assert!(!authorized(&headers, Some("other")));
    }
}
