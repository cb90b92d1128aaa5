// src/server/auth.rs
//! API key checks for privileged endpoints
//!
//! The key travels in `X-Api-Key` or as `Authorization: Bearer <key>`.

use crate::error::{Error, Result};
use axum::http::{HeaderMap, header};

pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Key presented by the caller, if any
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare without short-circuiting on the first differing byte
fn keys_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Reject the request unless it carries the configured key
pub fn authorize(headers: &HeaderMap, expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match presented_key(headers) {
        Some(key) if keys_match(key, expected) => Ok(()),
        Some(_) => Err(Error::Unauthorized("invalid API key".to_string())),
        None => Err(Error::Unauthorized("missing API key".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_authorize() {
        let mut headers = HeaderMap::new();
        assert!(authorize(&headers, None).is_ok());
        assert!(matches!(
            authorize(&headers, Some("secret")),
            Err(Error::Unauthorized(_))
        ));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(authorize(&headers, Some("secret")).is_err());

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(authorize(&headers, Some("secret")).is_ok());
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert!(authorize(&headers, Some("secret")).is_ok());
        assert!(authorize(&headers, Some("secreT")).is_err());
    }
}
