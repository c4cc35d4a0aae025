//! Header composition for SSE handshakes and trigger requests.

use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue, header::AUTHORIZATION};

use crate::error::{TransportError, TransportResult};

/// Merge base headers, the bearer token and per-call overrides.
///
/// Precedence is per-call > `Authorization: Bearer <token>` > base. Header
/// names compare case-insensitively, so `authorization` in the overrides
/// replaces the token-derived value. An empty token is treated as absent.
///
/// # Errors
///
/// Returns [`TransportError::InvalidHeader`] if a name or value is not valid
/// HTTP.
pub fn compose_headers(
    base: &BTreeMap<String, String>,
    token: Option<&str>,
    overrides: Option<&BTreeMap<String, String>>,
) -> TransportResult<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(base.len() + 1);
    insert_all(&mut headers, base)?;

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::invalid_header(AUTHORIZATION.as_str(), e))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    if let Some(overrides) = overrides {
        insert_all(&mut headers, overrides)?;
    }

    Ok(headers)
}

fn insert_all(headers: &mut HeaderMap, source: &BTreeMap<String, String>) -> TransportResult<()> {
    for (name, value) in source {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::invalid_header(name.as_str(), e))?;
        let mut header_value =
            HeaderValue::from_str(value).map_err(|e| TransportError::invalid_header(name.as_str(), e))?;
        if header_name == AUTHORIZATION {
            header_value.set_sensitive(true);
        }
        headers.insert(header_name, header_value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn get<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_base_headers_only() {
        let headers = compose_headers(
            &map(&[("X-API-Key", "k"), ("X-Client-Version", "1.0.0")]),
            None,
            None,
        )
        .expect("valid headers");
        assert_eq!(headers.len(), 2);
        assert_eq!(get(&headers, "x-api-key"), Some("k"));
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_token_overrides_base_authorization() {
        let headers = compose_headers(&map(&[("authorization", "Basic abc")]), Some("jwt"), None)
            .expect("valid headers");
        assert_eq!(get(&headers, "Authorization"), Some("Bearer jwt"));
        assert_eq!(headers.get_all(AUTHORIZATION).iter().count(), 1);
        assert!(headers.get(AUTHORIZATION).is_some_and(HeaderValue::is_sensitive));
    }

    #[test]
    fn test_per_call_overrides_win_case_insensitively() {
        let headers = compose_headers(
            &map(&[("X-Trace-ID", "base"), ("X-Keep", "1")]),
            Some("jwt"),
            Some(&map(&[("x-trace-id", "call"), ("AUTHORIZATION", "Bearer call-token")])),
        )
        .expect("valid headers");

        assert_eq!(get(&headers, "X-Trace-ID"), Some("call"));
        assert_eq!(get(&headers, "authorization"), Some("Bearer call-token"));
        assert_eq!(get(&headers, "x-keep"), Some("1"));
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_empty_token_is_ignored() {
        let headers = compose_headers(&BTreeMap::new(), Some(""), None).expect("valid headers");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let err = compose_headers(&map(&[("bad header", "v")]), None, None)
            .expect_err("space in header name");
        assert!(matches!(err, TransportError::InvalidHeader { ref name, .. } if name == "bad header"));
    }

    #[test]
    fn test_invalid_header_value_rejected() {
        let err = compose_headers(&BTreeMap::new(), None, Some(&map(&[("X-A", "line\nbreak")])))
            .expect_err("newline in header value");
        assert!(matches!(err, TransportError::InvalidHeader { .. }));
    }
}
