//! HTTP header utilities shared by the edge router and the client agent:
//! hop-by-hop stripping, forwarded-header injection and upgrade detection.

use http::header::{HeaderMap, HeaderName, HeaderValue};

/// RFC 7230 hop-by-hop headers, stripped in both directions
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn clean_hop_by_hop_headers(headers: &mut HeaderMap) {
    let connection_listed: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect();

    for name in connection_listed {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Inject forwarding headers the local service expects to see
pub fn inject_forwarded_headers(headers: &mut HeaderMap, original_host: &str) {
    if !original_host.is_empty() {
        if let Ok(value) = HeaderValue::from_str(original_host) {
            headers.insert("x-forwarded-host", value);
        }
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
}

/// `Connection: upgrade` present?
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
}

/// WebSocket upgrade: `Connection: upgrade` plus `Upgrade: websocket`
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    if !is_upgrade_request(headers) {
        return false;
    }

    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Flatten a HeaderMap into name/value pairs for HPACK encoding
pub fn header_map_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Rebuild a HeaderMap from decoded name/value pairs
pub fn pairs_to_header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

/// Leftmost DNS label of the request host, when the host is under `domain`
///
/// `foo.tunnel.localhost` with domain `tunnel.localhost` yields `foo`;
/// ports are ignored
pub fn extract_subdomain<'a>(host: &'a str, domain: &str) -> Option<&'a str> {
    let host = host.split(':').next().unwrap_or(host);
    let suffix = host.strip_suffix(domain)?;
    let label = suffix.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label)
}

/// Content-Length for the streaming head: -1 when unknown/chunked
pub fn content_length_of(headers: &HeaderMap) -> i64 {
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive, x-custom-hop".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-custom-hop", "1".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());

        clean_hop_by_hop_headers(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("content-type").is_some());
    }

    #[test]
    fn test_inject_forwarded() {
        let mut headers = HeaderMap::new();
        inject_forwarded_headers(&mut headers, "foo.tunnel.localhost");
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            "foo.tunnel.localhost"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn test_websocket_detection() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "Upgrade".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));

        let mut no_upgrade = HeaderMap::new();
        no_upgrade.insert("connection", "keep-alive".parse().unwrap());
        assert!(!is_websocket_upgrade(&no_upgrade));

        let mut wrong_protocol = HeaderMap::new();
        wrong_protocol.insert("connection", "upgrade".parse().unwrap());
        wrong_protocol.insert("upgrade", "h2c".parse().unwrap());
        assert!(!is_websocket_upgrade(&wrong_protocol));
    }

    #[test]
    fn test_extract_subdomain() {
        assert_eq!(
            extract_subdomain("foo.tunnel.localhost", "tunnel.localhost"),
            Some("foo")
        );
        assert_eq!(
            extract_subdomain("foo.tunnel.localhost:8080", "tunnel.localhost"),
            Some("foo")
        );
        assert_eq!(extract_subdomain("tunnel.localhost", "tunnel.localhost"), None);
        assert_eq!(
            extract_subdomain("a.b.tunnel.localhost", "tunnel.localhost"),
            None
        );
        assert_eq!(extract_subdomain("other.example.com", "tunnel.localhost"), None);
    }

    #[test]
    fn test_pairs_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());

        let pairs = header_map_to_pairs(&headers);
        assert_eq!(pairs.len(), 3);

        let rebuilt = pairs_to_header_map(&pairs);
        assert_eq!(rebuilt.get_all("set-cookie").iter().count(), 2);
        assert_eq!(rebuilt.get("content-type").unwrap(), "text/html");
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length_of(&headers), -1);
        headers.insert("content-length", "42".parse().unwrap());
        assert_eq!(content_length_of(&headers), 42);
    }
}
