// src/transport/markers.rs

//! The `X-Forwarded-By` loop-break marker (`spec.md` §4.3, §9).

use axum::http::{HeaderMap, HeaderValue};

pub const FORWARDED_BY_HEADER: &str = "x-forwarded-by";

/// Returns the forwarder's name if this request already carries the marker.
///
/// A handler that sees `Some(name)` must not itself re-forward: the request
/// has already bounced off the true leader or already been disseminated.
pub fn forwarded_by(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_BY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_by_reads_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_BY_HEADER, HeaderValue::from_static("node-a"));
        assert_eq!(forwarded_by(&headers), Some("node-a".to_string()));
    }

    #[test]
    fn forwarded_by_absent_when_header_missing() {
        let headers = HeaderMap::new();
        assert_eq!(forwarded_by(&headers), None);
    }
}
