//! Query-string helpers shared by the resolver, the signer and the companion
//! rewrites.

use url::{Url, form_urlencoded};

/// Percent-encodes `value` keeping only the RFC 3986 unreserved set.
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Joins `params` as `k=v&k=v`, percent-encoding both sides and keeping the
/// given order.
pub fn to_query_string(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Decoded query pairs of `url`, in order. URLs that do not parse fall back to
/// whatever follows the first `?`.
pub fn query_pairs(url: &str) -> Vec<(String, String)> {
    let raw = match Url::parse(url) {
        Ok(parsed) => parsed.query().unwrap_or_default().to_owned(),
        Err(_) => url
            .split_once('?')
            .map(|(_, query)| query.to_owned())
            .unwrap_or_default(),
    };
    form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// First non-blank value of `key` in `pairs`.
pub fn param<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}
