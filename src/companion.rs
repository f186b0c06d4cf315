//! URL rewrites for the surfaces around playback: the danmaku XML feed and
//! the comment list. Both depend on state the resolver gathered.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::error::Result;
use crate::query::{query_pairs, to_query_string};
use crate::resolver::Resolver;

static DANMAKU_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://comment\.bilibili\.com/)(-?\d+)(\.xml)")
        .expect("danmaku pattern is valid")
});

const COMMENT_LIST_MARKER: &str = "api.bilibili.com/x/v2/reply";
const SIGNED_COMMENT_PATH: &str = "api.bilibili.com/x/v2/reply/wbi/main";

/// Points a danmaku feed URL at the corrected cid when the legacy cid was
/// overridden. The cid may be negative when the client overflowed it.
pub fn rewrite_danmaku_url(resolver: &Resolver, url: &str) -> Option<String> {
    let captures = DANMAKU_URL.captures(url)?;
    let legacy_cid = captures.get(2)?.as_str();
    let real_cid = resolver
        .resolve_cid_override(legacy_cid)
        .filter(|real| real != legacy_cid)?;

    let rewritten = DANMAKU_URL
        .replace(url, |caps: &regex::Captures| {
            format!("{}{}{}", &caps[1], real_cid, &caps[3])
        })
        .into_owned();
    if rewritten == url {
        return None;
    }
    info!(legacy_cid, real_cid = %real_cid, "danmaku url rewritten");
    Some(rewritten)
}

/// Turns a first-page legacy comment list request into a signed request
/// against the current endpoint.
///
/// `Ok(None)` means the URL is left alone: not a comment list, already the
/// signed endpoint, a later page, or missing `oid`/`type`.
pub fn rewrite_comment_list_url(resolver: &Resolver, url: &str) -> Result<Option<String>> {
    let lower = url.to_ascii_lowercase();
    if !lower.contains(COMMENT_LIST_MARKER) || lower.contains(SIGNED_COMMENT_PATH) {
        return Ok(None);
    }

    let pairs = query_pairs(url);
    if find_param(&pairs, "pn").unwrap_or("1") != "1" {
        return Ok(None);
    }
    let oid = non_blank(find_param(&pairs, "oid"));
    let kind = non_blank(find_param(&pairs, "type"));
    let (Some(oid), Some(kind)) = (oid, kind) else {
        debug!(url, "comment list url lacks oid or type");
        return Ok(None);
    };
    let mode = match find_param(&pairs, "sort") {
        None | Some("0") => "2",
        Some(_) => "3",
    };

    let mut params = vec![
        ("oid".to_owned(), oid.to_owned()),
        ("type".to_owned(), kind.to_owned()),
        ("mode".to_owned(), mode.to_owned()),
    ];
    if let Some(ps) = non_blank(find_param(&pairs, "ps")) {
        params.push(("ps".to_owned(), ps.to_owned()));
    }
    if let Some(nohot) = non_blank(find_param(&pairs, "nohot")) {
        params.push(("nohot".to_owned(), nohot.to_owned()));
    }

    let signed = resolver.sign(&params)?;
    let scheme = if lower.starts_with("http://") {
        "http"
    } else {
        "https"
    };
    info!(oid, kind, mode, "comment list url rewritten");
    Ok(Some(format!(
        "{scheme}://{SIGNED_COMMENT_PATH}?{}",
        to_query_string(&signed)
    )))
}

/// Case-insensitive first match, blank values included.
fn find_param<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
