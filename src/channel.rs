//! Channel identity helpers.
//!
//! `extract_channel_id` is the subscription primary key: it is pure, never
//! touches the network and must return the same value for the same URL on
//! every call. The remaining helpers pick the directory a download lands in.

use std::sync::LazyLock;

use regex::Regex;
use url::form_urlencoded;

/// Path shapes tried in order before the query parameter and the fallback.
const PATH_MARKERS: [&str; 3] = ["/channel/", "/c/", "/user/"];
const CHANNEL_ID_PARAM: &str = "channel_id";

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("static regex"));

/// Resolves a channel URL to a stable identifier.
///
/// Shapes are tried in priority order: `/channel/<id>`, `/c/<name>`,
/// `/user/<name>`, a `channel_id=` query parameter, then the URL itself with
/// the scheme stripped and `/` replaced by `_`. A shape whose segment is empty,
/// `.`/`..`, or has no word characters does not match.
pub fn extract_channel_id(url: &str) -> String {
    for marker in PATH_MARKERS {
        if let Some(segment) = segment_after(url, marker) {
            return segment.to_owned();
        }
    }

    if url.contains("channel_id=")
        && let Some(id) = query_channel_id(url)
    {
        return id;
    }

    let sanitized = url
        .replace("https://", "")
        .replace("http://", "")
        .replace('/', "_");
    if is_dots(&sanitized) {
        "unknown".to_string()
    } else {
        sanitized
    }
}

/// Directory name used when the extractor cannot tell us who uploaded a URL.
pub fn channel_dir_from_url(url: &str) -> String {
    if let Some(id) = segment_after(url, "/channel/") {
        return format!("channel_{id}");
    }
    for marker in ["/c/", "/user/"] {
        if let Some(name) = segment_after(url, marker) {
            return name.to_owned();
        }
    }
    "unknown_channel".to_string()
}

/// Turns an uploader name into something safe to use as a directory name.
/// Returns `None` when nothing usable survives.
pub fn sanitize_channel_name(name: &str) -> Option<String> {
    let cleaned = UNSAFE_NAME_CHARS.replace_all(name, "");
    let cleaned = cleaned.trim().replace(' ', "_");
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

/// Text after the last `marker`, up to the next `/` or `?`.
fn segment_after<'a>(url: &'a str, marker: &str) -> Option<&'a str> {
    if !url.contains(marker) {
        return None;
    }
    let tail = url.rsplit(marker).next()?;
    let segment = tail.split('/').next()?.split('?').next()?;
    is_usable_segment(segment).then_some(segment)
}

/// Usable as a single path component.
fn is_usable_segment(segment: &str) -> bool {
    !segment.contains(['/', '\\'])
        && !is_dots(segment)
        && sanitize_channel_name(segment).is_some()
}

/// Empty, `.`, `..` and the like.
fn is_dots(value: &str) -> bool {
    value.chars().all(|c| c == '.')
}

fn query_channel_id(url: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    let query = query.split('#').next().unwrap_or(query);
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| key == CHANNEL_ID_PARAM && is_usable_segment(value))
        .map(|(_, value)| value.into_owned())
}
