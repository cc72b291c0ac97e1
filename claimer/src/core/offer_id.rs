//! Canonical offer URLs and the ids derived from them.

use url::Url;

/// Canonicalize an offer URL.
///
/// - Relative URLs (`/p/foo`, `p/foo`, `//host/p/foo`) are resolved against
///   `base_url`; without a base they cannot be canonicalized.
/// - Dot segments are resolved, `#fragment` and `?query` parts are removed.
/// - A trailing slash is dropped.
pub fn canonical_url(raw: &str, base_url: Option<&str>) -> Option<Url> {
    let raw = raw.trim();
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(base_url?.trim()).ok()?.join(raw).ok()?
        }
        Err(_) => return None,
    };
    url.set_fragment(None);
    url.set_query(None);
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty();
    }
    Some(url)
}

/// Derive the provider-stable id: the last non-empty path segment.
///
/// Returns `None` for URLs without a usable segment (e.g. a bare host).
pub fn offer_id(canonical: &Url) -> Option<String> {
    canonical
        .path_segments()?
        .filter(|segment| !segment.trim().is_empty())
        .next_back()
        .map(str::to_string)
}
