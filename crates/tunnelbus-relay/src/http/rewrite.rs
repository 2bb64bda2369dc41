//! URL arithmetic between the public origin and the internal target

use regex_lite::{NoExpand, Regex};
use tracing::warn;
use url::Url;

/// Host plus any explicit non-default port, e.g. `localhost:9443`
pub fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

/// `scheme://authority` without path
pub fn origin(url: &Url) -> String {
    format!("{}://{}", url.scheme(), authority(url))
}

/// Path and query of a URL, e.g. `/api?x=1`
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// The local URL a public request maps to
pub fn local_url(public: &Url, internal: &Url) -> Result<Url, url::ParseError> {
    internal.join(&path_and_query(public))
}

/// Move `url`'s path and query onto the origin of `base`
fn rebase(url: &Url, base: &Url) -> Url {
    let mut rebased = base.clone();
    rebased.set_path(url.path());
    rebased.set_query(url.query());
    rebased.set_fragment(url.fragment());
    rebased
}

/// Rewrite a public `Referer` onto the internal origin, keeping path and query
pub fn rebase_referer(referer: &str, internal: &Url) -> Option<String> {
    let referer = Url::parse(referer).ok()?;
    let mut rebased = rebase(&referer, internal);
    rebased.set_fragment(None);
    Some(rebased.to_string())
}

/// Absolute public URL for a `Location` returned by the local target
///
/// Relative locations resolve against the public origin. Absolute locations
/// that point at the internal authority are moved onto the public origin;
/// any other absolute location is kept.
pub fn redirect_target(location: &str, public: &Url, internal: &Url) -> Result<Url, url::ParseError> {
    match Url::parse(location) {
        Ok(absolute) if absolute.host_str().is_some() => {
            if authority(&absolute).eq_ignore_ascii_case(&authority(internal)) {
                Ok(rebase(&absolute, public))
            } else {
                Ok(absolute)
            }
        }
        _ => {
            let public_origin = Url::parse(&origin(public))?;
            public_origin.join(location)
        }
    }
}

/// Replace absolute URLs on the internal authority with the public origin
///
/// Matches `http` and `https` in any letter case, and also the `www.` form of
/// the authority unless it already starts with `www`.
pub fn rewrite_urls(text: &str, internal: &Url, public: &Url) -> String {
    let internal_authority = authority(internal);
    if internal_authority.is_empty() {
        return text.to_string();
    }

    let escaped = regex_lite::escape(&internal_authority);
    let hosts = if internal_authority.starts_with("www") {
        escaped
    } else {
        format!(r"{}|www\.{}", escaped, escaped)
    };
    let pattern = format!("(?i:https?)://(?:{})", hosts);

    match Regex::new(&pattern) {
        Ok(regex) => regex
            .replace_all(text, NoExpand(&origin(public)))
            .into_owned(),
        Err(e) => {
            warn!("Failed to build URL rewrite pattern: {}", e);
            text.to_string()
        }
    }
}
