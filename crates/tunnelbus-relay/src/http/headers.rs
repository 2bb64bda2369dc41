//! Header placement for local requests and collection from local responses

use super::rewrite::{authority, rebase_referer};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST, REFERER, TRANSFER_ENCODING};
use tracing::debug;
use tunnelbus_proto::HeaderEntry;
use url::Url;

/// Headers describing a request or response body
const CONTENT_HEADERS: [&str; 17] = [
    "Accept-Ranges",
    "Age",
    "Content-Disposition",
    "Content-Encoding",
    "Content-Language",
    "Content-Length",
    "Content-Location",
    "Content-Range",
    "Content-Type",
    "Expires",
    "Last-Modified",
    "Pragma",
    "Trailer",
    "Transfer-Encoding",
    "Vary",
    "Via",
    "Warning",
];

pub fn is_content_header(name: &str) -> bool {
    CONTENT_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether a tunneled header is forwarded to the local target
///
/// Negotiation headers are dropped by their canonical `Accept-` spelling only.
fn is_forwarded(name: &str, has_body: bool) -> bool {
    if is_content_header(name) {
        // The client frames the body itself
        has_body
            && !name.eq_ignore_ascii_case("Content-Length")
            && !name.eq_ignore_ascii_case("Transfer-Encoding")
    } else {
        !name.starts_with(':') && !name.starts_with("Accept-")
    }
}

/// Build the header map of the local request
///
/// `Host` always carries the internal authority and `Referer` is moved onto
/// the internal origin. Body headers are kept only when a body is sent.
pub fn build_request_headers(entries: &[HeaderEntry], internal: &Url, has_body: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for entry in entries {
        let name = entry.key.as_str();

        if name.eq_ignore_ascii_case("Host") {
            continue;
        }

        if name.eq_ignore_ascii_case("Referer") {
            if let Some(value) = entry
                .first()
                .and_then(|referer| rebase_referer(referer, internal))
                .and_then(|referer| HeaderValue::from_str(&referer).ok())
            {
                headers.insert(REFERER, value);
            }
            continue;
        }

        if !is_forwarded(name, has_body) {
            continue;
        }

        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = name, "Skipping invalid header name");
            continue;
        };

        for value in &entry.value {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(header_name.clone(), value);
                }
                Err(_) => debug!(header = name, "Skipping invalid header value"),
            }
        }
    }

    if let Ok(host) = HeaderValue::from_str(&authority(internal)) {
        headers.insert(HOST, host);
    }

    headers
}

/// Group response headers per name in first-seen order, dropping `transfer-encoding`
pub fn collect_response_headers(headers: &HeaderMap) -> Vec<HeaderEntry> {
    let mut entries: Vec<HeaderEntry> = Vec::new();

    for (name, value) in headers {
        if *name == TRANSFER_ENCODING {
            continue;
        }

        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match entries.iter_mut().find(|e| e.key == name.as_str()) {
            Some(entry) => entry.value.push(value),
            None => entries.push(HeaderEntry::single(name.as_str(), value)),
        }
    }

    entries
}

/// Media type of the `Content-Type` header, lowercased, without parameters
pub fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(reqwest::header::CONTENT_TYPE)?.to_str().ok()?;
    let media = value.split(';').next()?.trim();
    (!media.is_empty()).then(|| media.to_ascii_lowercase())
}
