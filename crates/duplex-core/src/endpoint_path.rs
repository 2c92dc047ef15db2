//! Endpoint path normalization.

/// Normalize a URL or path into the form endpoints are registered under.
///
/// Scheme, host, query string and fragment are stripped, repeated slashes are
/// collapsed, and the result always starts and ends with `/`.
pub fn normalize_endpoint_path(url_or_path: &str) -> String {
    let mut rest = url_or_path.trim();

    if let Some(pos) = rest.find("://") {
        rest = &rest[pos + 3..];
        rest = rest.find('/').map_or("", |slash| &rest[slash..]);
    }
    if let Some(pos) = rest.find(['?', '#']) {
        rest = &rest[..pos];
    }

    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_owned();
    }
    format!("/{}/", segments.join("/"))
}
