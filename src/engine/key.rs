// Locator validation and cache-key canonicalization.

use reqwest::Url;

use crate::config::KEY_SEPARATOR_SUBSTITUTE;
use crate::error::CacheError;

/// Parse a locator into a fetchable http(s) URL.
pub fn parse_locator(locator: &str) -> Result<Url, CacheError> {
    let url = Url::parse(locator.trim())
        .map_err(|e| CacheError::MalformedLocator(format!("{}: {}", locator, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CacheError::MalformedLocator(format!(
                "{}: unsupported scheme {}",
                locator, other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(CacheError::MalformedLocator(format!("{}: no host", locator)));
    }
    Ok(url)
}

/// Flatten the URL path into a file name: separators become `_`, characters
/// that are unsafe in file names are percent-escaped. Query and fragment are
/// not part of the key.
pub fn cache_key(url: &Url) -> Option<String> {
    let path = url.path().trim_start_matches('/');
    let mut key = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '/' => key.push(KEY_SEPARATOR_SUBSTITUTE),
            // `%` itself is escaped so escaped and literal spellings stay distinct.
            '%' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => {
                key.push_str(&format!("%{:02X}", c as u32));
            }
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    key.push_str(&format!("%{:02X}", b));
                }
            }
            c => key.push(c),
        }
    }

    if key.is_empty() || key == "." || key == ".." {
        return None;
    }
    Some(key)
}

/// Parse and derive the key in one step.
pub fn key_for_locator(locator: &str) -> Result<(Url, String), CacheError> {
    let url = parse_locator(locator)?;
    let key = cache_key(&url).ok_or_else(|| {
        CacheError::MalformedLocator(format!("{}: no path to derive a cache key from", locator))
    })?;
    Ok((url, key))
}
