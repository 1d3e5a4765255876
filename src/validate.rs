//! URL validation, the first stage of the pipeline.
//!
//! Rejects anything that is not an absolute HTTP(S) URL with a host before
//! any limiter, cache or browser work happens. Pure function, no side
//! effects.

use url::Url;

use crate::ScreenshotError;

/// Validate a caller-supplied URL.
///
/// Accepts only absolute `http`/`https` URLs with a non-empty host and no
/// embedded whitespace. The raw input string (not the parsed form) is what
/// later becomes the cache key, so this function never rewrites it.
pub fn validate_url(input: &str) -> Result<Url, ScreenshotError> {
    if input.is_empty() {
        return Err(ScreenshotError::InvalidUrl("empty input".to_string()));
    }

    // Url::parse percent-encodes whitespace instead of rejecting it.
    if input.chars().any(char::is_whitespace) {
        return Err(ScreenshotError::InvalidUrl(
            "embedded whitespace".to_string(),
        ));
    }

    let parsed =
        Url::parse(input).map_err(|e| ScreenshotError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ScreenshotError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )))
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ScreenshotError::InvalidUrl("missing host".to_string()));
    }

    Ok(parsed)
}
