use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

const FALLBACK_SEGMENT: &str = "untitled";

/// Turns a free-form label (keyword, category) into a single safe path segment.
///
/// Accents are folded away, alphanumerics are kept, and every other run of
/// characters collapses into one `_`. Never returns an empty string.
pub fn sanitize_segment(label: &str) -> String {
    let mut sanitized = String::with_capacity(label.len());
    let mut pending_separator = false;

    for c in label.nfkd().filter(|c| !is_combining_mark(*c)) {
        if c.is_alphanumeric() {
            if pending_separator && !sanitized.is_empty() {
                sanitized.push('_');
            }
            pending_separator = false;
            sanitized.extend(c.to_lowercase());
        } else {
            pending_separator = true;
        }
    }

    if sanitized.is_empty() {
        FALLBACK_SEGMENT.to_string()
    } else {
        sanitized
    }
}
