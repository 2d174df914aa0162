//! Filename sanitization for cached media files.

/// Longest name component kept in a cache filename.
const MAX_COMPONENT_LEN: usize = 48;

/// Reduce a display name to a portable filename component.
///
/// Keeps ASCII alphanumerics, `-` and `_`; every other run of characters becomes a
/// single underscore. Returns `"media"` when nothing usable remains.
pub fn sanitize_component(input: &str) -> String {
    let mut result = String::with_capacity(input.len().min(MAX_COMPONENT_LEN));
    let mut last_was_replacement = false;

    for c in input.chars() {
        if result.len() >= MAX_COMPONENT_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            result.push(c);
            last_was_replacement = false;
        } else if !last_was_replacement {
            result.push('_');
            last_was_replacement = true;
        }
    }

    let trimmed = result.trim_matches('_');
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}
