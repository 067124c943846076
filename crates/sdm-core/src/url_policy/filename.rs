//! URL path filename hints and filesystem sanitization.

/// Last non-empty path segment of a URL, as a filename hint.
pub fn filename_from_url_path(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let segment = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .next_back()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Sanitizes a candidate filename for the local filesystem.
///
/// Path separators, NUL, control characters, and whitespace become `_`
/// (runs collapsed), leading/trailing dots and underscores are trimmed, and
/// the result is capped at 255 bytes on a char boundary.
pub fn sanitize_filename(name: &str) -> String {
    const NAME_MAX: usize = 255;

    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let bad = matches!(c, '\0' | '/' | '\\') || c.is_control() || c.is_whitespace();
        if bad {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    if trimmed.len() <= NAME_MAX {
        return trimmed.to_string();
    }
    let mut take = NAME_MAX;
    while take > 0 && !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segment_extraction() {
        assert_eq!(
            filename_from_url_path("https://example.com/a/b/file.iso").as_deref(),
            Some("file.iso")
        );
        assert_eq!(
            filename_from_url_path("https://example.com/file.zip?token=abc").as_deref(),
            Some("file.zip")
        );
        assert_eq!(filename_from_url_path("https://example.com/"), None);
    }

    #[test]
    fn separators_and_controls_replaced() {
        assert_eq!(sanitize_filename("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("file\x00name.txt"), "file_name.txt");
        assert_eq!(sanitize_filename("two  words.mp4"), "two_words.mp4");
    }

    #[test]
    fn dot_and_underscore_trimming() {
        assert_eq!(sanitize_filename("  ..file.txt.. "), "file.txt");
        assert_eq!(sanitize_filename("___x___"), "x");
    }

    #[test]
    fn long_names_capped_on_char_boundary() {
        let long = "é".repeat(300);
        let out = sanitize_filename(&long);
        assert!(out.len() <= 255);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
