//! Safe destination filename derivation.
//!
//! Prefers the `Content-Disposition` filename, then the last URL path
//! segment, sanitized for Linux filesystems. Used when a job's destination is
//! a directory rather than an explicit file path.

use url::Url;

/// Default filename when URL path and Content-Disposition yield nothing usable.
const DEFAULT_FILENAME: &str = "download.bin";

/// Linux NAME_MAX.
const NAME_MAX: usize = 255;

/// Derives a safe filename for saving a download.
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    let candidate = content_disposition
        .and_then(parse_content_disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url_path(url));

    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILENAME.to_string(),
    };

    let sanitized = sanitize(&raw);
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Last non-empty path segment of the URL, percent-decoding left to the
/// server's naming; query strings are dropped by the URL parser.
fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
}

/// Extracts `filename=` from a Content-Disposition value; handles quoted and
/// bare forms, not the RFC 5987 `filename*` encoding.
fn parse_content_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        let Some(rest) = part.strip_prefix("filename=") else {
            continue;
        };
        let rest = rest.trim();
        let name = rest.trim_matches('"').trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    None
}

/// Sanitizes a candidate filename for safe use on Linux: path separators,
/// NUL, control chars, and whitespace become `_` (collapsed); leading and
/// trailing dots/spaces/underscores are trimmed; length is capped at
/// NAME_MAX bytes on a char boundary.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let replacement = if c == '\0' || c == '/' || c == '\\' || c.is_control() {
            '_'
        } else if c == ' ' || c == '\t' {
            '_'
        } else {
            c
        };

        if replacement == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(replacement);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '\t' || c == '.' || c == '_');

    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_path() {
        assert_eq!(
            derive_filename("https://example.com/archive.zip", None),
            "archive.zip"
        );
        assert_eq!(
            derive_filename("https://cdn.example.com/path/to/distro-12.iso", None),
            "distro-12.iso"
        );
    }

    #[test]
    fn query_string_dropped() {
        assert_eq!(
            derive_filename("https://example.com/file.bin?token=abc", None),
            "file.bin"
        );
    }

    #[test]
    fn from_content_disposition() {
        assert_eq!(
            derive_filename(
                "https://example.com/",
                Some("attachment; filename=\"report.pdf\"")
            ),
            "report.pdf"
        );
        assert_eq!(
            derive_filename("https://example.com/x", Some("attachment; filename=simple.bin")),
            "simple.bin"
        );
    }

    #[test]
    fn content_disposition_overrides_url() {
        assert_eq!(
            derive_filename(
                "https://example.com/archive.zip",
                Some("attachment; filename=\"real-name.tar.gz\"")
            ),
            "real-name.tar.gz"
        );
    }

    #[test]
    fn empty_path_falls_back() {
        assert_eq!(derive_filename("https://example.com/", None), "download.bin");
        assert_eq!(derive_filename("https://example.com", None), "download.bin");
    }

    #[test]
    fn reserved_names_fall_back() {
        assert_eq!(
            derive_filename("https://example.com/a", Some("attachment; filename=\".\"")),
            "download.bin"
        );
        assert_eq!(
            derive_filename("https://example.com/a", Some("attachment; filename=\"..\"")),
            "download.bin"
        );
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize("  ..  file.txt  ..  "), "file.txt");
        assert_eq!(sanitize("file___name.txt"), "file_name.txt");
        assert_eq!(sanitize("file\x00name.txt"), "file_name.txt");
    }
}
