#![forbid(unsafe_code)]

//! Security helpers shared by the API surface and the backend binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

const MAX_TARGET_ID_LEN: usize = 64;

/// Fails fast when the server is started as root. Downloads write into a
/// shared directory and spawn yt-dlp, neither of which should run privileged.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Video ids are handed to yt-dlp as a URL component, so they must be plain
/// tokens that can never be parsed as an option or a path.
pub fn is_valid_target_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_TARGET_ID_LEN
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Reduces an arbitrary string to a flat ASCII filename.
///
/// Path separators become spaces, whitespace runs collapse into `_`, anything
/// outside `[A-Za-z0-9_.-]` is dropped and leading/trailing dots and
/// underscores are stripped. The result may be empty.
pub fn secure_filename(raw: &str) -> String {
    let flattened: String = raw
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect::<String>()
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

/// Returns true when resolving `raw` relative to a directory would climb above
/// that directory, or when `raw` is absolute. Both separators count.
pub fn escapes_root(raw: &str) -> bool {
    if raw.starts_with('/') || raw.starts_with('\\') || raw.contains(':') {
        return true;
    }
    let mut depth: i64 = 0;
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn target_ids_must_be_plain_tokens() {
        assert!(is_valid_target_id("dQw4w9WgXcQ"));
        assert!(is_valid_target_id("abc_123-x"));
        assert!(!is_valid_target_id(""));
        assert!(!is_valid_target_id("--exec"));
        assert!(!is_valid_target_id("abc def"));
        assert!(!is_valid_target_id("../etc"));
        assert!(!is_valid_target_id(&"a".repeat(65)));
    }

    #[test]
    fn secure_filename_flattens_paths() {
        assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(secure_filename("a\\b.mp3"), "a_b.mp3");
        assert_eq!(secure_filename("  ..hidden  "), "hidden");
    }

    #[test]
    fn secure_filename_drops_non_ascii() {
        assert_eq!(secure_filename("노래 (live).mp3"), "live.mp3");
        assert_eq!(secure_filename("노래"), "");
        assert_eq!(secure_filename("..."), "");
    }

    #[test]
    fn escapes_root_detects_climbing() {
        assert!(escapes_root("../../etc/passwd"));
        assert!(escapes_root("..\\secret"));
        assert!(escapes_root("/etc/passwd"));
        assert!(escapes_root("a/../../b"));
        assert!(!escapes_root("a/../b"));
        assert!(!escapes_root("file.mp3"));
        assert!(!escapes_root("./file.mp3"));
    }
}
