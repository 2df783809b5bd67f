//! File-path detection in free-form CLI output.

use std::path::{Path, PathBuf};

const MAX_HINTS: usize = 10;

/// Absolute paths under `root` mentioned in `text`, in order of first
/// appearance, with `:line:col` suffixes stripped.
pub fn extract_project_paths(text: &str, root: &Path) -> Vec<PathBuf> {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return Vec::new();
    }
    let mut found: Vec<PathBuf> = Vec::new();
    let mut search = text;
    while let Some(pos) = search.find(root) {
        let candidate = &search[pos..];
        let end = candidate
            .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '(' | ')' | ',' | '<' | '>'))
            .unwrap_or(candidate.len());
        let raw = strip_location(&candidate[..end]);
        let boundary_ok = raw.len() > root.len() && raw[root.len()..].starts_with('/');
        if boundary_ok {
            let path = PathBuf::from(raw);
            if !found.contains(&path) {
                found.push(path);
                if found.len() == MAX_HINTS {
                    break;
                }
            }
        }
        search = &candidate[end.max(1)..];
    }
    found
}

/// Paths mentioned in a response that exist on disk, for attaching as files.
/// Only tokens that look like absolute paths with an extension are checked.
pub fn detect_output_files(text: &str, exists: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || matches!(c, '`' | '"' | '\'' | '(' | ')' | '<' | '>')) {
        let token = token.trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if !token.starts_with('/') {
            continue;
        }
        let path = Path::new(token);
        if path.extension().is_none() || files.iter().any(|f| f == path) {
            continue;
        }
        if exists(path) {
            files.push(path.to_path_buf());
        }
    }
    files
}

fn strip_location(raw: &str) -> &str {
    let mut s = raw.trim_end_matches(['.', ',', ';', ':']);
    // Up to two trailing `:digits` groups (line and column).
    for _ in 0..2 {
        match s.rsplit_once(':') {
            Some((head, tail)) if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) => {
                s = head;
            }
            _ => break,
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_root_prefixed_paths() {
        let err = "SyntaxError: Unexpected token\n    at /srv/app/src/bot.ts:12:5\n    at (/srv/app/src/util.ts:3)\n    at node:internal/modules:1:1\n    at /srv/app/src/bot.ts:40:1";
        let paths = extract_project_paths(err, Path::new("/srv/app/"));
        assert_eq!(
            paths,
            vec![PathBuf::from("/srv/app/src/bot.ts"), PathBuf::from("/srv/app/src/util.ts")]
        );
    }

    #[test]
    fn ignores_sibling_prefixes() {
        let paths = extract_project_paths("see /srv/application/x.rs", Path::new("/srv/app"));
        assert!(paths.is_empty());
    }

    #[test]
    fn detects_existing_output_files() {
        let text = "I saved the chart to /tmp/out/chart.png. Also see `/tmp/out/missing.csv`, and /tmp/out/dir";
        let files = detect_output_files(text, |p| p == Path::new("/tmp/out/chart.png"));
        assert_eq!(files, vec![PathBuf::from("/tmp/out/chart.png")]);
    }
}
