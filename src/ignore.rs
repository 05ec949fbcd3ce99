//! Gitignore-style pattern matcher over tree-relative paths. Purely
//! syntactic: it never touches the filesystem.

/// One compiled pattern: the glob to match against, whether it is
/// negated (`!pattern`), and whether it only applies to directories
/// (trailing `/`).
struct CompiledPattern {
    negated: bool,
    directory_only: bool,
    /// True if the original pattern contains a `/` anywhere but at the
    /// end, meaning it's anchored to the root rather than matched against
    /// any path component (gitignore semantics).
    anchored: bool,
    glob: Glob,
}

/// Constructed from an ordered list of gitignore-style pattern strings.
/// Later patterns override earlier ones, matching gitignore's
/// last-match-wins semantics with negation.
pub struct IgnoreMatcher {
    patterns: Vec<CompiledPattern>,
}

impl IgnoreMatcher {
    pub fn new(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let patterns = patterns
            .into_iter()
            .filter_map(|raw| {
                let raw = raw.as_ref().trim();
                if raw.is_empty() || raw.starts_with('#') {
                    return None;
                }
                Some(CompiledPattern::compile(raw))
            })
            .collect();
        Self { patterns }
    }

    /// Applies every pattern in order and returns whether the last
    /// matching pattern was a negation. A path with no matching pattern is
    /// not ignored.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let mut ignored = false;
        for pattern in &self.patterns {
            if pattern.directory_only && !is_dir {
                continue;
            }
            if pattern.matches(relative_path) {
                ignored = !pattern.negated;
            }
        }
        ignored
    }
}

impl CompiledPattern {
    fn compile(raw: &str) -> Self {
        let mut pattern = raw;

        let negated = pattern.starts_with('!');
        if negated {
            pattern = &pattern[1..];
        }

        let directory_only = pattern.ends_with('/') && pattern.len() > 1;
        if directory_only {
            pattern = &pattern[..pattern.len() - 1];
        }

        // A leading `/` anchors explicitly; so does any `/` in the middle
        // of the pattern (gitignore semantics — only a pattern with no
        // slash at all is matched against every path component).
        let anchored = pattern.starts_with('/') || pattern.contains('/');
        let pattern = pattern.strip_prefix('/').unwrap_or(pattern);

        Self {
            negated,
            directory_only,
            anchored,
            glob: Glob::compile(pattern),
        }
    }

    fn matches(&self, relative_path: &str) -> bool {
        if self.anchored {
            self.glob.matches(relative_path)
        } else {
            // Unanchored patterns match against any path component, not
            // just the full relative path (gitignore semantics: `*.log`
            // matches `a/b/c.log`).
            self.glob.matches(relative_path)
                || relative_path
                    .rsplit('/')
                    .next()
                    .is_some_and(|basename| self.glob.matches(basename))
        }
    }
}

/// A tiny hand-rolled glob matcher supporting `*`, `?`, and `**`. No crate
/// dependency is pulled in for this: the matching rules are narrow enough,
/// and purely syntactic, to keep as a small recursive matcher over path
/// segments.
struct Glob {
    segments: Vec<String>,
}

impl Glob {
    fn compile(pattern: &str) -> Self {
        Self {
            segments: pattern.split('/').map(|s| s.to_string()).collect(),
        }
    }

    fn matches(&self, path: &str) -> bool {
        let path_segments: Vec<&str> = path.split('/').collect();
        Self::match_segments(&self.segments, &path_segments)
    }

    fn match_segments(pattern: &[String], path: &[&str]) -> bool {
        match pattern.first() {
            None => path.is_empty(),
            Some(seg) if seg == "**" => {
                if pattern.len() == 1 {
                    return true;
                }
                (0..=path.len()).any(|i| Self::match_segments(&pattern[1..], &path[i..]))
            }
            Some(seg) => {
                if path.is_empty() {
                    return false;
                }
                glob_segment_matches(seg, path[0]) && Self::match_segments(&pattern[1..], &path[1..])
            }
        }
    }
}

/// Matches a single path segment against a pattern segment containing `*`
/// and `?` wildcards (no `/`), via a standard DP over characters.
fn glob_segment_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let mut dp = vec![vec![false; text.len() + 1]; pattern.len() + 1];
    dp[0][0] = true;
    for (i, &p) in pattern.iter().enumerate() {
        if p == '*' {
            dp[i + 1][0] = dp[i][0];
        }
    }

    for i in 0..pattern.len() {
        for j in 0..text.len() {
            dp[i + 1][j + 1] = match pattern[i] {
                '*' => dp[i][j + 1] || dp[i + 1][j],
                '?' => dp[i][j],
                c => dp[i][j] && c == text[j],
            };
        }
    }

    dp[pattern.len()][text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_wildcard_matches_any_extensionless_suffix() {
        let matcher = IgnoreMatcher::new(["*.log"]);
        assert!(matcher.is_ignored("debug.log", false));
        assert!(matcher.is_ignored("nested/debug.log", false));
        assert!(!matcher.is_ignored("debug.txt", false));
    }

    #[test]
    fn directory_only_pattern_skips_files() {
        let matcher = IgnoreMatcher::new(["build/"]);
        assert!(matcher.is_ignored("build", true));
        assert!(!matcher.is_ignored("build", false));
    }

    #[test]
    fn double_star_matches_any_depth() {
        let matcher = IgnoreMatcher::new(["**/target"]);
        assert!(matcher.is_ignored("target", false));
        assert!(matcher.is_ignored("crates/a/target", false));
    }

    #[test]
    fn later_negation_overrides_earlier_match() {
        let matcher = IgnoreMatcher::new(["*.log", "!important.log"]);
        assert!(matcher.is_ignored("debug.log", false));
        assert!(!matcher.is_ignored("important.log", false));
    }

    #[test]
    fn anchored_pattern_only_matches_from_root() {
        let matcher = IgnoreMatcher::new(["/only-root.txt"]);
        assert!(matcher.is_ignored("only-root.txt", false));
        assert!(!matcher.is_ignored("nested/only-root.txt", false));
    }
}
