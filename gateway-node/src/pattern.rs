use crate::error::{GatewayError, Result};
use regex::{Regex, RegexBuilder};

/// Pattern dialect, ordered by match specificity.
///
/// The numeric values are the sort priority used by the URL-rule sorter and
/// must not change: exact patterns outrank wildcards, wildcards outrank
/// regexps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatternType {
    /// Regexp pattern, introduced by `~` (case-sensitive) or `~*`
    /// (case-insensitive)
    Regexp = 1,
    /// Literal containing at least one `*`
    Wildcard = 2,
    /// Plain literal, matched case-insensitively
    Exact = 3,
}

impl PatternType {
    /// Numeric sort priority (higher sorts first)
    pub fn priority(self) -> u8 {
        self as u8
    }
}

/// A compiled pattern literal.
///
/// Compilation is pure: the same literal always produces a matcher with
/// identical behavior, and `matches` never mutates state.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    kind: PatternType,
    /// The literal as written in the config file, prefix included
    original: String,
    /// The literal with any `~`/`~*` prefix stripped
    clean: String,
    /// Case-folded form of `clean`, used for exact and wildcard matching
    folded: String,
    regex: Option<Regex>,
}

impl CompiledPattern {
    /// Compile a pattern literal.
    ///
    /// Dispatch by prefix: `~*` compiles a case-insensitive regexp, `~` a
    /// case-sensitive one; otherwise any `*` in the literal makes it a
    /// wildcard, else an exact match. Only regexp compilation can fail.
    pub fn compile(literal: &str) -> Result<Self> {
        if let Some(stripped) = literal.strip_prefix("~*") {
            let regex = RegexBuilder::new(stripped)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    GatewayError::Pattern(format!("invalid regexp pattern '{literal}': {e}"))
                })?;
            return Ok(Self {
                kind: PatternType::Regexp,
                original: literal.to_string(),
                clean: stripped.to_string(),
                folded: fold(stripped),
                regex: Some(regex),
            });
        }

        if let Some(stripped) = literal.strip_prefix('~') {
            let regex = Regex::new(stripped).map_err(|e| {
                GatewayError::Pattern(format!("invalid regexp pattern '{literal}': {e}"))
            })?;
            return Ok(Self {
                kind: PatternType::Regexp,
                original: literal.to_string(),
                clean: stripped.to_string(),
                folded: fold(stripped),
                regex: Some(regex),
            });
        }

        let kind = if literal.contains('*') {
            PatternType::Wildcard
        } else {
            PatternType::Exact
        };

        Ok(Self {
            kind,
            original: literal.to_string(),
            clean: literal.to_string(),
            folded: fold(literal),
            regex: None,
        })
    }

    /// Match `text` against this pattern.
    pub fn matches(&self, text: &str) -> bool {
        match self.kind {
            PatternType::Exact => text.chars().flat_map(char::to_lowercase).eq(self.folded.chars()),
            PatternType::Wildcard => match_folded_wildcard(text, &self.folded),
            PatternType::Regexp => self
                .regex
                .as_ref()
                .map(|r| r.is_match(text))
                .unwrap_or(false),
        }
    }

    /// True when this is a lone `*` wildcard, which matches any input
    /// including the empty string. Query-parameter predicates treat it
    /// specially (key must exist and be non-empty).
    pub fn is_match_all(&self) -> bool {
        self.kind == PatternType::Wildcard && self.clean == "*"
    }

    pub fn kind(&self) -> PatternType {
        self.kind
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// The literal with any regexp prefix stripped. Slash counting for
    /// specificity sorting runs over this form.
    pub fn clean(&self) -> &str {
        &self.clean
    }

    /// Number of `/` characters in the prefix-stripped literal
    pub fn slash_count(&self) -> usize {
        self.clean.chars().filter(|c| *c == '/').count()
    }
}

/// Match `text` against a wildcard pattern without compiling it first.
///
/// `*` consumes any run of characters, separators included; comparison is
/// case-folded on both sides. An isolated `*` matches anything, the empty
/// string included.
pub fn match_wildcard(text: &str, pattern: &str) -> bool {
    match_folded_wildcard(text, &fold(pattern))
}

fn fold(s: &str) -> String {
    s.chars().flat_map(char::to_lowercase).collect()
}

/// Greedy wildcard match with single-star backtracking. `pattern` must
/// already be case-folded.
fn match_folded_wildcard(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().flat_map(char::to_lowercase).collect();
    let p: Vec<char> = pattern.chars().collect();

    let mut ti = 0;
    let mut pi = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            ti += 1;
            pi += 1;
        } else if let Some(s) = star {
            // Backtrack: let the last star consume one more character
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
