use crate::error::Result;
use crate::pattern::{match_wildcard, CompiledPattern, PatternType};

/// Built-in tracking parameters stripped when no layer configures its own
/// list. Seeds layer 0 of the tracking-params resolution.
pub const DEFAULT_TRACKING_PARAMS: [&str; 14] = [
    "utm_*",
    "gclid",
    "gclsrc",
    "dclid",
    "fbclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "yclid",
    "_hsenc",
    "_hsmi",
    "igshid",
    "ref_src",
    "s_kwcid",
];

/// A redundant pattern report: `pattern` is already covered by `covered_by`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundantPattern {
    pub pattern: String,
    pub covered_by: String,
}

/// Compile a parameter-stripping pattern list, skipping empty strings
pub fn compile_strip_patterns(patterns: &[String]) -> Result<Vec<CompiledPattern>> {
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| CompiledPattern::compile(p))
        .collect()
}

/// True iff any compiled pattern matches the parameter name
pub fn should_strip_param(name: &str, compiled: &[CompiledPattern]) -> bool {
    compiled.iter().any(|p| p.matches(name))
}

/// Detect patterns made redundant by a broader pattern in the same list.
///
/// A pattern is redundant when another entry covers it: an exact name
/// covered by a wildcard or regexp, a wildcard covered by a broader
/// wildcard, or a plain duplicate. Quadratic over the list, which is small.
/// Redundancy is an operational warning, never an error.
pub fn find_redundant_patterns(patterns: &[String]) -> Vec<RedundantPattern> {
    let compiled: Vec<Option<CompiledPattern>> = patterns
        .iter()
        .map(|p| CompiledPattern::compile(p).ok())
        .collect();

    let mut redundant = Vec::new();
    for (i, pattern) in patterns.iter().enumerate() {
        if pattern.is_empty() {
            continue;
        }
        for (j, other) in patterns.iter().enumerate() {
            if i == j || other.is_empty() {
                continue;
            }
            // Exact duplicates: flag the later occurrence only
            if pattern == other {
                if j < i {
                    redundant.push(RedundantPattern {
                        pattern: pattern.clone(),
                        covered_by: other.clone(),
                    });
                    break;
                }
                continue;
            }
            if covers(other, compiled[j].as_ref(), pattern) {
                redundant.push(RedundantPattern {
                    pattern: pattern.clone(),
                    covered_by: other.clone(),
                });
                break;
            }
        }
    }
    redundant
}

/// Does pattern `q` (compiled as `q_compiled`) cover the literal text of
/// pattern `p`? Wildcard-over-wildcard coverage treats `p`'s text verbatim,
/// so `utm_*` covers `utm_s*` but not the reverse.
fn covers(q: &str, q_compiled: Option<&CompiledPattern>, p: &str) -> bool {
    let Some(q_compiled) = q_compiled else {
        return false;
    };
    match q_compiled.kind() {
        PatternType::Wildcard => match_wildcard(p, q),
        PatternType::Regexp => !p.contains('*') && q_compiled.matches(p),
        PatternType::Exact => false,
    }
}
