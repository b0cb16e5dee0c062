//! Path to rule resolution.
//!
//! Rules are checked in configured order and the first one whose pattern
//! matches wins, so specific patterns must come before broad ones. A pattern
//! without `*` only matches the identical path. Each `*` matches one or more
//! arbitrary characters, `/` included: `/api/*` covers `/api/users` and
//! `/api/users/profile` but not `/api/` itself.

use crate::{
    config::{PolicySet, Rule},
    error::Result,
};

const WILDCARD: u8 = b'*';

/// A rule pattern prepared for matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    Wildcard(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern.as_bytes().contains(&WILDCARD) {
            PathPattern::Wildcard(pattern.to_string())
        } else {
            PathPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(pattern) => pattern == path,
            PathPattern::Wildcard(pattern) => pattern == path || wildcard_match(pattern, path),
        }
    }
}

/// Glob match where each `*` consumes at least one character
pub fn wildcard_match(pattern: &str, path: &str) -> bool {
    let pattern = pattern.as_bytes();
    let path = path.as_bytes();

    let (mut p, mut t) = (0, 0);
    // Pattern index after the last star and the path index its span ends at
    let mut backtrack: Option<(usize, usize)> = None;

    while t < path.len() {
        if p < pattern.len() && pattern[p] == WILDCARD {
            backtrack = Some((p + 1, t + 1));
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == path[t] {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            // Let the last star swallow one more character
            p = star_p;
            t = star_t + 1;
            backtrack = Some((star_p, t));
        } else {
            return false;
        }
    }

    p == pattern.len()
}

/// Select the rule for `path`: first match in order, then the default rule
pub fn match_rule<'a>(policy: &'a PolicySet, path: &str) -> Option<&'a Rule> {
    policy
        .rules
        .iter()
        .find(|rule| PathPattern::parse(&rule.pattern).matches(path))
        .or(policy.default_rule.as_ref())
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: PathPattern,
    rule: Rule,
}

/// Validated policy with patterns parsed once for fast lookups
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    enabled: bool,
    rules: Vec<CompiledRule>,
    default_rule: Option<Rule>,
}

impl CompiledPolicy {
    /// Compile a policy set, rejecting any invalid rule
    pub fn compile(policy: PolicySet) -> Result<Self> {
        policy.validate()?;

        let rules = policy
            .rules
            .into_iter()
            .map(|rule| CompiledRule {
                pattern: PathPattern::parse(&rule.pattern),
                rule,
            })
            .collect();

        Ok(Self {
            enabled: policy.enabled,
            rules,
            default_rule: policy.default_rule,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Find the rule for the given path
    pub fn find_rule(&self, path: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|compiled| compiled.pattern.matches(path))
            .map(|compiled| &compiled.rule)
            .or(self.default_rule.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rules: Vec<Rule>, default_rule: Option<Rule>) -> PolicySet {
        PolicySet {
            enabled: true,
            rules,
            default_rule,
        }
    }

    #[test]
    fn test_exact_and_wildcard_patterns() {
        assert!(PathPattern::parse("/api/users").matches("/api/users"));
        assert!(!PathPattern::parse("/api/users").matches("/api/users/1"));

        let api = PathPattern::parse("/api/*");
        assert!(api.matches("/api/users"));
        assert!(api.matches("/api/users/profile"));
        assert!(!api.matches("/admin/users"));
        assert!(!api.matches("/api/"));
        assert!(!api.matches("/api"));

        assert!(PathPattern::parse("/api/*/profile").matches("/api/users/profile"));
        assert!(PathPattern::parse("/api/*/profile").matches("/api/v1/users/profile"));
        assert!(!PathPattern::parse("/api/*/profile").matches("/api/users/settings"));
    }

    #[test]
    fn test_wildcard_backtracking() {
        assert!(wildcard_match("*", "/"));
        assert!(!wildcard_match("*", ""));
        assert!(wildcard_match("/a*b*c", "/aXbYbZc"));
        assert!(wildcard_match("*.json", "/data/file.tar.json"));
        assert!(!wildcard_match("*.json", ".json"));
        assert!(!wildcard_match("/a*b", "/axx"));
        assert!(wildcard_match("/a**", "/axy"));
        assert!(!wildcard_match("/a**", "/ax"));
    }

    #[test]
    fn test_literal_star_path_matches_itself() {
        assert!(PathPattern::parse("/files/*").matches("/files/*"));
    }

    #[test]
    fn test_first_match_wins() {
        let policy = policy(
            vec![
                Rule::new("/api/login", 1, 0),
                Rule::new("/api/*", 10, 0),
            ],
            None,
        );

        assert_eq!(match_rule(&policy, "/api/login").unwrap().limit_per_second, 1);
        assert_eq!(match_rule(&policy, "/api/orders").unwrap().limit_per_second, 10);
        assert!(match_rule(&policy, "/health").is_none());
    }

    #[test]
    fn test_broad_rule_first_shadows_specific() {
        let policy = policy(
            vec![
                Rule::new("/api/*", 10, 0),
                Rule::new("/api/login", 1, 0),
            ],
            None,
        );

        assert_eq!(match_rule(&policy, "/api/login").unwrap().limit_per_second, 10);
    }

    #[test]
    fn test_default_rule_fallback() {
        let policy = policy(
            vec![Rule::new("/api/*", 10, 0)],
            Some(Rule::new("*", 0, 600)),
        );

        let rule = match_rule(&policy, "/static/app.js").unwrap();
        assert_eq!(rule.limit_per_minute, 600);
    }

    #[test]
    fn test_compiled_policy_lookup() {
        let compiled = CompiledPolicy::compile(policy(
            vec![
                Rule::new("/api/login", 1, 5),
                Rule::new("/api/*", 10, 0),
            ],
            Some(Rule::new("*", 0, 600)),
        ))
        .unwrap();

        assert!(compiled.is_enabled());
        assert_eq!(compiled.rule_count(), 2);
        assert_eq!(compiled.find_rule("/api/login").unwrap().limit_per_minute, 5);
        assert_eq!(compiled.find_rule("/api/orders/7").unwrap().limit_per_second, 10);
        assert_eq!(compiled.find_rule("/").unwrap().limit_per_minute, 600);
    }

    #[test]
    fn test_compile_rejects_invalid_rules() {
        assert!(CompiledPolicy::compile(policy(vec![Rule::new("/api/*", 0, 0)], None)).is_err());
        assert!(CompiledPolicy::compile(policy(vec![], Some(Rule::new("", 1, 0)))).is_err());
    }
}
