use std::fmt;

use regex::Regex;

use crate::{
    config::{Config, RuleTarget},
    Target,
};

/// A rule that could not be compiled.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    /// The pattern is not a valid regular expression.
    #[error("invalid pattern `{pattern}` in rule #{index}")]
    InvalidPattern { index: usize, pattern: String, source: regex::Error },
    /// The rule redirects to a tproxy that is not configured.
    #[error("rule #{index} references unknown tproxy `{name}`")]
    UnknownTProxy { index: usize, name: String },
}

/// A compiled rule: a pattern and the target it resolves to.
#[derive(Debug, Clone)]
pub struct Matcher {
    regex: Regex,
    target: Target,
}

impl Matcher {
    /// Pairs a compiled pattern with its target.
    pub fn new(regex: Regex, target: Target) -> Self {
        Self { regex, target }
    }

    /// Whether the pattern matches anywhere in `path`. Patterns are not implicitly anchored.
    #[inline]
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The target of every path this matcher matches.
    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.regex.as_str(), self.target)
    }
}

/// The ordered list of compiled rules. Precedence is positional: the first matcher whose
/// pattern matches a path decides its target, there is no most-specific tie-break.
#[derive(Debug, Clone, Default)]
pub struct Matchers {
    inner: Vec<Matcher>,
}

impl Matchers {
    /// Compiles the rules of `config`, in order, resolving tproxy names to their marks.
    pub fn from_config(config: &Config) -> Result<Self, MatcherError> {
        let inner = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let regex = Regex::new(&rule.pattern).map_err(|source| {
                    MatcherError::InvalidPattern { index, pattern: rule.pattern.clone(), source }
                })?;

                let target = match &rule.target {
                    RuleTarget::Noop => Target::Noop,
                    RuleTarget::Direct => Target::Direct,
                    RuleTarget::Drop => Target::Drop,
                    RuleTarget::Tproxy(name) => {
                        let tp = config.tproxy(name).ok_or_else(|| {
                            MatcherError::UnknownTProxy { index, name: name.clone() }
                        })?;
                        Target::Redirect { mark: tp.mark }
                    }
                };

                Ok(Matcher::new(regex, target))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { inner })
    }

    /// Returns the first matcher whose pattern matches `path`.
    pub fn find(&self, path: &str) -> Option<&Matcher> {
        self.inner.iter().find(|m| m.is_match(path))
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether there are no rules at all.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
