//! Label matchers and filters.
//!
//! A [`LabelFilter`] is a set of per-label [`LabelMatcher`]s. The filter's
//! shape is backend-neutral; how it is applied is up to each driver. Drivers
//! that filter series in-process use [`LabelFilter::matches`].

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// How a matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNoMatch,
}

impl MatchType {
    pub fn is_regex(&self) -> bool {
        matches!(self, MatchType::RegexMatch | MatchType::RegexNoMatch)
    }

    pub fn is_negated(&self) -> bool {
        matches!(self, MatchType::NotEqual | MatchType::RegexNoMatch)
    }
}

impl FromStr for MatchType {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "equals" | "eq" | "=" => Ok(MatchType::Equal),
            "not_equals" | "neq" | "!=" => Ok(MatchType::NotEqual),
            "regex" | "=~" => Ok(MatchType::RegexMatch),
            "not_regex" | "!~" => Ok(MatchType::RegexNoMatch),
            other => Err(Error::Validation(format!("unknown match type '{}'", other))),
        }
    }
}

impl Display for MatchType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchType::Equal => write!(f, "="),
            MatchType::NotEqual => write!(f, "!="),
            MatchType::RegexMatch => write!(f, "=~"),
            MatchType::RegexNoMatch => write!(f, "!~"),
        }
    }
}

/// A single comparison rule for one label.
#[derive(Debug, Clone, Serialize)]
pub struct LabelMatcher {
    match_type: MatchType,
    value: String,
    #[serde(skip)]
    regex: Option<Regex>,
}

impl PartialEq for LabelMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.match_type == other.match_type && self.value == other.value
    }
}

impl Eq for LabelMatcher {}

impl LabelMatcher {
    /// Creates a matcher. Regex patterns are compiled once here so a bad
    /// pattern fails at construction rather than inside a driver.
    pub fn new(match_type: MatchType, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let regex = if match_type.is_regex() {
            let compiled = Regex::new(&anchored(&value))
                .map_err(|e| Error::Validation(format!("invalid regex '{}': {}", value, e)))?;
            Some(compiled)
        } else {
            None
        };
        Ok(Self {
            match_type,
            value,
            regex,
        })
    }

    pub fn equal(value: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Equal,
            value: value.into(),
            regex: None,
        }
    }

    pub fn not_equal(value: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::NotEqual,
            value: value.into(),
            regex: None,
        }
    }

    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Tests a label value. An absent label compares as the empty string.
    pub fn matches(&self, candidate: Option<&str>) -> bool {
        let candidate = candidate.unwrap_or("");
        match self.match_type {
            MatchType::Equal => candidate == self.value,
            MatchType::NotEqual => candidate != self.value,
            MatchType::RegexMatch | MatchType::RegexNoMatch => {
                // Only `new` builds regex matchers, and it always compiles one.
                let hit = self
                    .regex
                    .as_ref()
                    .map(|re| re.is_match(candidate))
                    .unwrap_or(false);
                hit != self.match_type.is_negated()
            }
        }
    }
}

fn anchored(pattern: &str) -> String {
    format!("^(?:{})$", pattern)
}

/// Untyped matcher entry as accepted by [`LabelFilter::from_array`].
#[derive(Debug, Deserialize)]
struct RawMatcher {
    #[serde(rename = "type")]
    match_type: Option<String>,
    value: Option<String>,
}

/// Label name to matcher mapping. Keys are unique and kept sorted so
/// every driver renders filters in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelFilter {
    matchers: BTreeMap<String, LabelMatcher>,
}

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single equality matcher on `label`.
    pub fn matching(label: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new().with_matcher(label, LabelMatcher::equal(value))
    }

    /// Builds a filter from untyped input shaped like
    /// `{"host": {"type": "equals", "value": "a"}}`.
    ///
    /// Fails on the first malformed entry and builds nothing.
    pub fn from_array(raw: &Value) -> Result<Self> {
        let entries = raw
            .as_object()
            .ok_or_else(|| Error::Validation("label filter must be an object".to_string()))?;

        let mut matchers = BTreeMap::new();
        for (label, entry) in entries {
            validate_label_name(label)?;
            let raw: RawMatcher = serde_json::from_value(entry.clone()).map_err(|e| {
                Error::Validation(format!("invalid matcher for label '{}': {}", label, e))
            })?;
            let tag = raw.match_type.ok_or_else(|| {
                Error::Validation(format!("matcher for label '{}' is missing 'type'", label))
            })?;
            let value = raw.value.ok_or_else(|| {
                Error::Validation(format!("matcher for label '{}' is missing 'value'", label))
            })?;
            let matcher = LabelMatcher::new(tag.parse()?, value)?;
            matchers.insert(label.clone(), matcher);
        }

        Ok(Self { matchers })
    }

    /// Returns a new filter with `matcher` set for `label`, replacing any
    /// previous matcher on that label.
    pub fn with_matcher(&self, label: impl Into<String>, matcher: LabelMatcher) -> Result<Self> {
        let label = label.into();
        validate_label_name(&label)?;
        let mut matchers = self.matchers.clone();
        matchers.insert(label, matcher);
        Ok(Self { matchers })
    }

    pub fn get(&self, label: &str) -> Option<&LabelMatcher> {
        self.matchers.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LabelMatcher)> {
        self.matchers.iter()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn requires_regex(&self) -> bool {
        self.matchers.values().any(|m| m.match_type().is_regex())
    }

    /// Applies every matcher to a label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.matchers
            .iter()
            .all(|(name, matcher)| matcher.matches(labels.get(name).map(String::as_str)))
    }
}

fn validate_label_name(label: &str) -> Result<()> {
    if label.trim().is_empty() {
        return Err(Error::Validation("label name must not be empty".to_string()));
    }
    Ok(())
}
