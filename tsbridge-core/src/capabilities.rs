//! Driver capability flags and the compilation gate.
//!
//! Every driver fixes its [`Capabilities`] at construction. Before a query is
//! built, [`Capabilities::check`] walks what the query needs and refuses it
//! as a whole if any flag is missing, so no transport I/O happens for a query
//! the backend would answer incompletely.

use crate::error::{Error, Result};
use crate::query::Query;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Well-known capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Rate,
    Histogram,
    LabelJoin,
    Regex,
    Aggregation,
    Math,
    Write,
    EmptyRange,
    Graph,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::Rate,
        Capability::Histogram,
        Capability::LabelJoin,
        Capability::Regex,
        Capability::Aggregation,
        Capability::Math,
        Capability::Write,
        Capability::EmptyRange,
        Capability::Graph,
    ];

    /// String key of the flag.
    pub fn flag(&self) -> &'static str {
        match self {
            Capability::Rate => "supportsRate",
            Capability::Histogram => "supportsHistogram",
            Capability::LabelJoin => "supportsLabelJoin",
            Capability::Regex => "supportsRegex",
            Capability::Aggregation => "supportsAggregation",
            Capability::Math => "supportsMath",
            Capability::Write => "supportsWrite",
            Capability::EmptyRange => "supportsEmptyRange",
            Capability::Graph => "supportsGraph",
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.flag())
    }
}

/// Immutable string-keyed flag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    flags: BTreeMap<String, bool>,
}

impl Capabilities {
    /// Every well-known flag declared and false.
    pub fn none() -> Self {
        Self {
            flags: Capability::ALL
                .iter()
                .map(|cap| (cap.flag().to_string(), false))
                .collect(),
        }
    }

    pub fn with(self, capability: Capability) -> Self {
        self.with_flag(capability.flag(), true)
    }

    /// Declares an arbitrary named flag.
    pub fn with_flag(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.flags.insert(name.into(), enabled);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.supports_flag(capability.flag())
    }

    /// Undeclared flags read as false.
    pub fn supports_flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn flags(&self) -> &BTreeMap<String, bool> {
        &self.flags
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(Error::unsupported(capability.flag()))
        }
    }

    /// Fails on the first capability `query` needs that is not declared.
    pub fn check(&self, query: &Query) -> Result<()> {
        for capability in query.required_capabilities() {
            self.require(capability)?;
        }
        Ok(())
    }
}
