use crate::error::{Error, Result};
use crate::labels::LabelFilter;
use crate::query::{AggregateOperation, Query};
use crate::time::TimePrecision;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Stands in for the data file in per-file command templates.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// The rrdtool commands this driver knows how to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RrdCommandKind {
    Create,
    List,
    Update,
    Info,
    Xport,
    Dump,
    Fetch,
    Graph,
    Last,
    First,
    Tune,
    Resize,
    FlushCached,
}

impl RrdCommandKind {
    pub const ALL: [RrdCommandKind; 13] = [
        RrdCommandKind::Create,
        RrdCommandKind::List,
        RrdCommandKind::Update,
        RrdCommandKind::Info,
        RrdCommandKind::Xport,
        RrdCommandKind::Dump,
        RrdCommandKind::Fetch,
        RrdCommandKind::Graph,
        RrdCommandKind::Last,
        RrdCommandKind::First,
        RrdCommandKind::Tune,
        RrdCommandKind::Resize,
        RrdCommandKind::FlushCached,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RrdCommandKind::Create => "create",
            RrdCommandKind::List => "list",
            RrdCommandKind::Update => "update",
            RrdCommandKind::Info => "info",
            RrdCommandKind::Xport => "xport",
            RrdCommandKind::Dump => "dump",
            RrdCommandKind::Fetch => "fetch",
            RrdCommandKind::Graph => "graph",
            RrdCommandKind::Last => "last",
            RrdCommandKind::First => "first",
            RrdCommandKind::Tune => "tune",
            RrdCommandKind::Resize => "resize",
            RrdCommandKind::FlushCached => "flushcached",
        }
    }
}

impl FromStr for RrdCommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RrdCommandKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| Error::Validation(format!("unknown rrdtool command: {}", s)))
    }
}

impl Display for RrdCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rrdtool invocation: `rrdtool <kind> <args...>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrdCommand {
    pub kind: RrdCommandKind,
    pub args: Vec<String>,
}

impl RrdCommand {
    pub fn new(kind: RrdCommandKind, args: Vec<String>) -> Self {
        Self { kind, args }
    }

    /// Copy with the file placeholder replaced.
    pub fn for_file(&self, file: &str) -> Self {
        Self {
            kind: self.kind,
            args: self
                .args
                .iter()
                .map(|arg| arg.replace(FILE_PLACEHOLDER, file))
                .collect(),
        }
    }

    /// Arguments as the JSON array the process adapter expects.
    pub fn payload(&self) -> String {
        serde_json::Value::from(self.args.clone()).to_string()
    }
}

impl Display for RrdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How the per-file command's output is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RrdOutput {
    /// `fetch` text, reading the named data source column.
    Fetch { data_source: String },
    /// `xport --json`, single exported column.
    Xport,
}

/// Compiled round-robin query.
///
/// The first command lists the store directory; the second is a template run
/// once per matching file. Matching and cross-file aggregation happen in the
/// driver after listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RrdCommandSequence {
    pub(crate) commands: Vec<RrdCommand>,
    pub(crate) metric: String,
    pub(crate) filter: LabelFilter,
    pub(crate) output: RrdOutput,
    pub(crate) aggregate: Option<AggregateOperation>,
    pub(crate) precision: TimePrecision,
    pub(crate) limit: Option<usize>,
    pub(crate) source: Query,
}

impl RrdCommandSequence {
    pub fn source(&self) -> &Query {
        &self.source
    }

    pub fn commands(&self) -> &[RrdCommand] {
        &self.commands
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn output(&self) -> &RrdOutput {
        &self.output
    }

    pub fn precision(&self) -> TimePrecision {
        self.precision
    }
}

impl Display for RrdCommandSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.commands.iter().map(|c| c.to_string()).collect();
        f.write_str(&rendered.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_text() {
        for kind in RrdCommandKind::ALL {
            assert_eq!(kind.to_string().parse::<RrdCommandKind>().unwrap(), kind);
        }
        assert_eq!("FlushCached".parse::<RrdCommandKind>().unwrap(), RrdCommandKind::FlushCached);
        assert!("restore".parse::<RrdCommandKind>().is_err());
    }

    #[test]
    fn test_template_substitution() {
        let template = RrdCommand::new(
            RrdCommandKind::Fetch,
            vec![FILE_PLACEHOLDER.to_string(), "AVERAGE".to_string()],
        );
        let command = template.for_file("/var/rrd/cpu.rrd");
        assert_eq!(command.to_string(), "fetch /var/rrd/cpu.rrd AVERAGE");
        assert_eq!(command.payload(), "[\"/var/rrd/cpu.rrd\",\"AVERAGE\"]");
    }
}
