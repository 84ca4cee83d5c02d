//! Backend-neutral query AST.
//!
//! A [`Query`] names a metric, filters it by labels, bounds it in time and
//! applies an ordered chain of [`Operation`]s, left to right. Nothing here
//! knows whether a backend can run the query: that is decided at compile
//! time against the driver's [`Capabilities`](crate::capabilities::Capabilities).

use crate::aggregation::AggregateFunction;
use crate::capabilities::Capability;
use crate::error::{Error, Result};
use crate::labels::{LabelFilter, LabelMatcher};
use crate::time::{TimePrecision, TimeRange};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Kind of an operation, reported uniformly by every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Rate,
    Increase,
    HistogramQuantile,
    LabelJoin,
    Aggregate,
    Math,
}

impl OperationType {
    /// Capability a driver must declare to run this operation.
    pub fn required_capability(&self) -> Capability {
        match self {
            OperationType::Rate | OperationType::Increase => Capability::Rate,
            OperationType::HistogramQuantile => Capability::Histogram,
            OperationType::LabelJoin => Capability::LabelJoin,
            OperationType::Aggregate => Capability::Aggregation,
            OperationType::Math => Capability::Math,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathOperator {
    Add,
    Sub,
    Mul,
    Div,
}

impl MathOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            MathOperator::Add => "+",
            MathOperator::Sub => "-",
            MathOperator::Mul => "*",
            MathOperator::Div => "/",
        }
    }

    pub fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            MathOperator::Add => lhs + rhs,
            MathOperator::Sub => lhs - rhs,
            MathOperator::Mul => lhs * rhs,
            MathOperator::Div => lhs / rhs,
        }
    }
}

impl Display for MathOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Operation without operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicOperation {
    op_type: OperationType,
}

impl BasicOperation {
    pub fn new(op_type: OperationType) -> Result<Self> {
        match op_type {
            OperationType::Rate | OperationType::Increase => Ok(Self { op_type }),
            other => Err(Error::Validation(format!(
                "{:?} takes operands and cannot be a basic operation",
                other
            ))),
        }
    }

    /// Per-second rate of change.
    pub fn rate() -> Self {
        Self {
            op_type: OperationType::Rate,
        }
    }

    /// Difference between consecutive points.
    pub fn increase() -> Self {
        Self {
            op_type: OperationType::Increase,
        }
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }
}

/// Scalar arithmetic applied to every point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MathOperation {
    operator: MathOperator,
    value: f64,
}

impl MathOperation {
    pub fn new(operator: MathOperator, value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::Validation(format!("math operand must be finite, got {}", value)));
        }
        if operator == MathOperator::Div && value == 0.0 {
            return Err(Error::Validation("division by zero".to_string()));
        }
        Ok(Self { operator, value })
    }

    pub fn operator(&self) -> MathOperator {
        self.operator
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn apply(&self, input: f64) -> f64 {
        self.operator.apply(input, self.value)
    }
}

/// Cross-series aggregation, optionally grouped by labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateOperation {
    function: AggregateFunction,
    by: Vec<String>,
}

impl AggregateOperation {
    pub fn new(function: AggregateFunction, by: Vec<String>) -> Self {
        Self { function, by }
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    pub fn by(&self) -> &[String] {
        &self.by
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramOperation {
    quantile: f64,
}

impl HistogramOperation {
    pub fn new(quantile: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&quantile) {
            return Err(Error::Validation(format!(
                "quantile must be within [0, 1], got {}",
                quantile
            )));
        }
        Ok(Self { quantile })
    }

    pub fn quantile(&self) -> f64 {
        self.quantile
    }
}

/// Writes the concatenation of `sources` label values into `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelJoinOperation {
    destination: String,
    separator: String,
    sources: Vec<String>,
}

impl LabelJoinOperation {
    pub fn new(
        destination: impl Into<String>,
        separator: impl Into<String>,
        sources: Vec<String>,
    ) -> Result<Self> {
        let destination = destination.into();
        if destination.is_empty() {
            return Err(Error::Validation("label join destination is empty".to_string()));
        }
        if sources.is_empty() {
            return Err(Error::Validation("label join needs at least one source".to_string()));
        }
        Ok(Self {
            destination,
            separator: separator.into(),
            sources,
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Basic(BasicOperation),
    Math(MathOperation),
    Aggregate(AggregateOperation),
    Histogram(HistogramOperation),
    LabelJoin(LabelJoinOperation),
}

impl Operation {
    pub fn op_type(&self) -> OperationType {
        match self {
            Operation::Basic(op) => op.op_type(),
            Operation::Math(_) => OperationType::Math,
            Operation::Aggregate(_) => OperationType::Aggregate,
            Operation::Histogram(_) => OperationType::HistogramQuantile,
            Operation::LabelJoin(_) => OperationType::LabelJoin,
        }
    }
}

impl From<BasicOperation> for Operation {
    fn from(op: BasicOperation) -> Self {
        Operation::Basic(op)
    }
}

impl From<MathOperation> for Operation {
    fn from(op: MathOperation) -> Self {
        Operation::Math(op)
    }
}

impl From<AggregateOperation> for Operation {
    fn from(op: AggregateOperation) -> Self {
        Operation::Aggregate(op)
    }
}

impl From<HistogramOperation> for Operation {
    fn from(op: HistogramOperation) -> Self {
        Operation::Histogram(op)
    }
}

impl From<LabelJoinOperation> for Operation {
    fn from(op: LabelJoinOperation) -> Self {
        Operation::LabelJoin(op)
    }
}

/// Identifies a series (with labels) or a series family (without).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricIdentifier {
    name: String,
    field: Option<String>,
    labels: BTreeMap<String, String>,
}

impl MetricIdentifier {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Validation("metric name must not be empty".to_string()));
        }
        Ok(Self {
            name,
            field: None,
            labels: BTreeMap::new(),
        })
    }

    pub fn with_field(&self, field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            ..self.clone()
        }
    }

    pub fn with_label(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = self.labels.clone();
        labels.insert(name.into(), value.into());
        Self {
            labels,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

impl Display for MetricIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(field) = &self.field {
            write!(f, ".{}", field)?;
        }
        if !self.labels.is_empty() {
            let labels: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect();
            write!(f, "{{{}}}", labels.join(","))?;
        }
        Ok(())
    }
}

/// Fixed-window downsampling applied before the operation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downsample {
    step: Duration,
    function: AggregateFunction,
}

impl Downsample {
    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }
}

/// A complete backend-neutral query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    metric: MetricIdentifier,
    filter: LabelFilter,
    range: TimeRange,
    precision: TimePrecision,
    operations: Vec<Operation>,
    downsample: Option<Downsample>,
    limit: Option<usize>,
}

impl Query {
    pub fn new(metric: MetricIdentifier, range: TimeRange) -> Self {
        Self {
            metric,
            filter: LabelFilter::new(),
            range,
            precision: TimePrecision::default(),
            operations: Vec::new(),
            downsample: None,
            limit: None,
        }
    }

    pub fn with_filter(&self, filter: LabelFilter) -> Self {
        Self {
            filter,
            ..self.clone()
        }
    }

    pub fn with_precision(&self, precision: TimePrecision) -> Self {
        Self {
            precision,
            ..self.clone()
        }
    }

    pub fn with_range(&self, range: TimeRange) -> Self {
        Self {
            range,
            ..self.clone()
        }
    }

    /// Appends an operation to the end of the chain.
    pub fn with_operation(&self, operation: impl Into<Operation>) -> Self {
        let mut operations = self.operations.clone();
        operations.push(operation.into());
        Self {
            operations,
            ..self.clone()
        }
    }

    /// Downsamples into fixed windows of `step`, reducing each window with
    /// `function`, before the operation chain.
    pub fn with_downsample(&self, step: Duration, function: AggregateFunction) -> Result<Self> {
        if step <= Duration::zero() {
            return Err(Error::Validation(format!("step must be positive, got {}", step)));
        }
        Ok(Self {
            downsample: Some(Downsample { step, function }),
            ..self.clone()
        })
    }

    pub fn with_limit(&self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self.clone()
        }
    }

    pub fn metric(&self) -> &MetricIdentifier {
        &self.metric
    }

    pub fn filter(&self) -> &LabelFilter {
        &self.filter
    }

    pub fn range(&self) -> &TimeRange {
        &self.range
    }

    pub fn precision(&self) -> TimePrecision {
        self.precision
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn downsample(&self) -> Option<Downsample> {
        self.downsample
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// The explicit filter plus an equality matcher for every label pinned
    /// on the metric identifier. Explicit matchers win on the same label.
    pub fn effective_filter(&self) -> LabelFilter {
        let mut filter = self.filter.clone();
        for (name, value) in self.metric.labels() {
            if filter.get(name).is_none() {
                if let Ok(extended) = filter.with_matcher(name.clone(), LabelMatcher::equal(value.clone())) {
                    filter = extended;
                }
            }
        }
        filter
    }

    /// Capability flags this query needs, in discovery order, without duplicates.
    pub fn required_capabilities(&self) -> Vec<Capability> {
        let mut required = Vec::new();
        let mut push = |cap: Capability| {
            if !required.contains(&cap) {
                required.push(cap);
            }
        };

        if self.range.is_empty() == Some(true) {
            push(Capability::EmptyRange);
        }
        if self.filter.requires_regex() {
            push(Capability::Regex);
        }
        if self.downsample.is_some() {
            push(Capability::Aggregation);
        }
        for op in &self.operations {
            push(op.op_type().required_capability());
        }

        required
    }
}
