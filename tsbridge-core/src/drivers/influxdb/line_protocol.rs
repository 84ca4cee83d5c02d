//! Line protocol encoding for writes.

use crate::drivers::DataPoint;
use crate::error::{Error, Result};
use crate::time::TimePrecision;

/// Field key used when a metric carries no field.
pub const DEFAULT_FIELD: &str = "value";

// Backslashes go first so the escapes added after them stay intact.
fn escape_measurement(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

fn escape_key(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Encodes one point as `measurement[,tag=v...] field=value timestamp`.
pub fn encode_point(point: &DataPoint, precision: TimePrecision) -> Result<String> {
    if !point.value.is_finite() {
        return Err(Error::Validation(format!(
            "cannot write non-finite value {} for {}",
            point.value, point.metric
        )));
    }

    let mut line = escape_measurement(point.metric.name());
    for (name, value) in point.metric.labels() {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(name));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    let field = point.metric.field().unwrap_or(DEFAULT_FIELD);
    line.push(' ');
    line.push_str(&escape_key(field));
    line.push('=');
    line.push_str(&point.value.to_string());
    line.push(' ');
    line.push_str(&precision.timestamp(point.timestamp).to_string());
    Ok(line)
}

/// Encodes a batch, one line per point. Fails on the first invalid point.
pub fn encode_batch(points: &[DataPoint], precision: TimePrecision) -> Result<String> {
    let lines = points
        .iter()
        .map(|p| encode_point(p, precision))
        .collect::<Result<Vec<_>>>()?;
    Ok(lines.join("\n"))
}
