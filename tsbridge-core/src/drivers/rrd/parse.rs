//! Readers for rrdtool output and the series file naming scheme.
//!
//! Files are named `<metric>[;label=value...].rrd` with labels sorted by name.

use crate::error::{Error, Result};
use crate::query::MetricIdentifier;
use crate::time::TimePrecision;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const EXTENSION: &str = ".rrd";

fn check_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(['/', ';', '=']) {
        return Err(Error::Validation(format!(
            "{} '{}' cannot be used in an rrd file name",
            kind, value
        )));
    }
    Ok(())
}

/// File name for a series.
pub fn file_name(metric: &MetricIdentifier) -> Result<String> {
    check_component("metric", metric.name())?;
    let mut name = metric.name().to_string();
    for (label, value) in metric.labels() {
        check_component("label", label)?;
        check_component("label value", value)?;
        name.push_str(&format!(";{}={}", label, value));
    }
    name.push_str(EXTENSION);
    Ok(name)
}

/// Metric name and labels encoded in a file name, `None` for foreign files.
pub fn parse_file_name(path: &str) -> Option<(String, BTreeMap<String, String>)> {
    let file = Path::new(path.trim()).file_name()?.to_str()?;
    let stem = file.strip_suffix(EXTENSION)?;
    let mut parts = stem.split(';');
    let metric = parts.next().filter(|m| !m.is_empty())?.to_string();
    let mut labels = BTreeMap::new();
    for part in parts {
        let (label, value) = part.split_once('=')?;
        labels.insert(label.to_string(), value.to_string());
    }
    Some((metric, labels))
}

/// Parses `rrdtool fetch` text, keeping one data source column.
///
/// ```text
///                  value
///
/// 1700000000: 1.0000000000e+00
/// 1700000300: -nan
/// ```
pub fn parse_fetch(body: &str, data_source: &str, precision: TimePrecision) -> Result<Vec<(i64, f64)>> {
    let mut column: Option<usize> = None;
    let mut points = Vec::new();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let index = match column {
            Some(index) => index,
            None => {
                let names: Vec<&str> = line.split_whitespace().collect();
                let index = names.iter().position(|n| *n == data_source).ok_or_else(|| {
                    Error::Transport(format!("data source '{}' not in fetch output", data_source))
                })?;
                column = Some(index);
                continue;
            }
        };

        let (ts, values) = line
            .split_once(':')
            .ok_or_else(|| Error::Transport(format!("malformed fetch row '{}'", line)))?;
        let ts: i64 = ts
            .trim()
            .parse()
            .map_err(|e| Error::Transport(format!("bad fetch timestamp '{}': {}", ts, e)))?;
        let raw = values.split_whitespace().nth(index).unwrap_or("nan");
        let value: f64 = raw.parse().unwrap_or(f64::NAN);
        if value.is_finite() {
            points.push((TimePrecision::S.convert(ts, precision), value));
        }
    }
    Ok(points)
}

#[derive(Debug, Deserialize)]
struct XportMeta {
    start: i64,
    step: i64,
}

#[derive(Debug, Deserialize)]
struct XportDocument {
    meta: XportMeta,
    data: Vec<Vec<Option<f64>>>,
}

/// Parses `rrdtool xport --json`, reading the first exported column.
pub fn parse_xport(body: &str, precision: TimePrecision) -> Result<Vec<(i64, f64)>> {
    let document: XportDocument = serde_json::from_str(body)
        .map_err(|e| Error::Transport(format!("malformed xport output: {}", e)))?;

    Ok(document
        .data
        .iter()
        .enumerate()
        .filter_map(|(row, values)| {
            let value = values.first().copied().flatten()?;
            let ts = document.meta.start + row as i64 * document.meta.step;
            Some((TimePrecision::S.convert(ts, precision), value))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_round_trip() {
        let metric = MetricIdentifier::new("cpu")
            .unwrap()
            .with_label("host", "a")
            .with_label("dc", "east");
        let name = file_name(&metric).unwrap();
        assert_eq!(name, "cpu;dc=east;host=a.rrd");

        let (parsed, labels) = parse_file_name(&format!("/var/rrd/{}", name)).unwrap();
        assert_eq!(parsed, "cpu");
        assert_eq!(labels, metric.labels().clone());
        assert!(parse_file_name("notes.txt").is_none());
    }

    #[test]
    fn test_file_name_rejects_separators() {
        let metric = MetricIdentifier::new("cpu").unwrap().with_label("path", "a/b");
        assert!(matches!(file_name(&metric), Err(Error::Validation(_))));
    }

    #[test]
    fn test_parse_fetch_skips_unknown_values() {
        let body = "                 rx        tx\n\n\
                    1700000000: 1.0000000000e+00 2.5000000000e+00\n\
                    1700000300: -nan -nan\n\
                    1700000600: 3.0000000000e+00 4.0000000000e+00\n";
        let points = parse_fetch(body, "tx", TimePrecision::Ms).unwrap();
        assert_eq!(points, vec![(1_700_000_000_000, 2.5), (1_700_000_600_000, 4.0)]);
        assert!(parse_fetch(body, "value", TimePrecision::S).is_err());
    }

    #[test]
    fn test_parse_xport_json() {
        let body = r#"{ "about": "RRDtool graph JSON output",
            "meta": { "start": 1700000000, "end": 1700000600, "step": 300, "legend": ["r"] },
            "data": [ [ 1.5e+00 ], [ null ], [ 2.0e+00 ] ] }"#;
        let points = parse_xport(body, TimePrecision::S).unwrap();
        assert_eq!(points, vec![(1_700_000_000, 1.5), (1_700_000_600, 2.0)]);
    }
}
