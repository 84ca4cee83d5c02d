//! Graph rendering: image graphs through drivers that declare
//! `supportsGraph`, and text sparklines for any result.

use crate::error::{ClientError, Result};
use std::path::PathBuf;
use tsbridge_core::aggregation::AggregateFunction;
use tsbridge_core::drivers::{GraphLine, GraphRequest};
use tsbridge_core::{CommandResponse, Driver, MetricIdentifier, Series, TimeRange};

const PALETTE: [&str; 6] = ["1f77b4", "ff7f0e", "2ca02c", "d62728", "9467bd", "8c564b"];
const BARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Builder for a [`GraphRequest`].
#[derive(Debug, Clone)]
pub struct Graph {
    request: GraphRequest,
}

impl Graph {
    pub fn new(output: impl Into<PathBuf>, range: TimeRange) -> Self {
        Self {
            request: GraphRequest {
                output: output.into(),
                range,
                title: String::new(),
                vertical_label: String::new(),
                width: 800,
                height: 200,
                lines: Vec::new(),
            },
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.request.title = title.into();
        self
    }

    pub fn with_vertical_label(mut self, label: impl Into<String>) -> Self {
        self.request.vertical_label = label.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.request.width = width;
        self.request.height = height;
        self
    }

    /// Adds a line, picking the next palette colour.
    pub fn with_line(mut self, metric: MetricIdentifier, function: AggregateFunction) -> Self {
        let color = PALETTE[self.request.lines.len() % PALETTE.len()].to_string();
        let legend = metric.to_string();
        self.request.lines.push(GraphLine {
            metric,
            legend,
            color,
            function,
        });
        self
    }

    pub fn request(&self) -> &GraphRequest {
        &self.request
    }

    pub async fn render(&self, driver: &dyn Driver) -> Result<CommandResponse> {
        let response = driver.render_graph(&self.request).await?;
        match response.error() {
            Some(error) => Err(ClientError::Backend(error.to_string())),
            None => Ok(response),
        }
    }
}

/// One bar per point, scaled between the series minimum and maximum.
pub fn sparkline(series: &Series) -> String {
    let values: Vec<f64> = series.points.iter().map(|(_, v)| *v).filter(|v| v.is_finite()).collect();
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let span = max - min;

    values
        .iter()
        .map(|v| {
            if span <= 0.0 {
                BARS[0]
            } else {
                let index = ((v - min) / span * (BARS.len() - 1) as f64).round() as usize;
                BARS[index.min(BARS.len() - 1)]
            }
        })
        .collect()
}
