//! Metadata lookups built on plain queries.

use crate::error::{ClientError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tsbridge_core::{Driver, Error, MetricIdentifier, Query, TimeRange};

pub struct Schema {
    driver: Arc<dyn Driver>,
}

impl Schema {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Label names of `metric` with every value seen in `range`.
    pub async fn labels(&self, metric: &MetricIdentifier, range: &TimeRange) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let query = Query::new(metric.clone(), range.clone());
        let result = self.driver.execute(&query).await?;
        if let Some(error) = result.error() {
            return Err(ClientError::Backend(error.to_string()));
        }

        let mut labels: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for series in result.series() {
            for (name, value) in &series.labels {
                labels.entry(name.clone()).or_default().insert(value.clone());
            }
        }
        Ok(labels)
    }

    /// Existence checks have no portable definition across drivers.
    pub async fn metric_exists(&self, _metric: &MetricIdentifier) -> Result<bool> {
        Err(Error::unsupported("metricExists").into())
    }
}
