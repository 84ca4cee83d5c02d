//! tsbridge: named connections and a command-line client over tsbridge-core.
//!
//! This crate layers configuration, a connection manager, schema lookups and
//! graph helpers on top of the backend-neutral query model in
//! [`tsbridge_core`].
//!
//! # Example
//!
//! ```rust,no_run
//! use tsbridge::{CliArgs, ConnectionManager, Settings};
//! use tsbridge_core::{MetricIdentifier, Query, TimeRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load settings from the embedded defaults, files and environment
//!     let settings = Settings::new(&CliArgs::default())?;
//!     let manager = ConnectionManager::new(settings);
//!
//!     // Connections are created on first use
//!     let driver = manager.default_connection().await?;
//!     let query = Query::new(
//!         MetricIdentifier::new("cpu")?,
//!         TimeRange::last(chrono::Duration::minutes(5))?,
//!     );
//!     let result = driver.execute(&query).await?;
//!     println!("{} series", result.series().len());
//!
//!     manager.close_all().await;
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod config;
pub mod error;
pub mod graph;
pub mod manager;
pub mod schema;

pub use config::{CliArgs, Settings};
pub use error::{ClientError, Result};
pub use graph::{sparkline, Graph};
pub use manager::ConnectionManager;
pub use schema::Schema;

#[cfg(test)]
mod tests;
