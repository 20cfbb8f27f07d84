//! リードETLライブラリ
//!
//! - FreshPickedLeads にログインし、日付範囲を指定してCSVをダウンロード
//! - ダウンロードしたCSVを取り込み日付きで BigQuery に追記
//!
//! # 使用例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use leads_etl::{BigQueryWarehouse, EtlConfig, FreshPickedScraper, Pipeline, SentryReporter};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = EtlConfig::from_env().unwrap();
//!
//!     let mut scraper = FreshPickedScraper::new(config.scraper.clone());
//!     let pipeline = Pipeline::from_config(&config, Arc::new(SentryReporter));
//!
//!     let summary = pipeline
//!         .run(&mut scraper, || BigQueryWarehouse::connect(config.bigquery.clone()))
//!         .await
//!         .unwrap();
//!     println!("Uploaded: {}/{}", summary.report.succeeded, summary.report.attempted);
//! }
//! ```
//!
//! # スクレイプのみ
//!
//! ```rust,ignore
//! use leads_etl::{DateRange, FreshPickedScraper, LeadsBrowser, ScraperConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ScraperConfig::new("ops@example.com", "password")
//!         .with_download_path("./downloads")
//!         .with_headless(false);
//!
//!     let today = chrono::Local::now().date_naive();
//!     let mut scraper = FreshPickedScraper::new(config);
//!     let files = scraper.execute(&DateRange::yesterday_to(today)).await.unwrap();
//!     println!("CSV downloaded: {:?}", files);
//! }
//! ```

pub mod bigquery;
pub mod config;
pub mod download_dir;
pub mod error;
pub mod fresh_picked;
pub mod loader;
pub mod pipeline;
pub mod telemetry;
pub mod traits;

#[cfg(test)]
mod testing;

// 主要な型をリエクスポート
pub use bigquery::BigQueryWarehouse;
pub use config::{EtlConfig, ScraperConfig, TelemetryConfig};
pub use error::{ConfigError, ErrorKind, EtlError, LoadError, ScraperError};
pub use fresh_picked::{DateRange, FreshPickedScraper};
pub use loader::{CsvLoader, LoadReport};
pub use pipeline::{Pipeline, RunSummary};
pub use telemetry::{ErrorReporter, SentryReporter, Stage, Telemetry};
pub use traits::{LeadsBrowser, Warehouse};
