//! BigQuery ローダーモジュール
//!
//! CSVをロードジョブでテーブルに追記する

mod client;
mod staging;
mod types;

pub use client::BigQueryWarehouse;
pub use types::{job_id_for, JobOutcome, LoadMode, TableRef, UploadJob};
