//! スクレイプ → ロードの一連の処理

use std::future::Future;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tracing::info;

use crate::config::{EtlConfig, LoaderConfig};
use crate::error::{EtlError, LoadError};
use crate::fresh_picked::DateRange;
use crate::loader::{CsvLoader, LoadReport};
use crate::telemetry::{ErrorReporter, Stage};
use crate::traits::{LeadsBrowser, Warehouse};

/// 1回の実行結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// 今回ダウンロードしたCSV数
    pub downloaded: usize,
    pub report: LoadReport,
}

pub struct Pipeline {
    range: DateRange,
    loader: LoaderConfig,
    project_id: String,
    dataset_id: String,
    reporter: Arc<dyn ErrorReporter>,
    ingestion_date: NaiveDate,
}

impl Pipeline {
    pub fn new(
        range: DateRange,
        loader: LoaderConfig,
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            range,
            loader,
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            reporter,
            ingestion_date: Local::now().date_naive(),
        }
    }

    pub fn from_config(config: &EtlConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self::new(
            config.date_range,
            config.loader.clone(),
            config.bigquery.project_id.clone(),
            config.bigquery.dataset_id.clone(),
            reporter,
        )
    }

    pub fn with_ingestion_date(mut self, date: NaiveDate) -> Self {
        self.ingestion_date = date;
        self
    }

    fn fail(&self, stage: Stage, err: impl Into<EtlError>) -> EtlError {
        let err = err.into();
        self.reporter.report(stage, &err);
        err
    }

    /// スクレイプしてからロードする
    ///
    /// スクレイプに失敗した場合は `connect` を呼ばずに終了する。
    /// ファイル単位の失敗は `RunSummary` に集計され、`Err` にはならない。
    pub async fn run<B, W, F, Fut>(&self, browser: &mut B, connect: F) -> Result<RunSummary, EtlError>
    where
        B: LeadsBrowser,
        W: Warehouse,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<W, LoadError>>,
    {
        info!(
            "=== スクレイプ開始: {} 〜 {} ===",
            self.range.start, self.range.end
        );
        let files = browser
            .execute(&self.range)
            .await
            .map_err(|e| self.fail(Stage::Scrape, e))?;
        info!("ダウンロード完了: {}件", files.len());

        info!("=== BigQueryロード開始 ===");
        let warehouse = connect().await.map_err(|e| self.fail(Stage::Load, e))?;
        let loader = CsvLoader::new(
            self.loader.clone(),
            self.project_id.clone(),
            self.dataset_id.clone(),
            warehouse,
            Arc::clone(&self.reporter),
        )
        .with_ingestion_date(self.ingestion_date);
        let report = loader
            .load_all()
            .await
            .map_err(|e| self.fail(Stage::Load, e))?;

        let summary = RunSummary {
            downloaded: files.len(),
            report,
        };
        info!(
            "実行完了: ダウンロード={}, 検出={}, 試行={}, 成功={}, 失敗={}",
            summary.downloaded,
            summary.report.found,
            summary.report.attempted,
            summary.report.succeeded,
            summary.report.failed()
        );
        Ok(summary)
    }
}
