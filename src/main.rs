use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use leads_etl::config::{self, EtlConfig, TelemetryConfig};
use leads_etl::{
    BigQueryWarehouse, ErrorReporter, EtlError, FreshPickedScraper, Pipeline, Stage, Telemetry,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    config::load_dotenv();

    let telemetry = match Telemetry::init(&TelemetryConfig::from_env()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("ログ初期化に失敗しました: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let reporter = Arc::new(telemetry.reporter());

    let code = match EtlConfig::from_env() {
        Ok(config) => run(&config, reporter).await,
        Err(e) => {
            reporter.report(Stage::Startup, &EtlError::Config(e));
            ExitCode::FAILURE
        }
    };

    telemetry.shutdown();
    code
}

async fn run(config: &EtlConfig, reporter: Arc<dyn ErrorReporter>) -> ExitCode {
    info!(
        "リードETL開始: {} 〜 {} -> {}.{}",
        config.date_range.start,
        config.date_range.end,
        config.bigquery.project_id,
        config.bigquery.dataset_id
    );

    let mut scraper = FreshPickedScraper::new(config.scraper.clone());
    let pipeline = Pipeline::from_config(config, reporter);

    match pipeline
        .run(&mut scraper, || BigQueryWarehouse::connect(config.bigquery.clone()))
        .await
    {
        Ok(summary) => {
            if summary.report.failed() > 0 {
                info!(
                    "アップロード失敗 {}件（エラー通知を確認してください）",
                    summary.report.failed()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("実行失敗: {}", e.kind());
            ExitCode::FAILURE
        }
    }
}
