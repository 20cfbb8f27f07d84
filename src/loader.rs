//! ダウンロードディレクトリのCSVをBigQueryへ追記する
//!
//! ファイルごとに独立して処理する。1ファイルの失敗は通知して次へ進むが、
//! 認証エラーだけは残りを中止する。

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use csv::StringRecord;
use tracing::{error, info, warn};

use crate::bigquery::{JobOutcome, TableRef, UploadJob};
use crate::config::{AfterUpload, LoaderConfig};
use crate::download_dir::list_csv_files;
use crate::error::{ErrorKind, EtlError, LoadError};
use crate::telemetry::{ErrorReporter, Stage};
use crate::traits::Warehouse;

/// 取り込み日を入れる列
pub const INGESTION_COLUMN: &str = "Ingestion_date";

const ARCHIVE_DIR: &str = "archive";

/// 検証済みでアップロード可能なCSV
#[derive(Debug, Clone)]
pub struct PreparedCsv {
    pub payload: Vec<u8>,
    pub rows: usize,
}

/// 1ファイル分の失敗
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub file: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// ロード結果の集計
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub found: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<FileFailure>,
}

impl LoadReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn is_date(field: &str) -> bool {
    ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%m-%d-%Y"]
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(field, fmt).is_ok())
}

/// 電話番号・郵便番号・IDなど、3桁以上の数字の連続を含む
fn has_digit_run(field: &str) -> bool {
    let mut run = 0;
    for c in field.chars() {
        if c.is_ascii_digit() {
            run += 1;
            if run >= 3 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

fn is_email(field: &str) -> bool {
    match field.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

/// 列名ではなくデータ値に見えるか（ヘッダ行が無いCSVの検出）
fn looks_like_data(field: &str) -> bool {
    let field = field.trim();
    field.parse::<f64>().is_ok()
        || is_date(field)
        || is_email(field)
        || has_digit_run(field)
        || field.starts_with("http://")
        || field.starts_with("https://")
}

/// ヘッダ行の検証
fn check_header(headers: &StringRecord) -> Result<(), String> {
    if headers.is_empty() {
        return Err("empty file (no header row)".into());
    }

    let mut seen: Vec<String> = Vec::with_capacity(headers.len());
    for (i, name) in headers.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(format!("blank column name at position {} (no header row?)", i + 1));
        }
        if looks_like_data(name) {
            return Err(format!(
                "column name '{}' looks like a data value (no header row?)",
                name
            ));
        }
        // BigQuery の列名は大文字小文字を区別しない
        let lowered = name.trim().to_lowercase();
        if seen.contains(&lowered) {
            return Err(format!("duplicate column name '{}'", name));
        }
        seen.push(lowered);
    }
    Ok(())
}

/// CSVを検証し、全行に取り込み日を付けて再エンコードする
///
/// ヘッダに `Ingestion_date` が既にあれば値を上書きし、無ければ末尾に追加する。
pub fn prepare_csv(path: &Path, ingestion_date: NaiveDate) -> Result<PreparedCsv, LoadError> {
    let file = file_label(path);
    let bad = |reason: String| LoadError::BadInput {
        file: file.clone(),
        reason,
    };

    let source = std::fs::File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(source);

    let headers = reader
        .headers()
        .map_err(|e| bad(format!("header: {}", e)))?
        .clone();
    check_header(&headers).map_err(&bad)?;

    let existing = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(INGESTION_COLUMN));
    let date = ingestion_date.format("%Y-%m-%d").to_string();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut out_header: Vec<&str> = headers.iter().collect();
    if existing.is_none() {
        out_header.push(INGESTION_COLUMN);
    }
    writer
        .write_record(&out_header)
        .map_err(|e| bad(format!("re-encode: {}", e)))?;

    let mut rows = 0usize;
    for record in reader.records() {
        let record = record.map_err(|e| bad(e.to_string()))?;
        let mut fields: Vec<&str> = record.iter().collect();
        match existing {
            Some(idx) => fields[idx] = date.as_str(),
            None => fields.push(date.as_str()),
        }
        writer
            .write_record(&fields)
            .map_err(|e| bad(format!("re-encode: {}", e)))?;
        rows += 1;
    }

    if rows == 0 {
        return Err(bad("header only, no data rows".into()));
    }

    let payload = writer
        .into_inner()
        .map_err(|e| LoadError::FileIO(e.into_error()))?;

    Ok(PreparedCsv { payload, rows })
}

/// Chrome が同名ファイルに付ける ` (1)` などの連番を外す
fn strip_download_counter(stem: &str) -> &str {
    let Some(open) = stem.rfind(" (") else {
        return stem;
    };
    let counter = &stem[open + 2..];
    match counter.strip_suffix(')') {
        Some(n) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => &stem[..open],
        _ => stem,
    }
}

/// ファイル名からテーブル名を決める
///
/// Chrome の連番を外して小文字化し、英数字と `_` 以外は `_` にする。
pub fn table_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name: String = strip_download_counter(&stem)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "leads".to_string()
    } else {
        name
    }
}

/// CSV → BigQuery ローダー
pub struct CsvLoader<W> {
    config: LoaderConfig,
    project_id: String,
    dataset_id: String,
    warehouse: W,
    reporter: Arc<dyn ErrorReporter>,
    ingestion_date: NaiveDate,
}

impl<W: Warehouse> CsvLoader<W> {
    pub fn new(
        config: LoaderConfig,
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        warehouse: W,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            config,
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            warehouse,
            reporter,
            ingestion_date: Local::now().date_naive(),
        }
    }

    pub fn with_ingestion_date(mut self, date: NaiveDate) -> Self {
        self.ingestion_date = date;
        self
    }

    fn table_for(&self, path: &Path) -> TableRef {
        TableRef {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
            table_id: self
                .config
                .table
                .clone()
                .unwrap_or_else(|| table_name_for(path)),
        }
    }

    async fn load_file(&self, path: &Path) -> Result<JobOutcome, LoadError> {
        let prepared = prepare_csv(path, self.ingestion_date)?;
        let job = UploadJob {
            source: path.to_path_buf(),
            table: self.table_for(path),
            autodetect: true,
            payload: prepared.payload,
            rows: prepared.rows,
        };
        info!("アップロード中: {} ({}行) -> {}", job.file_name(), job.rows, job.table);
        self.warehouse.append(&job).await
    }

    /// アップロード成功後の処理（失敗しても警告のみ）
    fn finish_file(&self, path: &Path) -> io::Result<()> {
        match self.config.after_upload {
            AfterUpload::Keep => Ok(()),
            AfterUpload::Delete => {
                std::fs::remove_file(path)?;
                info!("ファイル削除: {}", file_label(path));
                Ok(())
            }
            AfterUpload::Archive => {
                let archive = self.config.download_path.join(ARCHIVE_DIR);
                std::fs::create_dir_all(&archive)?;
                let target = archive.join(path.file_name().unwrap_or_default());
                std::fs::rename(path, &target)?;
                info!("ファイル退避: {} -> {}", file_label(path), target.display());
                Ok(())
            }
        }
    }

    /// ディレクトリ内の全CSVを1ジョブずつ投入
    pub async fn load_all(&self) -> Result<LoadReport, LoadError> {
        let dir = &self.config.download_path;
        info!("フォルダを走査中: {}", dir.display());

        let files = list_csv_files(dir)?;
        let mut report = LoadReport {
            found: files.len(),
            ..Default::default()
        };
        info!("CSVファイル {}件", report.found);

        for path in files {
            let file = file_label(&path);
            report.attempted += 1;

            match self.load_file(&path).await {
                Ok(outcome) => {
                    report.succeeded += 1;
                    info!(
                        "処理完了: {} (job={}, mode={:?}, rows={:?})",
                        file, outcome.job_id, outcome.mode, outcome.output_rows
                    );
                    if let Err(e) = self.finish_file(&path) {
                        warn!("アップロード後処理に失敗: {}: {}", file, e);
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        "アップロード中止: attempted={}, succeeded={}, remaining={}",
                        report.attempted,
                        report.succeeded,
                        report.found - report.attempted
                    );
                    return Err(e);
                }
                Err(e) => {
                    let err = EtlError::Load(e);
                    report.failures.push(FileFailure {
                        file: file.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    self.reporter.report(Stage::Load, &err);
                }
            }
        }

        info!(
            "アップロード完了: attempted={}, succeeded={}, failed={}",
            report.attempted,
            report.succeeded,
            report.failed()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeResponse, FakeWarehouse, RecordingReporter};
    use std::fs;

    const HEADERLESS_LEADS: &str = "Ann,ann@example.com,555-0100,Austin\n\
        Bob,bob@example.com,555-0101,Boston\n";

    const GOOD_CSV: &str = "Name,Phone,City\n\
        Ann,555-0100,Austin\nBob,555-0101,Boston\nCid,555-0102,Chicago\n\
        Dee,555-0103,Denver\nEve,555-0104,El Paso\nFay,555-0105,Fresno\n\
        Gus,555-0106,Garland\nHal,555-0107,Houston\nIda,555-0108,Irvine\n\
        Jon,555-0109,Jackson\n";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn loader_for(
        dir: &Path,
        warehouse: FakeWarehouse,
        reporter: Arc<RecordingReporter>,
        after_upload: AfterUpload,
    ) -> CsvLoader<FakeWarehouse> {
        let config = LoaderConfig {
            download_path: dir.to_path_buf(),
            table: None,
            after_upload,
        };
        CsvLoader::new(config, "wholesaling-dw", "leads", warehouse, reporter)
            .with_ingestion_date(today())
    }

    #[test]
    fn test_prepare_csv_appends_ingestion_date() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("leads.csv");
        fs::write(&path, "Name,Phone\nAnn,555\nBob,556\n").unwrap();

        let prepared = prepare_csv(&path, today()).unwrap();
        assert_eq!(prepared.rows, 2);
        assert_eq!(
            String::from_utf8(prepared.payload).unwrap(),
            "Name,Phone,Ingestion_date\nAnn,555,2024-01-02\nBob,556,2024-01-02\n"
        );
    }

    #[test]
    fn test_prepare_csv_overwrites_existing_ingestion_column() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("leads.csv");
        fs::write(&path, "Name,ingestion_date\nAnn,\nBob,1999-01-01\n").unwrap();

        let prepared = prepare_csv(&path, today()).unwrap();
        assert_eq!(
            String::from_utf8(prepared.payload).unwrap(),
            "Name,ingestion_date\nAnn,2024-01-02\nBob,2024-01-02\n"
        );
    }

    #[test]
    fn test_prepare_csv_rejects_malformed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let cases = [
            ("empty.csv", ""),
            ("headerless.csv", "1,555-0100,2024-01-01\n2,555-0101,2024-01-01\n"),
            ("headerless_leads.csv", HEADERLESS_LEADS),
            ("headerless_url.csv", "Ann,https://example.com/ann\nBob,https://example.com/bob\n"),
            ("blank.csv", "Name,,City\nAnn,1,Austin\n"),
            ("dupe.csv", "Name,name\nAnn,Ann\n"),
            ("ragged.csv", "Name,Phone\nAnn,555,extra\n"),
            ("header_only.csv", "Name,Phone\n"),
        ];

        for (name, content) in cases {
            let path = tmp.path().join(name);
            fs::write(&path, content).unwrap();
            match prepare_csv(&path, today()) {
                Err(LoadError::BadInput { file, .. }) => assert_eq!(file, name),
                other => panic!("{}: expected BadInput, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_table_name_for() {
        assert_eq!(
            table_name_for(Path::new("/dl/Leads_2024-01-01.csv")),
            "leads_2024_01_01"
        );
        assert_eq!(table_name_for(Path::new("Fresh Leads.CSV")), "fresh_leads");
        assert_eq!(table_name_for(Path::new(".csv")), "_csv");
        // 同名ファイルの再ダウンロードは同じテーブルへ
        assert_eq!(table_name_for(Path::new("/dl/leads (1).csv")), "leads");
        assert_eq!(table_name_for(Path::new("leads (12).csv")), "leads");
        assert_eq!(table_name_for(Path::new("leads (copy).csv")), "leads__copy_");
    }

    #[test]
    fn test_looks_like_data() {
        let values = [
            "42",
            "3.5",
            "2024-01-01",
            "01/02/2024",
            "ann@example.com",
            "555-0100",
            "https://x.io",
        ];
        for value in values {
            assert!(looks_like_data(value), "{}", value);
        }
        for name in ["Name", "Email", "Phone 2", "Lead ID", "Zip Code", "@handle"] {
            assert!(!looks_like_data(name), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_one_good_one_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("leads_2024-01-01.csv"), GOOD_CSV).unwrap();
        fs::write(tmp.path().join("corrupt.csv"), HEADERLESS_LEADS).unwrap();

        let warehouse = FakeWarehouse::default();
        let reporter = Arc::new(RecordingReporter::default());
        let loader = loader_for(tmp.path(), warehouse.clone(), reporter.clone(), AfterUpload::Keep);

        let report = loader.load_all().await.unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].file, "corrupt.csv");
        assert_eq!(report.failures[0].kind, ErrorKind::Validation);

        let jobs = warehouse.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].rows, 10);
        assert_eq!(jobs[0].table.table_id, "leads_2024_01_01");
        assert!(jobs[0].autodetect);

        let reports = reporter.taken();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, Stage::Load);
        assert_eq!(reports[0].1, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_every_file_attempted_and_rerun_is_identical() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..4 {
            fs::write(tmp.path().join(format!("leads_{}.csv", i)), GOOD_CSV).unwrap();
        }

        let warehouse = FakeWarehouse::default()
            .respond("leads_1.csv", FakeResponse::Reject)
            .respond("leads_2.csv", FakeResponse::Network);
        let reporter = Arc::new(RecordingReporter::default());
        let loader = loader_for(tmp.path(), warehouse.clone(), reporter.clone(), AfterUpload::Keep);

        let first = loader.load_all().await.unwrap();
        assert_eq!(first.attempted, 4);
        assert_eq!(first.succeeded, 2);
        assert_eq!(first.failed(), 2);
        assert_eq!(first.failures[1].kind, ErrorKind::TransientIo);

        let second = loader.load_all().await.unwrap();
        assert_eq!(second, first);
        assert_eq!(warehouse.jobs().len(), 8);
        assert_eq!(reporter.taken().len(), 4);
    }

    #[tokio::test]
    async fn test_auth_error_aborts_remaining_files() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a.csv", "b.csv", "c.csv"] {
            fs::write(tmp.path().join(name), GOOD_CSV).unwrap();
        }

        let warehouse = FakeWarehouse::default().respond("b.csv", FakeResponse::Auth);
        let reporter = Arc::new(RecordingReporter::default());
        let loader = loader_for(tmp.path(), warehouse.clone(), reporter.clone(), AfterUpload::Keep);

        let err = loader.load_all().await.unwrap_err();
        assert!(matches!(err, LoadError::Auth(_)));
        assert_eq!(warehouse.jobs().len(), 2);
        // 致命的エラーはパイプライン側で通知する
        assert!(reporter.taken().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = loader_for(
            &tmp.path().join("missing"),
            FakeWarehouse::default(),
            Arc::new(RecordingReporter::default()),
            AfterUpload::Keep,
        );
        assert!(matches!(
            loader.load_all().await,
            Err(LoadError::FileIO(_))
        ));
    }

    #[tokio::test]
    async fn test_after_upload_actions() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("good.csv"), GOOD_CSV).unwrap();
        fs::write(tmp.path().join("bad.csv"), "").unwrap();

        let loader = loader_for(
            tmp.path(),
            FakeWarehouse::default(),
            Arc::new(RecordingReporter::default()),
            AfterUpload::Archive,
        );
        loader.load_all().await.unwrap();
        assert!(tmp.path().join("archive").join("good.csv").exists());
        assert!(!tmp.path().join("good.csv").exists());
        // 失敗したファイルは残す
        assert!(tmp.path().join("bad.csv").exists());

        fs::write(tmp.path().join("next.csv"), GOOD_CSV).unwrap();
        let loader = loader_for(
            tmp.path(),
            FakeWarehouse::default(),
            Arc::new(RecordingReporter::default()),
            AfterUpload::Delete,
        );
        let report = loader.load_all().await.unwrap();
        assert_eq!(report.found, 2);
        assert!(!tmp.path().join("next.csv").exists());
        assert!(tmp.path().join("bad.csv").exists());
    }

    #[tokio::test]
    async fn test_fixed_table_override() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("x.csv"), GOOD_CSV).unwrap();

        let warehouse = FakeWarehouse::default();
        let config = LoaderConfig {
            download_path: tmp.path().to_path_buf(),
            table: Some("fresh_leads".into()),
            after_upload: AfterUpload::Keep,
        };
        let loader = CsvLoader::new(
            config,
            "p",
            "d",
            warehouse.clone(),
            Arc::new(RecordingReporter::default()),
        );
        loader.load_all().await.unwrap();
        assert_eq!(warehouse.jobs()[0].table.to_string(), "p.d.fresh_leads");
    }
}
