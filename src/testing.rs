//! テスト用のフェイク実装

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::bigquery::{JobOutcome, LoadMode, UploadJob};
use crate::download_dir::list_csv_files;
use crate::error::{ErrorKind, EtlError, LoadError, ScraperError};
use crate::fresh_picked::DateRange;
use crate::telemetry::{ErrorReporter, Stage};
use crate::traits::{LeadsBrowser, Warehouse};

/// 通知内容を記録するだけの `ErrorReporter`
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    reports: Mutex<Vec<(Stage, ErrorKind, String)>>,
}

impl RecordingReporter {
    pub fn taken(&self) -> Vec<(Stage, ErrorKind, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, stage: Stage, error: &EtlError) {
        self.reports
            .lock()
            .unwrap()
            .push((stage, error.kind(), error.to_string()));
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum FakeResponse {
    Reject,
    Network,
    Auth,
}

/// 投入されたジョブを記録する `Warehouse`
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeWarehouse {
    jobs: Arc<Mutex<Vec<UploadJob>>>,
    responses: HashMap<String, FakeResponse>,
}

impl FakeWarehouse {
    /// 指定ファイルへの応答を差し替える（既定は成功）
    pub fn respond(mut self, file: &str, response: FakeResponse) -> Self {
        self.responses.insert(file.to_string(), response);
        self
    }

    pub fn jobs(&self) -> Vec<UploadJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn append(&self, job: &UploadJob) -> Result<JobOutcome, LoadError> {
        let file = job.file_name();
        self.jobs.lock().unwrap().push(job.clone());

        match self.responses.get(&file) {
            None => Ok(JobOutcome {
                job_id: format!("job_{}", file),
                mode: LoadMode::Created,
                output_rows: Some(job.rows as u64),
            }),
            Some(FakeResponse::Reject) => Err(LoadError::Rejected {
                file,
                reason: "invalid: Provided Schema does not match Table".into(),
            }),
            Some(FakeResponse::Network) => Err(LoadError::Network(format!("{}: reset", file))),
            Some(FakeResponse::Auth) => Err(LoadError::Auth("HTTP 401: Invalid Credentials".into())),
        }
    }
}

/// 失敗させる手順
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    Login,
    Download,
}

/// ブラウザを使わない `LeadsBrowser`
///
/// `trigger_download` で指定のCSVをダウンロードディレクトリに書き込む。
#[derive(Debug)]
pub(crate) struct FakeBrowser {
    dir: PathBuf,
    exports: Vec<(String, String)>,
    fail_at: Option<FailAt>,
    pub steps: Vec<&'static str>,
    pub range: Option<DateRange>,
}

impl FakeBrowser {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            exports: Vec::new(),
            fail_at: None,
            steps: Vec::new(),
            range: None,
        }
    }

    pub fn exporting(mut self, name: &str, content: &str) -> Self {
        self.exports.push((name.to_string(), content.to_string()));
        self
    }

    pub fn failing_at(mut self, step: FailAt) -> Self {
        self.fail_at = Some(step);
        self
    }

    fn step(&mut self, name: &'static str, fail: FailAt, err: ScraperError) -> Result<(), ScraperError> {
        self.steps.push(name);
        if self.fail_at == Some(fail) {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl LeadsBrowser for FakeBrowser {
    fn download_dir(&self) -> &Path {
        &self.dir
    }

    async fn initialize(&mut self) -> Result<(), ScraperError> {
        self.steps.push("initialize");
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    async fn login(&mut self) -> Result<(), ScraperError> {
        self.step(
            "login",
            FailAt::Login,
            ScraperError::Login("still on login page".into()),
        )
    }

    async fn set_date_range(&mut self, range: &DateRange) -> Result<(), ScraperError> {
        self.range = Some(*range);
        self.steps.push("set_date_range");
        Ok(())
    }

    async fn fetch_leads(&mut self) -> Result<(), ScraperError> {
        self.steps.push("fetch_leads");
        Ok(())
    }

    async fn trigger_download(&mut self) -> Result<(), ScraperError> {
        self.step(
            "trigger_download",
            FailAt::Download,
            ScraperError::Timeout("0 of 1 CSV file(s) arrived within 60s".into()),
        )?;
        for (name, content) in &self.exports {
            std::fs::write(self.dir.join(name), content)?;
        }
        Ok(())
    }

    async fn wait_for_files(
        &mut self,
        before: &HashSet<PathBuf>,
    ) -> Result<Vec<PathBuf>, ScraperError> {
        self.steps.push("wait_for_files");
        Ok(list_csv_files(&self.dir)?
            .into_iter()
            .filter(|p| !before.contains(p))
            .collect())
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        self.steps.push("close");
        Ok(())
    }
}
