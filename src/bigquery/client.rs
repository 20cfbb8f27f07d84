//! BigQuery REST クライアント
//!
//! サービスアカウントでトークンを取得し、multipart アップロードでロードジョブを
//! 投入して完了までポーリングする。
//!
//! - テーブルが無い: 自動検出スキーマで作成してロード
//! - テーブルがある: ステージングにロードし、既存スキーマへ `SAFE_CAST` して INSERT

use std::error::Error as StdError;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use yup_oauth2::authenticator::DefaultAuthenticator;
use yup_oauth2::ServiceAccountAuthenticator;

use crate::config::BigQueryConfig;
use crate::error::LoadError;
use crate::traits::Warehouse;

use super::staging::{dropped_columns, safe_cast_insert, with_ingestion_column};
use super::types::{
    job_id_for, ErrorProto, ErrorResponse, FieldSchema, JobOutcome, JobResource, JobResponse,
    LoadMode, TableRef, TableResource, TableSchema, UploadJob,
};

const SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";

const HTTP_TIMEOUT_SECS: u64 = 120;
const JOB_POLL_INTERVAL_MS: u64 = 1000;

/// BigQuery への CSV 追記
pub struct BigQueryWarehouse {
    config: BigQueryConfig,
    auth: DefaultAuthenticator,
    http: reqwest::Client,
}

impl BigQueryWarehouse {
    /// 認証情報を読み込み、トークン取得まで確認する
    ///
    /// 認証情報ファイルが無い・壊れている・拒否された場合は `LoadError::Auth`。
    pub async fn connect(config: BigQueryConfig) -> Result<Self, LoadError> {
        info!(
            "BigQueryに接続中: project={}, dataset={}",
            config.project_id, config.dataset_id
        );

        let auth = Self::authenticator(&config.credentials_path).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| LoadError::Network(e.to_string()))?;

        let warehouse = Self { config, auth, http };
        warehouse.token().await?;
        info!("BigQuery認証完了");
        Ok(warehouse)
    }

    async fn authenticator(credentials_path: &Path) -> Result<DefaultAuthenticator, LoadError> {
        let key = yup_oauth2::read_service_account_key(credentials_path)
            .await
            .map_err(|e| {
                LoadError::Auth(format!(
                    "credential file {}: {}",
                    credentials_path.display(),
                    e
                ))
            })?;

        ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|e| LoadError::Auth(format!("service account: {}", e)))
    }

    async fn token(&self) -> Result<String, LoadError> {
        let token = self
            .auth
            .token(&[SCOPE])
            .await
            .map_err(classify_token_error)?;
        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| LoadError::Auth("access token: empty token".into()))
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            API_URL, table.project_id, table.dataset_id, table.table_id
        )
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        file: &str,
    ) -> Result<(StatusCode, String), LoadError> {
        let response = request
            .send()
            .await
            .map_err(|e| LoadError::Network(format!("{}: {}", file, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LoadError::Network(format!("{}: {}", file, e)))?;
        Ok((status, body))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        file: &str,
    ) -> Result<T, LoadError> {
        let (status, body) = self.execute(request, file).await?;
        if !status.is_success() {
            return Err(classify_http(status.as_u16(), &body, file));
        }
        serde_json::from_str(&body)
            .map_err(|e| LoadError::Network(format!("{}: unexpected response: {}", file, e)))
    }

    /// テーブル取得（存在しなければ `None`）
    async fn get_table(
        &self,
        table: &TableRef,
        token: &str,
        file: &str,
    ) -> Result<Option<TableResource>, LoadError> {
        let request = self.http.get(self.table_url(table)).bearer_auth(token);
        let (status, body) = self.execute(request, file).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_http(status.as_u16(), &body, file));
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| LoadError::Network(format!("{}: unexpected table: {}", file, e)))
    }

    async fn patch_schema(
        &self,
        table: &TableRef,
        fields: Vec<FieldSchema>,
        token: &str,
        file: &str,
    ) -> Result<TableResource, LoadError> {
        let resource = TableResource {
            schema: TableSchema { fields },
        };
        let request = self
            .http
            .patch(self.table_url(table))
            .bearer_auth(token)
            .json(&resource);
        self.send(request, file).await
    }

    async fn delete_table(&self, table: &TableRef, token: &str, file: &str) -> Result<(), LoadError> {
        let request = self.http.delete(self.table_url(table)).bearer_auth(token);
        let (status, body) = self.execute(request, file).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(classify_http(status.as_u16(), &body, file))
    }

    /// ジョブ完了までポーリング
    async fn wait_for_job(
        &self,
        job_id: &str,
        token: &str,
        file: &str,
    ) -> Result<JobResponse, LoadError> {
        let url = format!(
            "{}/projects/{}/jobs/{}",
            API_URL, self.config.project_id, job_id
        );
        let start = Instant::now();

        loop {
            let request = self
                .http
                .get(&url)
                .query(&[("location", self.config.location.as_str())])
                .bearer_auth(token);
            let job: JobResponse = self.send(request, file).await?;

            if job.is_done() {
                return Ok(job);
            }
            if start.elapsed() > self.config.job_timeout {
                return Err(LoadError::Network(format!(
                    "{}: job {} not done within {}s",
                    file,
                    job_id,
                    self.config.job_timeout.as_secs()
                )));
            }

            debug!("ジョブ待機中: {} state={}", job_id, job.status.state);
            sleep(Duration::from_millis(JOB_POLL_INTERVAL_MS)).await;
        }
    }

    /// ジョブを投入し、完了後の errorResult を分類する
    async fn run_job(
        &self,
        request: reqwest::RequestBuilder,
        job_id: &str,
        token: &str,
        file: &str,
    ) -> Result<JobResponse, LoadError> {
        let inserted: JobResponse = self.send(request, file).await?;
        let done = if inserted.is_done() {
            inserted
        } else {
            self.wait_for_job(job_id, token, file).await?
        };

        if let Some(error) = &done.status.error_result {
            debug!("ジョブ {} のエラー: {:?}", job_id, done.status.errors);
            return Err(classify_job_error(error, file));
        }
        Ok(done)
    }

    async fn load_csv(
        &self,
        table: &TableRef,
        job: &UploadJob,
        token: &str,
        file: &str,
    ) -> Result<(String, JobResponse), LoadError> {
        let job_id = job_id_for(&table.table_id, Utc::now());
        let resource =
            JobResource::csv_load(table, &job_id, &self.config.location, job.autodetect);
        let metadata = serde_json::to_vec(&resource)
            .map_err(|e| LoadError::Network(format!("{}: job metadata: {}", file, e)))?;
        let (content_type, body) = multipart_related(&metadata, &job.payload);

        debug!("ロードジョブ投入: {} ({} -> {})", job_id, file, table);
        let url = format!(
            "{}/projects/{}/jobs?uploadType=multipart",
            UPLOAD_URL, self.config.project_id
        );
        let request = self
            .http
            .post(url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, content_type)
            .body(body);

        let done = self.run_job(request, &job_id, token, file).await?;
        Ok((job_id, done))
    }

    async fn run_query(
        &self,
        table: &TableRef,
        sql: String,
        token: &str,
        file: &str,
    ) -> Result<(String, JobResponse), LoadError> {
        let job_id = job_id_for(&format!("{}_insert", table.table_id), Utc::now());
        let resource =
            JobResource::query(&self.config.project_id, &job_id, &self.config.location, sql);
        debug!("クエリジョブ投入: {} ({})", job_id, file);

        let url = format!("{}/projects/{}/jobs", API_URL, self.config.project_id);
        let request = self.http.post(url).bearer_auth(token).json(&resource);

        let done = self.run_job(request, &job_id, token, file).await?;
        Ok((job_id, done))
    }

    async fn append_via_staging(
        &self,
        job: &UploadJob,
        target: TableResource,
        token: &str,
        file: &str,
    ) -> Result<JobOutcome, LoadError> {
        let mut target_fields = target.schema.fields;
        if let Some(fields) = with_ingestion_column(&target_fields) {
            self.patch_schema(&job.table, fields.clone(), token, file)
                .await?;
            info!("Ingestion_date 列を追加: {}", job.table);
            target_fields = fields;
        }

        let staging = job.table.staging(Utc::now());
        info!("ステージングテーブルへロード: {}", staging);

        let result: Result<(String, JobResponse), LoadError> = async {
            self.load_csv(&staging, job, token, file).await?;
            let staged = self
                .get_table(&staging, token, file)
                .await?
                .ok_or_else(|| LoadError::Network(format!("{}: staging table vanished", file)))?;

            let dropped = dropped_columns(&target_fields, &staged.schema.fields);
            if !dropped.is_empty() {
                warn!("{}: 既存テーブルに無い列を破棄: {:?}", file, dropped);
            }

            let sql = safe_cast_insert(&job.table, &staging, &target_fields, &staged.schema.fields);
            debug!("INSERT SQL:\n{}", sql);
            self.run_query(&job.table, sql, token, file).await
        }
        .await;

        match self.delete_table(&staging, token, file).await {
            Ok(()) => debug!("ステージングテーブル削除: {}", staging),
            Err(e) => warn!("ステージングテーブル削除失敗: {}: {}", staging, e),
        }

        let (job_id, done) = result?;
        Ok(JobOutcome {
            job_id,
            mode: LoadMode::Staged,
            output_rows: done.output_rows(),
        })
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn append(&self, job: &UploadJob) -> Result<JobOutcome, LoadError> {
        let file = job.file_name();
        let token = self.token().await?;

        match self.get_table(&job.table, &token, &file).await? {
            Some(target) => self.append_via_staging(job, target, &token, &file).await,
            None => {
                info!("テーブルが無いため自動検出スキーマで作成: {}", job.table);
                let (job_id, done) = self.load_csv(&job.table, job, &token, &file).await?;
                Ok(JobOutcome {
                    job_id,
                    mode: LoadMode::Created,
                    output_rows: done.output_rows(),
                })
            }
        }
    }
}

/// `multipart/related` ボディ（JSONメタデータ + CSV本体）
pub(crate) fn multipart_related(metadata: &[u8], csv: &[u8]) -> (String, Vec<u8>) {
    let mut boundary = format!("leads_etl_{}", Utc::now().timestamp_nanos_opt().unwrap_or(0));
    while contains(csv, boundary.as_bytes()) {
        boundary.push('x');
    }

    let mut body = Vec::with_capacity(metadata.len() + csv.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: text/csv\r\n\r\n");
    body.extend_from_slice(csv);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    (format!("multipart/related; boundary={}", boundary), body)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn is_quota_reason(reason: &str) -> bool {
    matches!(reason, "quotaExceeded" | "rateLimitExceeded")
}

fn has_io_source(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<std::io::Error>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// トークン取得エラーを分類
///
/// 通信・I/O の失敗はファイル単位の `Network`、それ以外（鍵不正・拒否）は `Auth`。
pub(crate) fn classify_token_error(err: yup_oauth2::Error) -> LoadError {
    match err {
        yup_oauth2::Error::HttpError(e) => LoadError::Network(format!("access token: {}", e)),
        yup_oauth2::Error::LowLevelError(e) => LoadError::Network(format!("access token: {}", e)),
        yup_oauth2::Error::AuthError(e) => LoadError::Auth(format!("access token: {}", e)),
        other if has_io_source(&other) => LoadError::Network(format!("access token: {}", other)),
        other => LoadError::Auth(format!("access token: {}", other)),
    }
}

/// HTTPエラー応答を分類
pub(crate) fn classify_http(status: u16, body: &str, file: &str) -> LoadError {
    let parsed = serde_json::from_str::<ErrorResponse>(body).ok();
    let reason = parsed
        .as_ref()
        .and_then(|r| r.error.errors.first())
        .and_then(|e| e.reason.clone())
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .and_then(|r| r.error.message.clone())
        .unwrap_or_else(|| body.chars().take(500).collect());
    let detail = format!("HTTP {} {}: {}", status, reason, message);

    match status {
        // 403 はクォータ超過でも返る
        401 | 403 if !is_quota_reason(&reason) => LoadError::Auth(detail),
        400..=499 => LoadError::Rejected {
            file: file.to_string(),
            reason: detail,
        },
        _ => LoadError::Network(format!("{}: {}", file, detail)),
    }
}

/// ジョブの errorResult を分類
pub(crate) fn classify_job_error(error: &ErrorProto, file: &str) -> LoadError {
    let reason = error.reason.clone().unwrap_or_default();
    let detail = format!(
        "{}: {}",
        reason,
        error.message.clone().unwrap_or_default()
    );

    match reason.as_str() {
        "accessDenied" => LoadError::Auth(detail),
        "backendError" | "internalError" => LoadError::Network(format!("{}: {}", file, detail)),
        _ => LoadError::Rejected {
            file: file.to_string(),
            reason: detail,
        },
    }
}
