//! BigQuery 関連の型定義

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 追記先テーブル
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    /// 同じデータセット内のステージングテーブル
    pub fn staging(&self, now: DateTime<Utc>) -> Self {
        Self {
            table_id: format!("{}__stg_{}", self.table_id, now.format("%Y%m%d%H%M%S")),
            ..self.clone()
        }
    }

    /// 標準SQL用のバッククォート付き名前
    pub fn sql_name(&self) -> String {
        format!("`{}`", self)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// 1ファイル分のロードジョブ
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub source: PathBuf,
    pub table: TableRef,
    pub autodetect: bool,
    /// `Ingestion_date` 列を付与したCSV本体
    pub payload: Vec<u8>,
    pub rows: usize,
}

impl UploadJob {
    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source.display().to_string())
    }
}

/// 追記方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// テーブルが無かったので自動検出スキーマで作成した
    Created,
    /// ステージング経由で既存スキーマに SAFE_CAST して追記した
    Staged,
}

/// ロードジョブ結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub mode: LoadMode,
    pub output_rows: Option<u64>,
}

/// ジョブID（英数字・`_`・`-` のみ、最大1024文字）
pub fn job_id_for(table_id: &str, now: DateTime<Utc>) -> String {
    let table: String = table_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(200)
        .collect();
    format!("leads_etl_{}_{}", table, now.format("%Y%m%d%H%M%S%6f"))
}

// ── REST リソース ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobResource<'a> {
    pub job_reference: JobReference,
    pub configuration: JobConfiguration<'a>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobReference {
    pub project_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct JobConfiguration<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadConfiguration<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryConfiguration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoadConfiguration<'a> {
    pub destination_table: &'a TableRef,
    pub source_format: &'static str,
    pub skip_leading_rows: u32,
    pub autodetect: bool,
    pub write_disposition: &'static str,
    pub create_disposition: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryConfiguration {
    pub query: String,
    pub use_legacy_sql: bool,
}

impl<'a> JobResource<'a> {
    fn reference(project_id: &str, job_id: &str, location: &str) -> JobReference {
        JobReference {
            project_id: project_id.to_string(),
            job_id: job_id.to_string(),
            location: Some(location.to_string()),
        }
    }

    /// CSVロードジョブ（新規テーブル・ステージングとも WRITE_TRUNCATE）
    pub fn csv_load(table: &'a TableRef, job_id: &str, location: &str, autodetect: bool) -> Self {
        Self {
            job_reference: Self::reference(&table.project_id, job_id, location),
            configuration: JobConfiguration {
                load: Some(LoadConfiguration {
                    destination_table: table,
                    source_format: "CSV",
                    skip_leading_rows: 1,
                    autodetect,
                    write_disposition: "WRITE_TRUNCATE",
                    create_disposition: "CREATE_IF_NEEDED",
                }),
                query: None,
            },
        }
    }

    /// 標準SQLのクエリジョブ
    pub fn query(project_id: &str, job_id: &str, location: &str, sql: String) -> Self {
        Self {
            job_reference: Self::reference(project_id, job_id, location),
            configuration: JobConfiguration {
                load: None,
                query: Some(QueryConfiguration {
                    query: sql,
                    use_legacy_sql: false,
                }),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobStatus {
    pub state: String,
    #[serde(default)]
    pub error_result: Option<ErrorProto>,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorProto {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobStatistics {
    #[serde(default)]
    pub load: Option<LoadStatistics>,
    #[serde(default)]
    pub query: Option<QueryStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoadStatistics {
    /// int64 は文字列で返る
    #[serde(default)]
    pub output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryStatistics {
    #[serde(default)]
    pub num_dml_affected_rows: Option<String>,
}

/// テーブルのスキーマ列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

/// tables.get / tables.patch のリソース（スキーマのみ使う）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TableResource {
    #[serde(default)]
    pub schema: TableSchema,
}

/// HTTPエラー応答 `{"error": {...}}`
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

fn parse_count(value: &Option<String>) -> Option<u64> {
    value.as_ref()?.parse().ok()
}

impl JobResponse {
    pub fn is_done(&self) -> bool {
        self.status.state == "DONE"
    }

    /// ロード行数、クエリならDMLの影響行数
    pub fn output_rows(&self) -> Option<u64> {
        let stats = self.statistics.as_ref()?;
        stats
            .load
            .as_ref()
            .and_then(|l| parse_count(&l.output_rows))
            .or_else(|| {
                stats
                    .query
                    .as_ref()
                    .and_then(|q| parse_count(&q.num_dml_affected_rows))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn table() -> TableRef {
        TableRef {
            project_id: "wholesaling-dw".into(),
            dataset_id: "leads".into(),
            table_id: "leads_2024_01_01".into(),
        }
    }

    #[test]
    fn test_table_ref_display() {
        assert_eq!(table().to_string(), "wholesaling-dw.leads.leads_2024_01_01");
        assert_eq!(table().sql_name(), "`wholesaling-dw.leads.leads_2024_01_01`");
    }

    #[test]
    fn test_staging_table_name() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let staging = table().staging(now);
        assert_eq!(staging.table_id, "leads_2024_01_01__stg_20240102030405");
        assert_eq!(staging.dataset_id, "leads");
    }

    #[test]
    fn test_job_id_is_sanitized() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let id = job_id_for("fresh leads.v2", now);
        assert_eq!(id, "leads_etl_fresh_leads_v2_20240102030405000000");
    }

    #[test]
    fn test_csv_load_resource_json() {
        let table = table();
        let resource = JobResource::csv_load(&table, "job-1", "US", true);
        let json = serde_json::to_value(&resource).unwrap();

        assert_eq!(json["jobReference"]["jobId"], "job-1");
        assert_eq!(json["jobReference"]["location"], "US");
        let load = &json["configuration"]["load"];
        assert_eq!(load["destinationTable"]["tableId"], "leads_2024_01_01");
        assert_eq!(load["destinationTable"]["datasetId"], "leads");
        assert_eq!(load["sourceFormat"], "CSV");
        assert_eq!(load["skipLeadingRows"], 1);
        assert_eq!(load["autodetect"], true);
        assert_eq!(load["writeDisposition"], "WRITE_TRUNCATE");
        assert!(json["configuration"].get("query").is_none());
    }

    #[test]
    fn test_query_resource_json() {
        let resource = JobResource::query("p", "job-2", "US", "SELECT 1".into());
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["configuration"]["query"]["query"], "SELECT 1");
        assert_eq!(json["configuration"]["query"]["useLegacySql"], false);
        assert!(json["configuration"].get("load").is_none());
    }

    #[test]
    fn test_job_response_parsing() {
        let body = r#"{
            "status": {"state": "DONE"},
            "statistics": {"load": {"outputRows": "10"}}
        }"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        assert!(resp.is_done());
        assert_eq!(resp.output_rows(), Some(10));

        let body = r#"{
            "status": {"state": "DONE"},
            "statistics": {"query": {"numDmlAffectedRows": "7"}}
        }"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.output_rows(), Some(7));

        let body = r#"{"status": {"state": "RUNNING"}}"#;
        let resp: JobResponse = serde_json::from_str(body).unwrap();
        assert!(!resp.is_done());
        assert_eq!(resp.output_rows(), None);
    }

    #[test]
    fn test_table_resource_parsing() {
        let body = r#"{"id": "x", "schema": {"fields": [
            {"name": "Name", "type": "STRING", "mode": "NULLABLE"},
            {"name": "Ingestion_date", "type": "DATE"}
        ]}}"#;
        let table: TableResource = serde_json::from_str(body).unwrap();
        assert_eq!(table.schema.fields.len(), 2);
        assert_eq!(table.schema.fields[1].field_type, "DATE");
        assert_eq!(table.schema.fields[1].mode, None);
    }
}
