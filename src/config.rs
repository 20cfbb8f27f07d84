//! 環境変数からの設定読み込み
//!
//! `.env` があれば `dotenvy` で読み込んでから `EtlConfig::from_env` を呼ぶ。
//! 必須の値が一つでも欠けていれば、ブラウザやネットワークに触れる前に失敗する。

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate};

use crate::error::ConfigError;
use crate::fresh_picked::DateRange;

pub const ENV_PROJECT_ID: &str = "PROJECT_ID";
pub const ENV_DATASET_ID: &str = "DATASET_ID";
pub const ENV_EMAIL: &str = "EMAIL";
pub const ENV_PASSWORD: &str = "PASSWORD";
pub const ENV_SENTRY_DSN: &str = "SENTRY_DSN";
pub const ENV_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// 必須の環境変数
pub const REQUIRED_VARS: [&str; 6] = [
    ENV_PROJECT_ID,
    ENV_DATASET_ID,
    ENV_EMAIL,
    ENV_PASSWORD,
    ENV_SENTRY_DSN,
    ENV_CREDENTIALS,
];

/// `.env` を読み込む（無ければ何もしない）
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// 環境変数の参照元。テストではクロージャで差し替える
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

impl<F> Lookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

/// プロセス環境変数
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Lookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

fn opt(lookup: &impl Lookup, key: &str) -> Option<String> {
    lookup
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(lookup: &impl Lookup, key: &'static str) -> Result<String, ConfigError> {
    opt(lookup, key).ok_or(ConfigError::Missing(key))
}

fn parsed<T>(lookup: &impl Lookup, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match opt(lookup, key) {
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs(lookup: &impl Lookup, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parsed(lookup, key, default).map(Duration::from_secs)
}

fn date(lookup: &impl Lookup, key: &'static str) -> Result<Option<NaiveDate>, ConfigError> {
    opt(lookup, key)
        .map(|v| {
            NaiveDate::parse_from_str(&v, "%Y-%m-%d").map_err(|e| ConfigError::Invalid {
                var: key,
                reason: format!("{} (YYYY-MM-DD)", e),
            })
        })
        .transpose()
}

// ── Scraper ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub email: String,
    pub password: String,
    pub download_path: PathBuf,
    pub headless: bool,
    /// 要素待機のタイムアウト
    pub timeout: Duration,
    pub download_timeout: Duration,
    /// 新しいCSVが増えなくなってから完了とみなすまでの時間
    pub download_settle: Duration,
    /// ダウンロード完了とみなす最小CSV数
    pub min_files: usize,
    pub chrome_path: Option<String>,
    pub debug: bool,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            download_path: PathBuf::from("./downloads"),
            headless: true,
            timeout: Duration::from_secs(15),
            download_timeout: Duration::from_secs(60),
            download_settle: Duration::from_secs(10),
            min_files: 1,
            chrome_path: None,
            debug: false,
        }
    }
}

impl ScraperConfig {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = path.into();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn with_download_settle(mut self, settle: Duration) -> Self {
        self.download_settle = settle;
        self
    }

    /// 認証情報が空でないことを確認
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_EMAIL));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing(ENV_PASSWORD));
        }
        if self.min_files == 0 {
            return Err(ConfigError::Invalid {
                var: "MIN_DOWNLOAD_FILES",
                reason: "1以上を指定してください".into(),
            });
        }
        Ok(())
    }
}

// ── Loader ───────────────────────────────────────────────────

/// アップロード成功後のCSVの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfterUpload {
    /// そのまま残す（次回の実行で同じファイルを再度追記する）
    Keep,
    #[default]
    Delete,
    /// `<download_dir>/archive/` へ移動
    Archive,
}

impl FromStr for AfterUpload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(AfterUpload::Keep),
            "delete" => Ok(AfterUpload::Delete),
            "archive" => Ok(AfterUpload::Archive),
            other => Err(format!(
                "unknown value '{}' (keep | delete | archive)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub download_path: PathBuf,
    /// 全ファイルを追記する固定テーブル。未指定ならファイル名から決める
    pub table: Option<String>,
    pub after_upload: AfterUpload,
}

// ── BigQuery ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub credentials_path: PathBuf,
    pub location: String,
    /// ロードジョブ完了待ちの上限
    pub job_timeout: Duration,
}

// ── Telemetry ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_dir: PathBuf,
    pub log_filter: String,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub release: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_filter: "info,chromiumoxide=warn".to_string(),
            sentry_dsn: None,
            environment: "prod".to_string(),
            release: format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TelemetryConfig {
    /// ログ初期化は設定検証より先に行うため、ここでは失敗しない
    pub fn from_lookup(lookup: &impl Lookup) -> Self {
        let defaults = Self::default();
        Self {
            log_dir: opt(lookup, "LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            log_filter: opt(lookup, "RUST_LOG").unwrap_or(defaults.log_filter),
            sentry_dsn: opt(lookup, ENV_SENTRY_DSN),
            environment: opt(lookup, "ENVIRONMENT").unwrap_or(defaults.environment),
            release: opt(lookup, "RELEASE").unwrap_or(defaults.release),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(&ProcessEnv)
    }
}

// ── Top-level ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub scraper: ScraperConfig,
    pub loader: LoaderConfig,
    pub bigquery: BigQueryConfig,
    pub date_range: DateRange,
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv, Local::now().date_naive())
    }

    /// `today` は日付範囲の既定値（昨日〜今日）の基準日
    pub fn from_lookup(lookup: &impl Lookup, today: NaiveDate) -> Result<Self, ConfigError> {
        // 必須項目は先にまとめて確認する
        for key in REQUIRED_VARS {
            required(lookup, key)?;
        }

        let dsn = required(lookup, ENV_SENTRY_DSN)?;
        dsn.parse::<sentry::types::Dsn>()
            .map_err(|e| ConfigError::Invalid {
                var: ENV_SENTRY_DSN,
                reason: e.to_string(),
            })?;

        let download_path = opt(lookup, "DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        let scraper = ScraperConfig {
            email: required(lookup, ENV_EMAIL)?,
            password: required(lookup, ENV_PASSWORD)?,
            download_path: download_path.clone(),
            headless: parsed(lookup, "HEADLESS", true)?,
            timeout: secs(lookup, "ELEMENT_WAIT_SECS", 15)?,
            download_timeout: secs(lookup, "DOWNLOAD_TIMEOUT_SECS", 60)?,
            download_settle: secs(lookup, "DOWNLOAD_SETTLE_SECS", 10)?,
            min_files: parsed(lookup, "MIN_DOWNLOAD_FILES", 1)?,
            chrome_path: opt(lookup, "CHROME_PATH").or_else(|| opt(lookup, "CHROMIUM_PATH")),
            debug: parsed(lookup, "SCRAPER_DEBUG", false)?,
        };
        scraper.validate()?;

        let loader = LoaderConfig {
            download_path,
            table: opt(lookup, "BQ_TABLE"),
            after_upload: parsed(lookup, "AFTER_UPLOAD", AfterUpload::default())?,
        };

        let bigquery = BigQueryConfig {
            project_id: required(lookup, ENV_PROJECT_ID)?,
            dataset_id: required(lookup, ENV_DATASET_ID)?,
            credentials_path: PathBuf::from(required(lookup, ENV_CREDENTIALS)?),
            location: opt(lookup, "BQ_LOCATION").unwrap_or_else(|| "US".to_string()),
            job_timeout: secs(lookup, "LOAD_TIMEOUT_SECS", 300)?,
        };

        let date_range = match (
            date(lookup, "LEADS_START_DATE")?,
            date(lookup, "LEADS_END_DATE")?,
        ) {
            (Some(start), Some(end)) => {
                // サイトの日付欄には年を入力できない（今年として扱われる）
                for (var, d) in [("LEADS_START_DATE", start), ("LEADS_END_DATE", end)] {
                    if d.year() != today.year() {
                        return Err(ConfigError::Invalid {
                            var,
                            reason: format!("{} は今年({})の日付ではありません", d, today.year()),
                        });
                    }
                }
                DateRange::new(start, end).map_err(|reason| ConfigError::Invalid {
                    var: "LEADS_START_DATE",
                    reason,
                })?
            }
            (None, None) => DateRange::yesterday_to(today),
            (Some(_), None) => return Err(ConfigError::Missing("LEADS_END_DATE")),
            (None, Some(_)) => return Err(ConfigError::Missing("LEADS_START_DATE")),
        };

        Ok(Self {
            scraper,
            loader,
            bigquery,
            date_range,
        })
    }
}
