//! ログとエラー通知
//!
//! `Telemetry` は main で一度だけ作り、終了時に `shutdown` でフラッシュする。
//! 各コンポーネントには `ErrorReporter` を渡す。

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use sentry::types::Dsn;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

use crate::config::TelemetryConfig;
use crate::error::EtlError;

const LOG_FILE_PREFIX: &str = "leads-etl";
const LOG_FILES_KEPT: usize = 7;
const SENTRY_FLUSH_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("ログファイル初期化エラー: {0}")]
    LogFile(#[from] InitError),

    #[error("ログ初期化エラー: {0}")]
    Subscriber(#[from] TryInitError),
}

/// 処理段階（エラー通知のタグ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Startup,
    Scrape,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Startup => "startup",
            Stage::Scrape => "scrape",
            Stage::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 捕捉したエラーをログに残し外部へ通知する
pub trait ErrorReporter: Send + Sync {
    fn report(&self, stage: Stage, error: &EtlError);
}

/// Sentry へ送る `ErrorReporter`
///
/// Sentry クライアントが未初期化ならログ出力のみ。
#[derive(Debug, Clone, Copy, Default)]
pub struct SentryReporter;

impl ErrorReporter for SentryReporter {
    fn report(&self, stage: Stage, err: &EtlError) {
        let kind = err.kind();
        error!(stage = stage.as_str(), kind = kind.as_str(), "{}", err);

        sentry::with_scope(
            |scope| {
                scope.set_tag("stage", stage.as_str());
                scope.set_tag("kind", kind.as_str());
            },
            || sentry::capture_error(err),
        );
    }
}

/// ログ出力とエラー通知のコンテキスト
pub struct Telemetry {
    _log_guard: WorkerGuard,
    sentry: Option<sentry::ClientInitGuard>,
}

impl Telemetry {
    /// コンソール + ローテーションファイルのログを設定し、DSNがあればSentryを有効化
    pub fn init(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .max_log_files(LOG_FILES_KEPT)
            .build(&config.log_dir)?;
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let filter = EnvFilter::try_new(&config.log_filter)
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let console_layer = tracing_fmt::layer().with_target(false);
        let file_layer = tracing_fmt::layer()
            .with_ansi(false)
            .with_writer(file_writer)
            .with_file(true)
            .with_line_number(true)
            .with_target(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()?;

        info!(
            "ログ出力先: {}/{}.*.log",
            config.log_dir.display(),
            LOG_FILE_PREFIX
        );

        Ok(Self {
            _log_guard: guard,
            sentry: Self::init_sentry(config),
        })
    }

    fn init_sentry(config: &TelemetryConfig) -> Option<sentry::ClientInitGuard> {
        let Some(raw) = &config.sentry_dsn else {
            warn!("SENTRY_DSN 未設定のため、エラーはログのみに記録します");
            return None;
        };
        let dsn = match raw.parse::<Dsn>() {
            Ok(dsn) => dsn,
            Err(e) => {
                warn!("SENTRY_DSN が不正です ({})。エラーはログのみに記録します", e);
                return None;
            }
        };

        let guard = sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: Some(Cow::Owned(config.release.clone())),
            environment: Some(Cow::Owned(config.environment.clone())),
            send_default_pii: false,
            ..Default::default()
        });
        info!(
            "Sentry 有効 (environment={}, release={})",
            config.environment, config.release
        );
        Some(guard)
    }

    pub fn reporter(&self) -> SentryReporter {
        SentryReporter
    }

    /// Sentry 送信待ちとログバッファをフラッシュして終了
    pub fn shutdown(self) {
        info!("ログとエラー通知をフラッシュ中...");
        if self.sentry.is_some() {
            if let Some(client) = sentry::Hub::current().client() {
                client.flush(Some(Duration::from_secs(SENTRY_FLUSH_SECS)));
            }
        }
        // ここで WorkerGuard が drop されファイルへ書き出される
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LoadError, ScraperError};

    #[test]
    fn test_sentry_reporter_tags_stage_and_kind() {
        let events = sentry::test::with_captured_events(|| {
            let err: EtlError = LoadError::BadInput {
                file: "corrupt.csv".into(),
                reason: "missing header row".into(),
            }
            .into();
            SentryReporter.report(Stage::Load, &err);
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.tags.get("stage").map(String::as_str), Some("load"));
        assert_eq!(event.tags.get("kind").map(String::as_str), Some("validation"));
        assert!(event.exception.values[0]
            .value
            .as_deref()
            .unwrap_or_default()
            .contains("corrupt.csv"));
    }

    #[test]
    fn test_scope_tags_do_not_leak() {
        let events = sentry::test::with_captured_events(|| {
            let err: EtlError = ScraperError::Login("wrong password".into()).into();
            SentryReporter.report(Stage::Scrape, &err);
            sentry::capture_message("after", sentry::Level::Info);
        });

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].tags.get("kind").map(String::as_str),
            Some("authentication")
        );
        assert!(events[1].tags.get("stage").is_none());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Scrape.to_string(), "scrape");
        assert_eq!(Stage::Startup.as_str(), "startup");
    }
}
