use std::fmt;

use thiserror::Error;

/// 設定エラー（起動時に即失敗）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("環境変数が未設定です: {0}")]
    Missing(&'static str),

    #[error("環境変数の値が不正です: {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// スクレイパーエラー
#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("ログインエラー: {0}")]
    Login(String),

    #[error("ダウンロードエラー: {0}")]
    Download(String),

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("要素が見つかりません: {0}")]
    ElementNotFound(String),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),
}

/// BigQueryロードエラー
#[derive(Error, Debug)]
pub enum LoadError {
    /// 認証失敗（致命的: 残りのアップロードを中止）
    #[error("BigQuery認証エラー: {0}")]
    Auth(String),

    #[error("不正なCSVファイル: {file}: {reason}")]
    BadInput { file: String, reason: String },

    /// スキーマ不一致・クォータ超過などサービス側の拒否
    #[error("ロードジョブ拒否: {file}: {reason}")]
    Rejected { file: String, reason: String },

    #[error("ネットワークエラー: {0}")]
    Network(String),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),
}

impl LoadError {
    /// 残りのファイル処理を中止すべきエラーか
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::Auth(_))
    }
}

/// エラー分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    TransientIo,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// パイプライン全体のエラー
#[derive(Error, Debug)]
pub enum EtlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scrape(#[from] ScraperError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl EtlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EtlError::Config(_) => ErrorKind::Configuration,
            EtlError::Scrape(ScraperError::Login(_)) => ErrorKind::Authentication,
            EtlError::Scrape(_) => ErrorKind::TransientIo,
            EtlError::Load(LoadError::Auth(_)) => ErrorKind::Authentication,
            EtlError::Load(LoadError::BadInput { .. } | LoadError::Rejected { .. }) => {
                ErrorKind::Validation
            }
            EtlError::Load(LoadError::Network(_) | LoadError::FileIO(_)) => {
                ErrorKind::TransientIo
            }
        }
    }
}
