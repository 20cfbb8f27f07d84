use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::bigquery::{JobOutcome, UploadJob};
use crate::download_dir::list_csv_files;
use crate::error::{LoadError, ScraperError};
use crate::fresh_picked::DateRange;

/// リードサイトを操作するブラウザの最小インターフェース
#[async_trait]
pub trait LeadsBrowser: Send {
    /// CSVの保存先
    fn download_dir(&self) -> &Path;

    /// ブラウザ初期化
    async fn initialize(&mut self) -> Result<(), ScraperError>;

    /// ログイン実行
    async fn login(&mut self) -> Result<(), ScraperError>;

    /// 日付フィルタ設定
    async fn set_date_range(&mut self, range: &DateRange) -> Result<(), ScraperError>;

    /// リード取得
    async fn fetch_leads(&mut self) -> Result<(), ScraperError>;

    /// CSVダウンロード開始
    async fn trigger_download(&mut self) -> Result<(), ScraperError>;

    /// `before` に無い新しいCSVが揃うまで待機
    async fn wait_for_files(
        &mut self,
        before: &HashSet<PathBuf>,
    ) -> Result<Vec<PathBuf>, ScraperError>;

    /// リソース解放
    async fn close(&mut self) -> Result<(), ScraperError>;

    /// 一括実行（initialize → login → 日付設定 → fetch → download → close）
    ///
    /// 途中で失敗しても `close` は必ず呼ぶ。返すのは最初のエラー。
    async fn execute(&mut self, range: &DateRange) -> Result<Vec<PathBuf>, ScraperError> {
        let result: Result<Vec<PathBuf>, ScraperError> = async {
            self.initialize().await?;
            self.login().await?;
            self.set_date_range(range).await?;
            self.fetch_leads().await?;
            let before: HashSet<PathBuf> =
                list_csv_files(self.download_dir())?.into_iter().collect();
            self.trigger_download().await?;
            self.wait_for_files(&before).await
        }
        .await;

        let closed = self.close().await;
        let files = result?;
        closed?;
        Ok(files)
    }
}

/// CSVを追記するデータウェアハウス
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn append(&self, job: &UploadJob) -> Result<JobOutcome, LoadError>;
}
