//! FreshPickedLeads スクレイパー実装
//!
//! ログイン → 日付フィルタ → Fetch Leads → Download の順にブラウザを操作し、
//! エクスポートされたCSVをダウンロードディレクトリに保存する

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ScraperConfig;
use crate::download_dir::{has_partial_downloads, list_csv_files};
use crate::error::ScraperError;
use crate::traits::LeadsBrowser;

use super::types::DateRange;

const LOGIN_URL: &str = "https://freshpickedleads.com/login?redirect=%2Fapp%2Fleads";

const EMAIL_SELECTOR: &str = "input[name*='email']";
const PASSWORD_SELECTOR: &str = "input[name*='password']";
const LOGIN_BUTTON_SELECTOR: &str = "button[class*='Login__Button']";
const START_DATE_SELECTOR: &str = "input[name*='start']";
const END_DATE_SELECTOR: &str = "input[name*='end']";

const FETCH_BUTTON_TEXT: &str = "Fetch Leads";
const DOWNLOAD_BUTTON_TEXT: &str = "Download";

/// ログインボタン押下後、リダイレクトを待つ上限
const LOGIN_SETTLE_SECS: u64 = 10;
const POLL_INTERVAL_MS: u64 = 500;

/// FreshPickedLeads スクレイパー
pub struct FreshPickedScraper {
    config: ScraperConfig,
    browser: Option<Browser>,
    page: Option<Arc<Page>>,
    handler: Option<JoinHandle<()>>,
}

impl FreshPickedScraper {
    pub fn new(config: ScraperConfig) -> Self {
        Self {
            config,
            browser: None,
            page: None,
            handler: None,
        }
    }

    fn get_page(&self) -> Result<Arc<Page>, ScraperError> {
        self.page
            .clone()
            .ok_or_else(|| ScraperError::BrowserInit("Browser not initialized".into()))
    }

    /// 要素が現れるまでポーリング
    async fn wait_for_element(
        &self,
        page: &Page,
        selector: &str,
        label: &str,
    ) -> Result<Element, ScraperError> {
        let start = Instant::now();
        loop {
            match page.find_element(selector).await {
                Ok(element) => {
                    debug!("{} を検出 ({})", label, selector);
                    return Ok(element);
                }
                Err(e) => {
                    if start.elapsed() > self.config.timeout {
                        return Err(ScraperError::ElementNotFound(format!(
                            "{} ({}): {}",
                            label, selector, e
                        )));
                    }
                }
            }
            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    /// テキストを含むボタンをJavaScriptでクリック（表示されるまでポーリング）
    async fn click_button_with_text(&self, page: &Page, text: &str) -> Result<(), ScraperError> {
        let needle = serde_json::to_string(text)
            .map_err(|e| ScraperError::Navigation(format!("button text: {}", e)))?;
        let script = format!(
            r#"
            (function() {{
                var buttons = document.querySelectorAll('button');
                for (var i = 0; i < buttons.length; i++) {{
                    if (buttons[i].textContent.indexOf({}) >= 0 && !buttons[i].disabled) {{
                        buttons[i].click();
                        return true;
                    }}
                }}
                return false;
            }})()
            "#,
            needle
        );

        let start = Instant::now();
        loop {
            let clicked: bool = page
                .evaluate(script.as_str())
                .await
                .map_err(|e| ScraperError::Navigation(format!("{} button: {}", text, e)))?
                .into_value()
                .unwrap_or(false);

            if clicked {
                info!("'{}' ボタンをクリック", text);
                return Ok(());
            }
            if start.elapsed() > self.config.timeout {
                return Err(ScraperError::ElementNotFound(format!(
                    "button containing '{}'",
                    text
                )));
            }
            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    async fn current_url(page: &Page) -> String {
        page.evaluate("window.location.href")
            .await
            .ok()
            .and_then(|v| v.into_value::<String>().ok())
            .unwrap_or_default()
    }

    fn is_login_url(url: &str) -> bool {
        url.to_ascii_lowercase().contains("/login")
    }

    /// Download ボタンが見つからない場合はそのまま返し、それ以外はダウンロード失敗とする
    fn download_error(err: ScraperError) -> ScraperError {
        match err {
            ScraperError::ElementNotFound(_) => err,
            other => ScraperError::Download(other.to_string()),
        }
    }

    /// デバッグスクリーンショット（SCRAPER_DEBUG=true のときのみ）
    async fn debug_screenshot(&self, page: &Page, label: &str) {
        if !self.config.debug {
            return;
        }
        match page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
        {
            Ok(screenshot) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&screenshot);
                info!("{} スクリーンショット: data:image/png;base64,{}", label, encoded);
            }
            Err(e) => warn!("{} スクリーンショット取得失敗: {}", label, e),
        }
    }
}

#[async_trait]
impl LeadsBrowser for FreshPickedScraper {
    fn download_dir(&self) -> &Path {
        &self.config.download_path
    }

    async fn initialize(&mut self) -> Result<(), ScraperError> {
        info!("ブラウザを初期化中...");

        // ダウンロードディレクトリを作成
        std::fs::create_dir_all(&self.config.download_path)?;

        let download_path = self
            .config
            .download_path
            .canonicalize()
            .unwrap_or_else(|_| self.config.download_path.clone());
        info!("Chromeダウンロード先: {}", download_path.display());

        let mut builder = BrowserConfig::builder()
            .window_size(1920, 1080)
            .no_sandbox()
            .request_timeout(Duration::from_secs(60))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(chrome_path) = &self.config.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }
        if self.config.debug {
            builder = builder.arg("--enable-logging=stderr").arg("--v=1");
        }

        let browser_config = builder
            .build()
            .map_err(|e| ScraperError::BrowserInit(format!("browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;

        // ブラウザイベントハンドラをバックグラウンドで実行
        self.handler = Some(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!("Browser event: {:?}", event);
            }
        }));

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;

        // ダウンロード先を設定（サイトが付けたファイル名のまま保存）
        let download_params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(download_path.to_string_lossy().to_string())
            .events_enabled(true)
            .build()
            .map_err(|e| ScraperError::BrowserInit(format!("download behavior: {}", e)))?;

        page.execute(download_params)
            .await
            .map_err(|e| ScraperError::BrowserInit(format!("download behavior: {}", e)))?;

        self.browser = Some(browser);
        self.page = Some(Arc::new(page));

        info!("ブラウザ初期化完了");
        Ok(())
    }

    async fn login(&mut self) -> Result<(), ScraperError> {
        let page = self.get_page()?;
        info!("ログインページへ移動: {}", LOGIN_URL);

        page.goto(LOGIN_URL)
            .await
            .map_err(|e| ScraperError::Navigation(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| ScraperError::Navigation(e.to_string()))?;

        let url = Self::current_url(&page).await;
        if !Self::is_login_url(&url) {
            return Err(ScraperError::Navigation(format!(
                "unexpected page loaded: {}",
                url
            )));
        }
        info!("ログインページ読み込み完了");

        self.wait_for_element(&page, EMAIL_SELECTOR, "email input")
            .await?
            .click()
            .await
            .map_err(|e| ScraperError::Login(format!("email input: {}", e)))?
            .type_str(&self.config.email)
            .await
            .map_err(|e| ScraperError::Login(format!("email input: {}", e)))?;
        debug!("メールアドレス入力完了");

        self.wait_for_element(&page, PASSWORD_SELECTOR, "password input")
            .await?
            .click()
            .await
            .map_err(|e| ScraperError::Login(format!("password input: {}", e)))?
            .type_str(&self.config.password)
            .await
            .map_err(|e| ScraperError::Login(format!("password input: {}", e)))?;
        debug!("パスワード入力完了");

        self.wait_for_element(&page, LOGIN_BUTTON_SELECTOR, "login button")
            .await?
            .click()
            .await
            .map_err(|e| ScraperError::Login(format!("login button: {}", e)))?;
        info!("ログインボタンをクリック、リダイレクト待機中...");

        // ログイン成功ならアプリ画面へリダイレクトされる
        let start = Instant::now();
        loop {
            let url = Self::current_url(&page).await;
            if !url.is_empty() && !Self::is_login_url(&url) {
                info!("ログイン成功: {}", url);
                return Ok(());
            }
            if start.elapsed() > Duration::from_secs(LOGIN_SETTLE_SECS) {
                self.debug_screenshot(&page, "Login").await;
                return Err(ScraperError::Login(format!(
                    "still on login page after {}s (invalid credentials or blocked): {}",
                    LOGIN_SETTLE_SECS, url
                )));
            }
            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    async fn set_date_range(&mut self, range: &DateRange) -> Result<(), ScraperError> {
        let page = self.get_page()?;
        info!("日付範囲を設定中: {} 〜 {}", range.start, range.end);

        self.wait_for_element(&page, START_DATE_SELECTOR, "start date input")
            .await?
            .click()
            .await
            .map_err(|e| ScraperError::Navigation(format!("start date input: {}", e)))?
            .type_str(range.start_keys())
            .await
            .map_err(|e| ScraperError::Navigation(format!("start date input: {}", e)))?;
        debug!("開始日入力: {}", range.start_keys());

        // 日付ピッカーが閉じるのを待つ
        sleep(Duration::from_secs(2)).await;

        self.wait_for_element(&page, END_DATE_SELECTOR, "end date input")
            .await?
            .click()
            .await
            .map_err(|e| ScraperError::Navigation(format!("end date input: {}", e)))?
            .type_str(range.end_keys())
            .await
            .map_err(|e| ScraperError::Navigation(format!("end date input: {}", e)))?;
        debug!("終了日入力: {}", range.end_keys());

        info!("日付範囲設定完了");
        Ok(())
    }

    async fn fetch_leads(&mut self) -> Result<(), ScraperError> {
        let page = self.get_page()?;
        info!("リードを取得中...");
        self.click_button_with_text(&page, FETCH_BUTTON_TEXT).await?;
        sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    async fn trigger_download(&mut self) -> Result<(), ScraperError> {
        let page = self.get_page()?;
        info!("CSVをダウンロード中...");
        self.click_button_with_text(&page, DOWNLOAD_BUTTON_TEXT)
            .await
            .map_err(Self::download_error)
    }

    async fn wait_for_files(
        &mut self,
        before: &HashSet<PathBuf>,
    ) -> Result<Vec<PathBuf>, ScraperError> {
        let dir = self.config.download_path.clone();
        let timeout = self.config.download_timeout;
        let settle = self.config.download_settle;
        let start = Instant::now();
        let mut last_count = None;
        let mut changed_at = Instant::now();

        loop {
            let new_files: Vec<PathBuf> = list_csv_files(&dir)?
                .into_iter()
                .filter(|path| !before.contains(path))
                .collect();
            let partial = has_partial_downloads(&dir)?;

            if last_count != Some(new_files.len()) {
                last_count = Some(new_files.len());
                changed_at = Instant::now();
            }
            let ready = new_files.len() >= self.config.min_files && !partial;

            // 新規CSVが settle の間増えず、途中ファイルも無ければ完了
            if ready && changed_at.elapsed() >= settle {
                info!("ダウンロード完了: CSVファイル {}件", new_files.len());
                for path in &new_files {
                    info!("CSVファイル検出: {:?}", path);
                }
                return Ok(new_files);
            }

            if start.elapsed() > timeout {
                if ready {
                    warn!(
                        "{}秒以内に新しいCSVが止まりませんでした。検出済み {}件で続行します",
                        timeout.as_secs(),
                        new_files.len()
                    );
                    return Ok(new_files);
                }
                return Err(ScraperError::Timeout(format!(
                    "{} of {} CSV file(s) arrived within {}s",
                    new_files.len(),
                    self.config.min_files,
                    timeout.as_secs()
                )));
            }

            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        info!("ブラウザを終了中...");

        self.page = None;
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("ブラウザ終了に失敗: {}", e);
            }
            if let Err(e) = browser.wait().await {
                debug!("ブラウザプロセスの終了待ちに失敗: {}", e);
            }
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }

        info!("ブラウザ終了完了");
        Ok(())
    }
}
