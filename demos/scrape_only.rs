use leads_etl::config::{self, ENV_EMAIL, ENV_PASSWORD};
use leads_etl::{DateRange, FreshPickedScraper, LeadsBrowser, ScraperConfig};

#[tokio::main]
async fn main() {
    // ログ設定
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    config::load_dotenv();

    // 環境変数から認証情報を取得
    let email = std::env::var(ENV_EMAIL).expect("EMAIL environment variable not set");
    let password = std::env::var(ENV_PASSWORD).expect("PASSWORD environment variable not set");

    let config = ScraperConfig::new(email, password)
        .with_download_path("./downloads")
        .with_headless(false); // デバッグ用に表示モード

    let today = chrono::Local::now().date_naive();
    let range = DateRange::yesterday_to(today);
    let mut scraper = FreshPickedScraper::new(config);

    println!("=== FreshPickedLeads Scrape Test ({} - {}) ===", range.start, range.end);

    match scraper.execute(&range).await {
        Ok(files) => {
            println!("成功! {}件のCSV:", files.len());
            for f in files {
                println!("  {}", f.display());
            }
        }
        Err(e) => {
            eprintln!("エラー: {}", e);
        }
    }
}
