//! FreshPickedLeads スクレイパーモジュール
//!
//! ログインして日付範囲でリードを取得し、CSVをダウンロードする

mod scraper;
mod types;

pub use scraper::FreshPickedScraper;
pub use types::DateRange;
