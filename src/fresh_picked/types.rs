//! FreshPickedLeads 関連の型定義

use chrono::{Datelike, NaiveDate};

/// リード検索の日付範囲（両端を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if start > end {
            return Err(format!("start {} is after end {}", start, end));
        }
        Ok(Self { start, end })
    }

    /// 昨日〜今日（既定の検索範囲）
    pub fn yesterday_to(today: NaiveDate) -> Self {
        Self {
            start: today.pred_opt().unwrap_or(today),
            end: today,
        }
    }

    /// 開始日入力欄に打つキー列。マスク入力なので `MMDD` だけ入れる
    pub fn start_keys(&self) -> String {
        self.start.format("%m%d").to_string()
    }

    /// 終了日入力欄に打つキー列
    ///
    /// 終了日の欄は開始日の年月を引き継ぐため、同じ月なら日だけを入力する。
    pub fn end_keys(&self) -> String {
        if self.start.year() == self.end.year() && self.start.month() == self.end.month() {
            self.end.format("%d").to_string()
        } else {
            self.end.format("%m%d").to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_yesterday_to_today() {
        let range = DateRange::yesterday_to(d(2024, 8, 6));
        assert_eq!(range.start, d(2024, 8, 5));
        assert_eq!(range.end, d(2024, 8, 6));
        assert_eq!(range.start_keys(), "0805");
        assert_eq!(range.end_keys(), "06");
    }

    #[test]
    fn test_month_boundary_keys() {
        let range = DateRange::yesterday_to(d(2024, 3, 1));
        assert_eq!(range.start, d(2024, 2, 29));
        assert_eq!(range.start_keys(), "0229");
        assert_eq!(range.end_keys(), "0301");
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert!(DateRange::new(d(2024, 1, 2), d(2024, 1, 1)).is_err());
        assert!(DateRange::new(d(2024, 1, 1), d(2024, 1, 1)).is_ok());
    }
}
