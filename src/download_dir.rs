//! ダウンロードディレクトリの走査

use std::io;
use std::path::{Path, PathBuf};

/// ブラウザがダウンロード中に使う一時ファイルの拡張子
const PARTIAL_EXTENSIONS: [&str; 2] = ["crdownload", "tmp"];

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_ascii_lowercase() == ext)
        .unwrap_or(false)
}

/// ディレクトリ直下のCSVファイル一覧（ファイル名順）
pub fn list_csv_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_extension(path, "csv"))
        .collect();
    files.sort();
    Ok(files)
}

/// ダウンロード途中のファイルが残っているか
pub fn has_partial_downloads(dir: &Path) -> io::Result<bool> {
    Ok(std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .any(|path| PARTIAL_EXTENSIONS.iter().any(|ext| has_extension(&path, ext))))
}
