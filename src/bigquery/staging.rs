//! 既存テーブルへの追記SQL
//!
//! CSVは自動検出スキーマでステージングテーブルに入れ、対象テーブルの列型へ
//! `SAFE_CAST` して INSERT する。変換できない値は NULL になる。

use crate::loader::INGESTION_COLUMN;

use super::types::{FieldSchema, TableRef};

const STAGING_ALIAS: &str = "stg";

/// BigQuery の列型 → CAST 先の型名
fn cast_target(field_type: &str) -> &'static str {
    match field_type.to_ascii_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => "BOOL",
        "INT64" | "INTEGER" => "INT64",
        "FLOAT64" | "FLOAT" => "FLOAT64",
        "NUMERIC" => "NUMERIC",
        "BIGNUMERIC" => "BIGNUMERIC",
        "DATE" => "DATE",
        "DATETIME" => "DATETIME",
        "TIMESTAMP" => "TIMESTAMP",
        "TIME" => "TIME",
        "GEOGRAPHY" => "GEOGRAPHY",
        _ => "STRING",
    }
}

fn quote(name: &str) -> String {
    format!("`{}`", name.replace('`', ""))
}

fn find<'a>(fields: &'a [FieldSchema], name: &str) -> Option<&'a FieldSchema> {
    fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

fn select_expr(target: &FieldSchema, staging: Option<&FieldSchema>) -> String {
    let to = cast_target(&target.field_type);
    let alias = quote(&target.name);
    match staging {
        Some(source) if to == "STRING" => {
            format!("CAST({}.{} AS STRING) AS {}", STAGING_ALIAS, quote(&source.name), alias)
        }
        Some(source) => format!(
            "SAFE_CAST({}.{} AS {}) AS {}",
            STAGING_ALIAS,
            quote(&source.name),
            to,
            alias
        ),
        None => format!("CAST(NULL AS {}) AS {}", to, alias),
    }
}

/// ステージング → 対象テーブルの `INSERT ... SELECT`
///
/// 対象テーブルの列順に並べ、CSVに無い列は NULL。列名は大文字小文字を区別しない。
pub(crate) fn safe_cast_insert(
    target: &TableRef,
    staging: &TableRef,
    target_fields: &[FieldSchema],
    staging_fields: &[FieldSchema],
) -> String {
    let columns: Vec<String> = target_fields.iter().map(|f| quote(&f.name)).collect();
    let selects: Vec<String> = target_fields
        .iter()
        .map(|f| select_expr(f, find(staging_fields, &f.name)))
        .collect();

    format!(
        "INSERT INTO {} ({})\nSELECT\n  {}\nFROM {} AS {}",
        target.sql_name(),
        columns.join(", "),
        selects.join(",\n  "),
        staging.sql_name(),
        STAGING_ALIAS
    )
}

/// 対象テーブルに無いため捨てられるCSV列
pub(crate) fn dropped_columns(
    target_fields: &[FieldSchema],
    staging_fields: &[FieldSchema],
) -> Vec<String> {
    staging_fields
        .iter()
        .filter(|f| find(target_fields, &f.name).is_none())
        .map(|f| f.name.clone())
        .collect()
}

/// `Ingestion_date` 列が無ければ追加したスキーマを返す
pub(crate) fn with_ingestion_column(fields: &[FieldSchema]) -> Option<Vec<FieldSchema>> {
    if find(fields, INGESTION_COLUMN).is_some() {
        return None;
    }
    let mut extended = fields.to_vec();
    extended.push(FieldSchema {
        name: INGESTION_COLUMN.to_string(),
        field_type: "DATE".to_string(),
        mode: Some("NULLABLE".to_string()),
    });
    Some(extended)
}
