//! 行映射辅助
//!
//! 状态等枚举按TEXT列存储，通过`as_str`/`parse`转换；
//! JSON列（payload、依赖列表、标签等）统一在这里解析。

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

use jobcenter_core::{JobCenterError, JobCenterResult};

pub struct MappingHelpers;

impl MappingHelpers {
    /// TEXT列解析为字符串枚举
    pub fn parse_enum<T>(row: &SqliteRow, column: &str) -> JobCenterResult<T>
    where
        T: FromStr<Err = String>,
    {
        let raw: String = row.try_get(column)?;
        raw.parse::<T>()
            .map_err(JobCenterError::DatabaseOperation)
    }

    pub fn parse_json(row: &SqliteRow, column: &str) -> JobCenterResult<serde_json::Value> {
        let raw: String = row.try_get(column)?;
        serde_json::from_str(&raw)
            .map_err(|e| JobCenterError::DatabaseOperation(format!("{column} 解析失败: {e}")))
    }

    pub fn parse_opt_json(
        row: &SqliteRow,
        column: &str,
    ) -> JobCenterResult<Option<serde_json::Value>> {
        let raw: Option<String> = row.try_get(column)?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| JobCenterError::DatabaseOperation(format!("{column} 解析失败: {e}"))),
            None => Ok(None),
        }
    }

    pub fn parse_typed<T: serde::de::DeserializeOwned>(
        row: &SqliteRow,
        column: &str,
    ) -> JobCenterResult<T> {
        let raw: String = row.try_get(column)?;
        serde_json::from_str(&raw)
            .map_err(|e| JobCenterError::DatabaseOperation(format!("{column} 解析失败: {e}")))
    }

    pub fn parse_opt_typed<T: serde::de::DeserializeOwned>(
        row: &SqliteRow,
        column: &str,
    ) -> JobCenterResult<Option<T>> {
        let raw: Option<String> = row.try_get(column)?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| JobCenterError::DatabaseOperation(format!("{column} 解析失败: {e}"))),
            None => Ok(None),
        }
    }

    pub fn to_json<T: serde::Serialize>(value: &T) -> JobCenterResult<String> {
        serde_json::to_string(value)
            .map_err(|e| JobCenterError::Serialization(e.to_string()))
    }
}
