// ⚙️ Settings - key/value preferences stored alongside the ledger

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::timestamp_column;
use crate::error::{LedgerError, Result};

/// Which date decides the period a transaction belongs to
pub const DATE_BASIS_KEY: &str = "transaction_date_basis";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateBasis {
    #[default]
    TransactionDate,

    /// Credit-card invoice date, falling back to the transaction date
    InvoiceDate,
}

impl DateBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateBasis::TransactionDate => "transaction_date",
            DateBasis::InvoiceDate => "invoice_date",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "transaction_date" => Some(DateBasis::TransactionDate),
            "invoice_date" => Some(DateBasis::InvoiceDate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn map_setting_row(row: &Row) -> rusqlite::Result<Setting> {
    Ok(Setting {
        key: row.get(0)?,
        value: row.get(1)?,
        created_at: timestamp_column(row, 2)?,
        updated_at: timestamp_column(row, 3)?,
    })
}

fn normalize_key(key: &str) -> Result<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(LedgerError::validation("Setting key is required"));
    }
    Ok(key)
}

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<Setting>> {
    let setting = conn
        .query_row(
            "SELECT key, value, created_at, updated_at FROM settings WHERE key = ?1",
            [key.trim()],
            map_setting_row,
        )
        .optional()?;
    Ok(setting)
}

/// Insert or overwrite a setting
pub fn put_setting(conn: &Connection, key: &str, value: &str) -> Result<Setting> {
    let key = normalize_key(key)?;
    if key == DATE_BASIS_KEY && DateBasis::parse(value).is_none() {
        return Err(LedgerError::validation(format!(
            "Invalid value '{}' for {} (expected transaction_date or invoice_date)",
            value, DATE_BASIS_KEY
        )));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO settings (key, value, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;

    get_setting(conn, key)?.ok_or_else(|| LedgerError::not_found("Setting", key))
}

pub fn list_settings(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
    let settings = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    Ok(settings)
}

pub fn delete_setting(conn: &Connection, key: &str) -> Result<()> {
    let key = normalize_key(key)?;
    let deleted = conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
    if deleted == 0 {
        return Err(LedgerError::not_found("Setting", key));
    }
    Ok(())
}

/// Current date basis; unknown stored values fall back to the default
pub fn date_basis(conn: &Connection) -> Result<DateBasis> {
    Ok(get_setting(conn, DATE_BASIS_KEY)?
        .and_then(|s| DateBasis::parse(&s.value))
        .unwrap_or_default())
}
