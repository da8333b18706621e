// 🏷️ Tag Entity - free-form labels attached to transactions
//
// Names are unique ignoring case ("Travel" and "travel" are the same tag).
// A tag can sit on many transactions and a transaction can carry many tags.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::{get_transaction, timestamp_column};
use crate::error::{LedgerError, Result};

/// Tag attached to every imported transaction
pub const ROUTINE_TAG: &str = "Routine";
pub const ROUTINE_TAG_COLOR: &str = "#4B5563";
pub const ROUTINE_TAG_DESCRIPTION: &str = "Added automatically to imported transactions";

// ============================================================================
// TAG ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,

    /// `#RRGGBB`
    pub color: Option<String>,
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTag {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewTag {
    pub fn new(name: &str) -> Self {
        NewTag {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if let Some(color) = &self.color {
            validate_color(color)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TagPatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(color) = &self.color {
            validate_color(color)?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::validation("Tag name is required"));
    }
    if trimmed.chars().count() > 50 {
        return Err(LedgerError::validation("Tag name must be at most 50 characters"));
    }
    Ok(())
}

/// Accepts `#RRGGBB` only
pub fn validate_color(color: &str) -> Result<()> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());

    if valid {
        Ok(())
    } else {
        Err(LedgerError::validation(format!(
            "Invalid color '{}' (expected #RRGGBB)",
            color
        )))
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

const TAG_COLUMNS: &str = "id, name, color, description, created_at, updated_at";

fn map_tag_row(row: &Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        description: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn ensure_name_available(conn: &Connection, name: &str, except_id: Option<i64>) -> Result<()> {
    if let Some(existing) = find_tag_by_name(conn, name)? {
        if Some(existing.id) != except_id {
            return Err(LedgerError::validation(format!(
                "Tag '{}' already exists",
                existing.name
            )));
        }
    }
    Ok(())
}

pub fn insert_tag(conn: &Connection, new: &NewTag) -> Result<Tag> {
    new.validate()?;
    let name = new.name.trim();
    ensure_name_available(conn, name, None)?;

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO tags (name, color, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![name, new.color, new.description, now],
    )?;

    get_tag(conn, conn.last_insert_rowid())
}

pub fn get_tag(conn: &Connection, id: i64) -> Result<Tag> {
    let sql = format!("SELECT {} FROM tags WHERE id = ?1", TAG_COLUMNS);
    conn.query_row(&sql, [id], map_tag_row)
        .optional()?
        .ok_or_else(|| LedgerError::not_found("Tag", id))
}

/// Case-insensitive lookup on the trimmed name
pub fn find_tag_by_name(conn: &Connection, name: &str) -> Result<Option<Tag>> {
    let sql = format!("SELECT {} FROM tags WHERE LOWER(name) = LOWER(?1)", TAG_COLUMNS);
    let tag = conn.query_row(&sql, [name.trim()], map_tag_row).optional()?;
    Ok(tag)
}

pub fn list_tags(conn: &Connection) -> Result<Vec<Tag>> {
    let sql = format!("SELECT {} FROM tags ORDER BY name COLLATE NOCASE", TAG_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let tags = stmt
        .query_map([], map_tag_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags)
}

/// Ids from `ids` that belong to existing tags, ascending
pub fn existing_tag_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM tags WHERE id = ?1")?;
    let mut found = Vec::new();
    for id in ids {
        if stmt.exists([id])? {
            found.push(*id);
        }
    }
    found.sort_unstable();
    found.dedup();
    Ok(found)
}

pub fn update_tag(conn: &Connection, id: i64, patch: &TagPatch) -> Result<Tag> {
    patch.validate()?;
    let mut tag = get_tag(conn, id)?;

    if let Some(name) = &patch.name {
        let name = name.trim();
        ensure_name_available(conn, name, Some(id))?;
        tag.name = name.to_string();
    }
    if let Some(color) = &patch.color {
        tag.color = Some(color.clone());
    }
    if let Some(description) = &patch.description {
        tag.description = Some(description.clone());
    }

    conn.execute(
        "UPDATE tags SET name = ?1, color = ?2, description = ?3, updated_at = ?4 WHERE id = ?5",
        params![tag.name, tag.color, tag.description, Utc::now().to_rfc3339(), id],
    )?;

    get_tag(conn, id)
}

/// Deleting a tag detaches it from transactions and rules
pub fn delete_tag(conn: &Connection, id: i64) -> Result<()> {
    let deleted = conn.execute("DELETE FROM tags WHERE id = ?1", [id])?;
    if deleted == 0 {
        return Err(LedgerError::not_found("Tag", id));
    }
    Ok(())
}

/// Find a tag by name or create it with the given presentation
pub fn ensure_tag(conn: &Connection, new: &NewTag) -> Result<Tag> {
    match find_tag_by_name(conn, &new.name)? {
        Some(tag) => Ok(tag),
        None => insert_tag(conn, new),
    }
}

pub fn ensure_routine_tag(conn: &Connection) -> Result<Tag> {
    ensure_tag(
        conn,
        &NewTag::new(ROUTINE_TAG)
            .with_color(ROUTINE_TAG_COLOR)
            .with_description(ROUTINE_TAG_DESCRIPTION),
    )
}

// ============================================================================
// TRANSACTION TAGS
// ============================================================================

/// Attach a tag; attaching twice is a no-op
pub fn add_transaction_tag(conn: &Connection, transaction_id: i64, tag_id: i64) -> Result<()> {
    get_transaction(conn, transaction_id)?;
    get_tag(conn, tag_id)?;

    conn.execute(
        "INSERT OR IGNORE INTO transaction_tags (transaction_id, tag_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![transaction_id, tag_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Detach a tag; detaching an absent tag is a no-op
pub fn remove_transaction_tag(conn: &Connection, transaction_id: i64, tag_id: i64) -> Result<()> {
    get_transaction(conn, transaction_id)?;

    conn.execute(
        "DELETE FROM transaction_tags WHERE transaction_id = ?1 AND tag_id = ?2",
        params![transaction_id, tag_id],
    )?;
    Ok(())
}

pub fn list_transaction_tags(conn: &Connection, transaction_id: i64) -> Result<Vec<Tag>> {
    get_transaction(conn, transaction_id)?;

    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.color, t.description, t.created_at, t.updated_at
         FROM tags t
         JOIN transaction_tags tt ON tt.tag_id = t.id
         WHERE tt.transaction_id = ?1
         ORDER BY t.name COLLATE NOCASE",
    )?;
    let tags = stmt
        .query_map([transaction_id], map_tag_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tags)
}

// ============================================================================
// TESTS
// ============================================================================
