// 🗄️ Persistence - SQLite schema, audit trail and transaction storage

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entities::setting::DateBasis;
use crate::entities::transaction::{
    NewTransaction, Transaction, TransactionFilter, TransactionKind, TransactionPatch,
};
use crate::error::{LedgerError, Result};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// CONNECTION & SCHEMA
// ============================================================================

/// Open (or create) the database and make sure the schema exists.
/// `:memory:` opens a private in-memory database.
pub fn open_database(path: &str) -> Result<Connection> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        let conn = Connection::open(path)?;
        // WAL for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn
    };

    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL CHECK (amount >= 0),
            original_amount REAL,
            kind TEXT NOT NULL CHECK (kind IN ('income', 'expense')),
            category TEXT,
            source TEXT NOT NULL DEFAULT 'manual',
            notes TEXT,
            invoice_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            color TEXT,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transaction_tags (
            transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            PRIMARY KEY (transaction_id, tag_id)
        );

        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            action TEXT NOT NULL,
            criterion TEXT NOT NULL,
            criterion_value TEXT NOT NULL,
            action_value TEXT NOT NULL,
            priority INTEGER NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rule_tags (
            rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY (rule_id, tag_id)
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Audit trail: every import, edit and rule application
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date);
        CREATE INDEX IF NOT EXISTS idx_transactions_invoice_date ON transactions(invoice_date);
        CREATE INDEX IF NOT EXISTS idx_transactions_category ON transactions(category);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tags_name_lower ON tags(LOWER(name));
        CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_name_lower ON rules(LOWER(name));
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn date_column(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn optional_date_column(row: &Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

/// Parse a GROUP_CONCAT list of ids ("3,1,2") into a sorted vector
pub(crate) fn id_list_column(row: &Row, idx: usize) -> rusqlite::Result<Vec<i64>> {
    let raw: Option<String> = row.get(idx)?;
    let mut ids = Vec::new();
    if let Some(list) = raw {
        for part in list.split(',').filter(|p| !p.is_empty()) {
            ids.push(part.trim().parse::<i64>().map_err(|e| conversion_error(idx, e))?);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

// ============================================================================
// EVENTS (audit trail)
// ============================================================================

/// Event for audit trail: every change is recorded
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn map_event_row(row: &Row) -> rusqlite::Result<Event> {
    let data_json: String = row.get(5)?;

    Ok(Event {
        event_id: row.get(0)?,
        timestamp: timestamp_column(row, 1)?,
        event_type: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
        actor: row.get(6)?,
    })
}

/// Events for one entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], map_event_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}

/// Most recent events of one type across all entities
pub fn find_events_by_type(conn: &Connection, event_type: &str, limit: usize) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE event_type = ?1
         ORDER BY timestamp DESC, id DESC
         LIMIT ?2",
    )?;

    let events = stmt
        .query_map(params![event_type, limit as i64], map_event_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

const TRANSACTION_COLUMNS: &str = "t.id, t.date, t.description, t.amount, t.original_amount,
    t.kind, t.category, t.source, t.notes, t.invoice_date, t.created_at, t.updated_at,
    (SELECT GROUP_CONCAT(tt.tag_id) FROM transaction_tags tt WHERE tt.transaction_id = t.id)";

fn map_transaction_row(row: &Row) -> rusqlite::Result<Transaction> {
    let kind_raw: String = row.get(5)?;
    let kind = match kind_raw.as_str() {
        "income" => TransactionKind::Income,
        "expense" => TransactionKind::Expense,
        other => {
            return Err(conversion_error(
                5,
                LedgerError::validation(format!("unknown kind '{}'", other)),
            ))
        }
    };

    Ok(Transaction {
        id: row.get(0)?,
        date: date_column(row, 1)?,
        description: row.get(2)?,
        amount: row.get(3)?,
        original_amount: row.get(4)?,
        kind,
        category: row.get(6)?,
        source: row.get(7)?,
        notes: row.get(8)?,
        invoice_date: optional_date_column(row, 9)?,
        created_at: timestamp_column(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
        tag_ids: id_list_column(row, 12)?,
    })
}

/// Insert a validated transaction; `original_amount` starts equal to `amount`
pub fn insert_transaction(conn: &Connection, new: &NewTransaction, actor: &str) -> Result<Transaction> {
    new.validate()?;

    let now = Utc::now().to_rfc3339();
    let category = new
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    conn.execute(
        "INSERT INTO transactions (
            date, description, amount, original_amount, kind, category,
            source, notes, invoice_date, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            format_date(new.date),
            new.description.trim(),
            new.amount,
            new.kind.as_str(),
            category,
            new.source,
            new.notes,
            new.invoice_date.map(format_date),
            now,
        ],
    )?;

    let id = conn.last_insert_rowid();

    let event = Event::new(
        "transaction_created",
        "transaction",
        &id.to_string(),
        serde_json::json!({
            "amount": new.amount,
            "kind": new.kind.as_str(),
            "source": new.source,
        }),
        actor,
    );
    insert_event(conn, &event)?;

    get_transaction(conn, id)
}

pub fn find_transaction(conn: &Connection, id: i64) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {} FROM transactions t WHERE t.id = ?1", TRANSACTION_COLUMNS);
    let tx = conn.query_row(&sql, [id], map_transaction_row).optional()?;
    Ok(tx)
}

pub fn get_transaction(conn: &Connection, id: i64) -> Result<Transaction> {
    find_transaction(conn, id)?.ok_or_else(|| LedgerError::not_found("Transaction", id))
}

/// List transactions matching the filter, newest first
pub fn list_transactions(
    conn: &Connection,
    filter: &TransactionFilter,
    basis: DateBasis,
) -> Result<Vec<Transaction>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some((start, end)) = filter.date_range()? {
        let start = format_date(start);
        let end = format_date(end);
        match basis {
            DateBasis::TransactionDate => {
                clauses.push("t.date BETWEEN ? AND ?".to_string());
                values.push(Value::Text(start));
                values.push(Value::Text(end));
            }
            DateBasis::InvoiceDate => {
                clauses.push(
                    "((t.invoice_date IS NOT NULL AND t.invoice_date BETWEEN ? AND ?)
                      OR (t.invoice_date IS NULL AND t.date BETWEEN ? AND ?))"
                        .to_string(),
                );
                for _ in 0..2 {
                    values.push(Value::Text(start.clone()));
                    values.push(Value::Text(end.clone()));
                }
            }
        }
    }

    if let Some(category) = &filter.category {
        clauses.push("t.category = ?".to_string());
        values.push(Value::Text(category.clone()));
    }

    if let Some(kind) = filter.kind {
        clauses.push("t.kind = ?".to_string());
        values.push(Value::Text(kind.as_str().to_string()));
    }

    if !filter.tag_ids.is_empty() {
        let placeholders = vec!["?"; filter.tag_ids.len()].join(", ");
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM transaction_tags ft
                     WHERE ft.transaction_id = t.id AND ft.tag_id IN ({}))",
            placeholders
        ));
        values.extend(filter.tag_ids.iter().map(|id| Value::Integer(*id)));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT {} FROM transactions t {} ORDER BY t.date DESC, t.id DESC",
        TRANSACTION_COLUMNS, where_sql
    );
    debug!(filters = clauses.len(), "listing transactions");

    let mut stmt = conn.prepare(&sql)?;
    let transactions = stmt
        .query_map(params_from_iter(values), map_transaction_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(transactions)
}

/// Persist every editable value of a transaction, including its tag set.
/// Tag ids that do not exist are dropped.
pub fn update_transaction(conn: &Connection, tx: &Transaction) -> Result<Transaction> {
    let changed = conn.execute(
        "UPDATE transactions
         SET date = ?1, description = ?2, amount = ?3, original_amount = ?4, kind = ?5,
             category = ?6, source = ?7, notes = ?8, invoice_date = ?9, updated_at = ?10
         WHERE id = ?11",
        params![
            format_date(tx.date),
            tx.description,
            tx.amount,
            tx.original_amount,
            tx.kind.as_str(),
            tx.category,
            tx.source,
            tx.notes,
            tx.invoice_date.map(format_date),
            tx.updated_at.to_rfc3339(),
            tx.id,
        ],
    )?;

    if changed == 0 {
        return Err(LedgerError::not_found("Transaction", tx.id));
    }

    conn.execute("DELETE FROM transaction_tags WHERE transaction_id = ?1", [tx.id])?;
    let now = Utc::now().to_rfc3339();
    for tag_id in &tx.tag_ids {
        conn.execute(
            "INSERT OR IGNORE INTO transaction_tags (transaction_id, tag_id, created_at)
             SELECT ?1, id, ?3 FROM tags WHERE id = ?2",
            params![tx.id, tag_id, now],
        )?;
    }

    get_transaction(conn, tx.id)
}

/// Partial update from user input
pub fn patch_transaction(
    conn: &Connection,
    id: i64,
    patch: &TransactionPatch,
    actor: &str,
) -> Result<Transaction> {
    let mut tx = get_transaction(conn, id)?;
    tx.apply_patch(patch)?;
    let updated = update_transaction(conn, &tx)?;

    let event = Event::new(
        "transaction_updated",
        "transaction",
        &id.to_string(),
        serde_json::to_value(patch)?,
        actor,
    );
    insert_event(conn, &event)?;

    Ok(updated)
}

pub fn delete_transaction(conn: &Connection, id: i64, actor: &str) -> Result<()> {
    let deleted = conn.execute("DELETE FROM transactions WHERE id = ?1", [id])?;
    if deleted == 0 {
        return Err(LedgerError::not_found("Transaction", id));
    }

    let event = Event::new(
        "transaction_deleted",
        "transaction",
        &id.to_string(),
        serde_json::json!({}),
        actor,
    );
    insert_event(conn, &event)?;

    Ok(())
}

/// Undo every amount change made by edits or rules
pub fn restore_original_amount(conn: &Connection, id: i64, actor: &str) -> Result<Transaction> {
    let mut tx = get_transaction(conn, id)?;
    let original = tx
        .original_amount
        .ok_or_else(|| LedgerError::validation("Transaction has no original amount recorded"))?;

    let previous = tx.amount;
    tx.amount = original;
    tx.touch();
    let restored = update_transaction(conn, &tx)?;

    let event = Event::new(
        "amount_restored",
        "transaction",
        &id.to_string(),
        serde_json::json!({ "from": previous, "to": original }),
        actor,
    );
    insert_event(conn, &event)?;

    Ok(restored)
}

/// Distinct non-empty categories, alphabetical
pub fn list_categories(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT category FROM transactions
         WHERE category IS NOT NULL AND category <> ''
         ORDER BY category",
    )?;

    let categories = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(categories)
}

pub fn count_transactions(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================
