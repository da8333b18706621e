// 📏 Rule Entity - stored "when X then Y" instructions for transactions
//
// A rule has one criterion (what to look for) and one action (what to change).
// Rules run highest priority first; priorities are unique.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::{id_list_column, timestamp_column};
use crate::entities::tag::existing_tag_ids;
use crate::error::{LedgerError, Result};

const MAX_NAME_LEN: usize = 100;

// ============================================================================
// ACTION & CRITERION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// action_value is the category name
    SetCategory,

    /// action_value is a JSON array of tag ids
    AddTags,

    /// action_value is a percentage (0-100) of the original amount
    SetAmount,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::SetCategory => "set_category",
            RuleAction::AddTags => "add_tags",
            RuleAction::SetAmount => "set_amount",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "set_category" => Ok(RuleAction::SetCategory),
            "add_tags" => Ok(RuleAction::AddTags),
            "set_amount" => Ok(RuleAction::SetAmount),
            other => Err(LedgerError::validation(format!("Unknown rule action '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    DescriptionEquals,
    DescriptionContains,

    /// Matches the current category; never matches uncategorized transactions
    Category,
}

impl CriterionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriterionKind::DescriptionEquals => "description_equals",
            CriterionKind::DescriptionContains => "description_contains",
            CriterionKind::Category => "category",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "description_equals" => Ok(CriterionKind::DescriptionEquals),
            "description_contains" => Ok(CriterionKind::DescriptionContains),
            "category" => Ok(CriterionKind::Category),
            other => Err(LedgerError::validation(format!("Unknown rule criterion '{}'", other))),
        }
    }
}

// ============================================================================
// RULE ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub action: RuleAction,
    pub criterion: CriterionKind,
    pub criterion_value: String,
    pub action_value: String,

    /// Higher runs first
    pub priority: i64,
    pub active: bool,

    /// Tags added by an `add_tags` rule
    #[serde(default)]
    pub tag_ids: Vec<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Percentage for `set_amount` rules
    pub fn percentage(&self) -> Option<f64> {
        match self.action {
            RuleAction::SetAmount => parse_percentage(&self.action_value).ok(),
            _ => None,
        }
    }
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub action: RuleAction,
    pub criterion: CriterionKind,
    pub criterion_value: String,
    #[serde(default)]
    pub action_value: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,

    /// Defaults to the current highest priority + 1
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl NewRule {
    pub fn new(name: &str, criterion: CriterionKind, criterion_value: &str, action: RuleAction) -> Self {
        NewRule {
            name: name.to_string(),
            action,
            criterion,
            criterion_value: criterion_value.to_string(),
            action_value: None,
            tag_ids: Vec::new(),
            priority: None,
            active: true,
        }
    }

    pub fn with_action_value(mut self, value: &str) -> Self {
        self.action_value = Some(value.to_string());
        self
    }

    pub fn with_tags(mut self, tag_ids: Vec<i64>) -> Self {
        self.tag_ids = tag_ids;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub action: Option<RuleAction>,
    #[serde(default)]
    pub criterion: Option<CriterionKind>,
    #[serde(default)]
    pub criterion_value: Option<String>,
    #[serde(default)]
    pub action_value: Option<String>,
    #[serde(default)]
    pub tag_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub active: Option<bool>,
}

// ============================================================================
// VALIDATION
// ============================================================================

pub fn parse_percentage(value: &str) -> Result<f64> {
    let pct: f64 = value
        .trim()
        .parse()
        .map_err(|_| LedgerError::validation(format!("Percentage '{}' is not a number", value)))?;

    if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
        return Err(LedgerError::validation("Percentage must be between 0 and 100"));
    }
    Ok(pct)
}

/// Tag ids from an explicit list, or from a JSON array in action_value
fn requested_tag_ids(tag_ids: &[i64], action_value: Option<&str>) -> Result<Vec<i64>> {
    if !tag_ids.is_empty() {
        return Ok(tag_ids.to_vec());
    }
    match action_value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => serde_json::from_str::<Vec<i64>>(raw).map_err(|_| {
            LedgerError::validation("add_tags rules need a JSON array of tag ids")
        }),
        None => Ok(Vec::new()),
    }
}

/// A rule definition checked against the database, ready to store
struct ValidRule {
    name: String,
    criterion_value: String,
    action_value: String,
    tag_ids: Vec<i64>,
}

fn validate_definition(
    conn: &Connection,
    name: &str,
    action: RuleAction,
    criterion_value: &str,
    action_value: Option<&str>,
    tag_ids: &[i64],
) -> Result<ValidRule> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LedgerError::validation("Rule name is required"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(LedgerError::validation(format!(
            "Rule name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }

    let criterion_value = criterion_value.trim();
    if criterion_value.is_empty() {
        return Err(LedgerError::validation("Criterion value is required"));
    }

    let (action_value, tag_ids) = match action {
        RuleAction::SetCategory => {
            let category = action_value.map(str::trim).unwrap_or_default();
            if category.is_empty() {
                return Err(LedgerError::validation("set_category rules need a category"));
            }
            (category.to_string(), Vec::new())
        }
        RuleAction::SetAmount => {
            let raw = action_value.unwrap_or_default();
            parse_percentage(raw)?;
            (raw.trim().to_string(), Vec::new())
        }
        RuleAction::AddTags => {
            let requested = requested_tag_ids(tag_ids, action_value)?;
            if requested.is_empty() {
                return Err(LedgerError::validation("add_tags rules need at least one tag"));
            }
            let existing = existing_tag_ids(conn, &requested)?;
            if let Some(missing) = requested.iter().find(|id| !existing.contains(id)) {
                return Err(LedgerError::not_found("Tag", missing));
            }
            (serde_json::to_string(&existing)?, existing)
        }
    };

    Ok(ValidRule {
        name: name.to_string(),
        criterion_value: criterion_value.to_string(),
        action_value,
        tag_ids,
    })
}

fn ensure_name_available(conn: &Connection, name: &str, except_id: Option<i64>) -> Result<()> {
    if let Some(existing) = find_rule_by_name(conn, name)? {
        if Some(existing.id) != except_id {
            return Err(LedgerError::validation(format!(
                "A rule named '{}' already exists",
                existing.name
            )));
        }
    }
    Ok(())
}

fn ensure_priority_available(conn: &Connection, priority: i64, except_id: Option<i64>) -> Result<()> {
    if priority < 1 {
        return Err(LedgerError::validation("Priority must be at least 1"));
    }
    let holder: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, name FROM rules WHERE priority = ?1",
            [priority],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match holder {
        Some((id, name)) if Some(id) != except_id => Err(LedgerError::validation(format!(
            "Priority {} is already used by rule '{}'",
            priority, name
        ))),
        _ => Ok(()),
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

const RULE_COLUMNS: &str = "r.id, r.name, r.action, r.criterion, r.criterion_value,
    r.action_value, r.priority, r.active, r.created_at, r.updated_at,
    (SELECT GROUP_CONCAT(rt.tag_id) FROM rule_tags rt WHERE rt.rule_id = r.id)";

fn map_rule_row(row: &Row) -> rusqlite::Result<Rule> {
    let action: String = row.get(2)?;
    let criterion: String = row.get(3)?;

    Ok(Rule {
        id: row.get(0)?,
        name: row.get(1)?,
        action: RuleAction::parse(&action).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        criterion: CriterionKind::parse(&criterion).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        criterion_value: row.get(4)?,
        action_value: row.get(5)?,
        priority: row.get(6)?,
        active: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
        tag_ids: id_list_column(row, 10)?,
    })
}

fn sync_rule_tags(conn: &Connection, rule_id: i64, tag_ids: &[i64]) -> Result<()> {
    conn.execute("DELETE FROM rule_tags WHERE rule_id = ?1", [rule_id])?;
    for tag_id in tag_ids {
        conn.execute(
            "INSERT OR IGNORE INTO rule_tags (rule_id, tag_id) VALUES (?1, ?2)",
            params![rule_id, tag_id],
        )?;
    }
    Ok(())
}

/// Highest priority in use + 1
pub fn next_priority(conn: &Connection) -> Result<i64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(priority) FROM rules", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0) + 1)
}

pub fn insert_rule(conn: &Connection, new: &NewRule) -> Result<Rule> {
    let valid = validate_definition(
        conn,
        &new.name,
        new.action,
        &new.criterion_value,
        new.action_value.as_deref(),
        &new.tag_ids,
    )?;
    ensure_name_available(conn, &valid.name, None)?;

    let priority = match new.priority {
        Some(priority) => {
            ensure_priority_available(conn, priority, None)?;
            priority
        }
        None => next_priority(conn)?,
    };

    let tx = conn.unchecked_transaction()?;
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO rules (
            name, action, criterion, criterion_value, action_value,
            priority, active, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            valid.name,
            new.action.as_str(),
            new.criterion.as_str(),
            valid.criterion_value,
            valid.action_value,
            priority,
            new.active,
            now,
        ],
    )?;
    let id = tx.last_insert_rowid();
    sync_rule_tags(&tx, id, &valid.tag_ids)?;
    tx.commit()?;

    get_rule(conn, id)
}

pub fn get_rule(conn: &Connection, id: i64) -> Result<Rule> {
    let sql = format!("SELECT {} FROM rules r WHERE r.id = ?1", RULE_COLUMNS);
    conn.query_row(&sql, [id], map_rule_row)
        .optional()?
        .ok_or_else(|| LedgerError::not_found("Rule", id))
}

pub fn find_rule_by_name(conn: &Connection, name: &str) -> Result<Option<Rule>> {
    let sql = format!("SELECT {} FROM rules r WHERE LOWER(r.name) = LOWER(?1)", RULE_COLUMNS);
    let rule = conn.query_row(&sql, [name.trim()], map_rule_row).optional()?;
    Ok(rule)
}

/// Rules by priority, highest first
pub fn list_rules(conn: &Connection, active_only: bool) -> Result<Vec<Rule>> {
    let filter = if active_only { "WHERE r.active = 1" } else { "" };
    let sql = format!(
        "SELECT {} FROM rules r {} ORDER BY r.priority DESC",
        RULE_COLUMNS, filter
    );

    let mut stmt = conn.prepare(&sql)?;
    let rules = stmt
        .query_map([], map_rule_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rules)
}

pub fn update_rule(conn: &Connection, id: i64, patch: &RulePatch) -> Result<Rule> {
    let current = get_rule(conn, id)?;

    let name = patch.name.as_deref().unwrap_or(&current.name);
    let action = patch.action.unwrap_or(current.action);
    let criterion = patch.criterion.unwrap_or(current.criterion);
    let criterion_value = patch
        .criterion_value
        .as_deref()
        .unwrap_or(&current.criterion_value);

    // Switching action without a new value must not reuse the old action's value
    let action_value = match (&patch.action_value, patch.action) {
        (Some(value), _) => Some(value.as_str()),
        (None, Some(new_action)) if new_action != current.action => None,
        (None, _) => Some(current.action_value.as_str()),
    };
    let tag_ids = match (&patch.tag_ids, &patch.action_value) {
        (Some(ids), _) => ids.clone(),
        (None, Some(_)) => Vec::new(),
        (None, None) if action == current.action => current.tag_ids.clone(),
        (None, None) => Vec::new(),
    };

    let valid = validate_definition(conn, name, action, criterion_value, action_value, &tag_ids)?;
    ensure_name_available(conn, &valid.name, Some(id))?;

    let priority = patch.priority.unwrap_or(current.priority);
    if priority != current.priority {
        ensure_priority_available(conn, priority, Some(id))?;
    }
    let active = patch.active.unwrap_or(current.active);

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE rules
         SET name = ?1, action = ?2, criterion = ?3, criterion_value = ?4,
             action_value = ?5, priority = ?6, active = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            valid.name,
            action.as_str(),
            criterion.as_str(),
            valid.criterion_value,
            valid.action_value,
            priority,
            active,
            Utc::now().to_rfc3339(),
            id,
        ],
    )?;
    sync_rule_tags(&tx, id, &valid.tag_ids)?;
    tx.commit()?;

    get_rule(conn, id)
}

/// Flip the active flag
pub fn toggle_rule(conn: &Connection, id: i64) -> Result<Rule> {
    let changed = conn.execute(
        "UPDATE rules SET active = NOT active, updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(LedgerError::not_found("Rule", id));
    }
    get_rule(conn, id)
}

pub fn delete_rule(conn: &Connection, id: i64) -> Result<()> {
    let deleted = conn.execute("DELETE FROM rules WHERE id = ?1", [id])?;
    if deleted == 0 {
        return Err(LedgerError::not_found("Rule", id));
    }
    Ok(())
}

/// Reassign priorities from an ordered id list: the first id gets the
/// highest priority (n), the last gets 1. The list must name every rule once.
pub fn reorder_rules(conn: &Connection, ordered_ids: &[i64]) -> Result<Vec<Rule>> {
    let mut all_ids: Vec<i64> = list_rules(conn, false)?.iter().map(|r| r.id).collect();
    let mut requested = ordered_ids.to_vec();
    all_ids.sort_unstable();
    requested.sort_unstable();

    if let Some(missing) = requested.iter().find(|id| all_ids.binary_search(id).is_err()) {
        return Err(LedgerError::not_found("Rule", missing));
    }
    if requested.windows(2).any(|w| w[0] == w[1]) {
        return Err(LedgerError::validation("Rule ids must not repeat"));
    }
    if requested.len() != all_ids.len() {
        return Err(LedgerError::validation("Reorder must list every rule exactly once"));
    }

    let tx = conn.unchecked_transaction()?;
    // Park on negative priorities first so the UNIQUE constraint holds mid-way
    tx.execute("UPDATE rules SET priority = -id", [])?;
    let total = ordered_ids.len() as i64;
    let now = Utc::now().to_rfc3339();
    for (idx, id) in ordered_ids.iter().enumerate() {
        tx.execute(
            "UPDATE rules SET priority = ?1, updated_at = ?2 WHERE id = ?3",
            params![total - idx as i64, now, id],
        )?;
    }
    tx.commit()?;

    list_rules(conn, false)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;
    use crate::entities::tag::{insert_tag, NewTag};

    fn test_conn() -> Connection {
        open_database(":memory:").unwrap()
    }

    fn category_rule(name: &str, needle: &str, category: &str) -> NewRule {
        NewRule::new(name, CriterionKind::DescriptionContains, needle, RuleAction::SetCategory)
            .with_action_value(category)
    }

    #[test]
    fn test_priorities_default_to_next() {
        let conn = test_conn();
        let a = insert_rule(&conn, &category_rule("Uber", "uber", "Transport")).unwrap();
        let b = insert_rule(&conn, &category_rule("iFood", "ifood", "Food")).unwrap();
        assert_eq!(a.priority, 1);
        assert_eq!(b.priority, 2);
        assert_eq!(next_priority(&conn).unwrap(), 3);

        let listed: Vec<_> = list_rules(&conn, false).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![b.id, a.id]);
    }

    #[test]
    fn test_duplicate_name_and_priority_rejected() {
        let conn = test_conn();
        insert_rule(&conn, &category_rule("Uber", "uber", "Transport").with_priority(5)).unwrap();

        let same_name = insert_rule(&conn, &category_rule("UBER", "99", "Transport"));
        assert!(matches!(same_name, Err(LedgerError::Validation(_))));

        let same_priority = insert_rule(&conn, &category_rule("Taxi", "taxi", "Transport").with_priority(5));
        assert!(matches!(same_priority, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_action_value_validation() {
        let conn = test_conn();

        let no_category = NewRule::new("x", CriterionKind::Category, "Food", RuleAction::SetCategory);
        assert!(insert_rule(&conn, &no_category).is_err());

        let bad_pct = NewRule::new("half", CriterionKind::Category, "Food", RuleAction::SetAmount)
            .with_action_value("150");
        assert!(insert_rule(&conn, &bad_pct).is_err());

        let not_number = NewRule::new("half", CriterionKind::Category, "Food", RuleAction::SetAmount)
            .with_action_value("half");
        assert!(insert_rule(&conn, &not_number).is_err());

        let ok = NewRule::new("half", CriterionKind::Category, "Food", RuleAction::SetAmount)
            .with_action_value("50");
        assert_eq!(insert_rule(&conn, &ok).unwrap().percentage(), Some(50.0));
    }

    #[test]
    fn test_add_tags_requires_existing_tags() {
        let conn = test_conn();
        let tag = insert_tag(&conn, &NewTag::new("Travel")).unwrap();

        let empty = NewRule::new("t", CriterionKind::DescriptionContains, "hotel", RuleAction::AddTags);
        assert!(insert_rule(&conn, &empty).is_err());

        let missing = empty.clone().with_tags(vec![tag.id, 999]);
        assert!(matches!(insert_rule(&conn, &missing), Err(LedgerError::NotFound { .. })));

        let rule = insert_rule(&conn, &empty.clone().with_tags(vec![tag.id])).unwrap();
        assert_eq!(rule.tag_ids, vec![tag.id]);
        assert_eq!(rule.action_value, format!("[{}]", tag.id));

        // JSON array in action_value works too
        let from_json = NewRule::new("t2", CriterionKind::DescriptionContains, "airbnb", RuleAction::AddTags)
            .with_action_value(&format!("[{}]", tag.id));
        assert_eq!(insert_rule(&conn, &from_json).unwrap().tag_ids, vec![tag.id]);
    }

    #[test]
    fn test_update_and_toggle() {
        let conn = test_conn();
        let rule = insert_rule(&conn, &category_rule("Uber", "uber", "Transport")).unwrap();

        let patch = RulePatch {
            action: Some(RuleAction::SetAmount),
            action_value: Some("30".to_string()),
            ..Default::default()
        };
        let updated = update_rule(&conn, rule.id, &patch).unwrap();
        assert_eq!(updated.action, RuleAction::SetAmount);
        assert_eq!(updated.action_value, "30");

        // Switching action without a value is rejected
        let switch = RulePatch {
            action: Some(RuleAction::SetCategory),
            ..Default::default()
        };
        assert!(update_rule(&conn, rule.id, &switch).is_err());

        let toggled = toggle_rule(&conn, rule.id).unwrap();
        assert!(!toggled.active);
        assert!(list_rules(&conn, true).unwrap().is_empty());
        assert!(toggle_rule(&conn, rule.id).unwrap().active);
    }

    #[test]
    fn test_reorder_rules() {
        let conn = test_conn();
        let a = insert_rule(&conn, &category_rule("a", "a", "A")).unwrap();
        let b = insert_rule(&conn, &category_rule("b", "b", "B")).unwrap();
        let c = insert_rule(&conn, &category_rule("c", "c", "C")).unwrap();

        let reordered = reorder_rules(&conn, &[a.id, c.id, b.id]).unwrap();
        let order: Vec<_> = reordered.iter().map(|r| (r.id, r.priority)).collect();
        assert_eq!(order, vec![(a.id, 3), (c.id, 2), (b.id, 1)]);

        assert!(reorder_rules(&conn, &[a.id, b.id]).is_err());
        assert!(reorder_rules(&conn, &[a.id, a.id, b.id]).is_err());
        assert!(matches!(
            reorder_rules(&conn, &[a.id, b.id, 999]),
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_rule() {
        let conn = test_conn();
        let rule = insert_rule(&conn, &category_rule("a", "a", "A")).unwrap();
        delete_rule(&conn, rule.id).unwrap();
        assert!(matches!(get_rule(&conn, rule.id), Err(LedgerError::NotFound { .. })));
        assert!(delete_rule(&conn, rule.id).is_err());
    }
}
