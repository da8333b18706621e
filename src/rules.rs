// 🤖 Rule Engine - applies stored rules to transactions
//
// Rules are data (see `entities::rule`). The engine keeps the active ones
// sorted by priority and runs every matching rule once, highest first, so a
// later rule sees the changes of an earlier one (e.g. a category set by rule A
// can trigger a category-criterion rule B).

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{get_transaction, insert_event, list_transactions, update_transaction, Event};
use crate::entities::rule::{get_rule, list_rules, parse_percentage, CriterionKind, Rule, RuleAction};
use crate::entities::setting::date_basis;
use crate::entities::transaction::{Transaction, TransactionFilter};
use crate::error::Result;

// ============================================================================
// MATCHING & ACTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    /// Criterion did not match
    NotMatched,

    /// Criterion matched but the stored action value is unusable
    Invalid(String),

    /// Criterion matched and the action ran; `changed` is false when the
    /// transaction already had the values the rule sets
    Applied { changed: bool },
}

impl Rule {
    /// Case-insensitive criterion check
    pub fn matches(&self, tx: &Transaction) -> bool {
        let value = self.criterion_value.as_str();
        match self.criterion {
            CriterionKind::DescriptionEquals => tx.description_equals(value),
            CriterionKind::DescriptionContains => tx.description_contains(value),
            CriterionKind::Category => tx
                .category
                .as_deref()
                .filter(|c| !c.is_empty())
                .map_or(false, |c| c.to_lowercase() == value.to_lowercase()),
        }
    }

    /// Run this rule's action on the transaction when the criterion matches
    pub fn apply_to(&self, tx: &mut Transaction) -> RuleOutcome {
        if !self.matches(tx) {
            return RuleOutcome::NotMatched;
        }

        match self.action {
            RuleAction::SetCategory => {
                let category = self.action_value.trim();
                if category.is_empty() {
                    return RuleOutcome::Invalid("Rule has no category".to_string());
                }
                let changed = tx.category.as_deref() != Some(category);
                if changed {
                    tx.set_category(category);
                }
                RuleOutcome::Applied { changed }
            }
            RuleAction::AddTags => {
                let mut changed = false;
                for tag_id in &self.tag_ids {
                    changed |= tx.add_tag(*tag_id);
                }
                RuleOutcome::Applied { changed }
            }
            RuleAction::SetAmount => {
                let pct = match parse_percentage(&self.action_value) {
                    Ok(pct) => pct,
                    Err(e) => return RuleOutcome::Invalid(e.to_string()),
                };

                // Always a share of the first recorded amount, so re-running is stable
                let base = tx.original_amount.unwrap_or(tx.amount);
                let target = round_cents(base * pct / 100.0);
                let changed = (tx.amount - target).abs() > f64::EPSILON || tx.original_amount.is_none();
                if changed {
                    if tx.original_amount.is_none() {
                        tx.original_amount = Some(base);
                    }
                    if let Err(e) = tx.set_amount(target) {
                        return RuleOutcome::Invalid(e.to_string());
                    }
                }
                RuleOutcome::Applied { changed }
            }
        }
    }
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// RESULTS
// ============================================================================

/// Result of running the engine over one transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineRun {
    pub applied_rule_ids: Vec<i64>,
    pub changed: bool,
}

/// Result of applying a single rule on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleApplication {
    pub success: bool,
    pub modified_transactions: usize,
    pub message: String,
}

impl RuleApplication {
    fn rejected(message: String) -> Self {
        RuleApplication {
            success: false,
            modified_transactions: 0,
            message,
        }
    }
}

/// Result of running every active rule over a set of transactions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchApplication {
    pub processed: usize,
    pub modified: usize,
    pub rules_applied: usize,
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Keeps active rules only, sorted by priority (higher first)
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        let mut rules: Vec<Rule> = rules.into_iter().filter(|r| r.active).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        RuleEngine { rules }
    }

    /// Load the active rules from the database
    pub fn load(conn: &Connection) -> Result<Self> {
        Ok(RuleEngine::from_rules(list_rules(conn, true)?))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every matching rule in priority order, in memory only
    pub fn apply(&self, tx: &mut Transaction) -> EngineRun {
        let mut run = EngineRun::default();

        for rule in &self.rules {
            match rule.apply_to(tx) {
                RuleOutcome::Applied { changed } => {
                    debug!(rule_id = rule.id, transaction_id = tx.id, changed, "rule applied");
                    run.applied_rule_ids.push(rule.id);
                    run.changed |= changed;
                }
                RuleOutcome::Invalid(reason) => {
                    debug!(rule_id = rule.id, %reason, "rule skipped");
                }
                RuleOutcome::NotMatched => {}
            }
        }

        run
    }

    /// Apply to a stored transaction, persist the changes and audit each rule
    pub fn run_on(&self, conn: &Connection, tx: &mut Transaction, actor: &str) -> Result<EngineRun> {
        let run = self.apply(tx);

        if run.changed {
            *tx = update_transaction(conn, tx)?;
        }
        for rule_id in &run.applied_rule_ids {
            if let Some(rule) = self.rules.iter().find(|r| r.id == *rule_id) {
                record_rule_applied(conn, rule, tx, actor)?;
            }
        }

        Ok(run)
    }
}

fn record_rule_applied(conn: &Connection, rule: &Rule, tx: &Transaction, actor: &str) -> Result<()> {
    let event = Event::new(
        "rule_applied",
        "transaction",
        &tx.id.to_string(),
        serde_json::json!({
            "rule_id": rule.id,
            "rule_name": rule.name,
            "action": rule.action.as_str(),
            "action_value": rule.action_value,
            "amount": tx.amount,
            "category": tx.category,
        }),
        actor,
    );
    insert_event(conn, &event)
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Run all active rules on one transaction; returns how many rules applied
pub fn apply_rules_to_transaction(conn: &Connection, transaction_id: i64, actor: &str) -> Result<usize> {
    let engine = RuleEngine::load(conn)?;
    let mut tx = get_transaction(conn, transaction_id)?;
    let run = engine.run_on(conn, &mut tx, actor)?;
    Ok(run.applied_rule_ids.len())
}

/// Apply one rule to one transaction
pub fn apply_rule_to_transaction(
    conn: &Connection,
    rule_id: i64,
    transaction_id: i64,
    actor: &str,
) -> Result<RuleApplication> {
    let rule = get_rule(conn, rule_id)?;
    let mut tx = get_transaction(conn, transaction_id)?;

    if !rule.active {
        return Ok(RuleApplication::rejected(format!("Rule '{}' is inactive", rule.name)));
    }

    match rule.apply_to(&mut tx) {
        RuleOutcome::NotMatched => Ok(RuleApplication::rejected(format!(
            "Rule '{}' does not apply to transaction {}",
            rule.name, transaction_id
        ))),
        RuleOutcome::Invalid(reason) => Ok(RuleApplication::rejected(reason)),
        RuleOutcome::Applied { changed } => {
            if changed {
                tx = update_transaction(conn, &tx)?;
            }
            record_rule_applied(conn, &rule, &tx, actor)?;

            Ok(RuleApplication {
                success: true,
                modified_transactions: usize::from(changed),
                message: format!("Rule '{}' applied to transaction {}", rule.name, transaction_id),
            })
        }
    }
}

/// Apply one rule to every stored transaction
pub fn apply_rule_to_all(conn: &Connection, rule_id: i64, actor: &str) -> Result<RuleApplication> {
    let rule = get_rule(conn, rule_id)?;
    if !rule.active {
        return Ok(RuleApplication::rejected(format!("Rule '{}' is inactive", rule.name)));
    }

    let transactions = list_transactions(conn, &TransactionFilter::default(), date_basis(conn)?)?;
    let db_tx = conn.unchecked_transaction()?;
    let mut modified = 0;

    for mut tx in transactions {
        match rule.apply_to(&mut tx) {
            RuleOutcome::Applied { changed } => {
                if changed {
                    tx = update_transaction(&db_tx, &tx)?;
                    modified += 1;
                }
                record_rule_applied(&db_tx, &rule, &tx, actor)?;
            }
            RuleOutcome::Invalid(reason) => {
                return Ok(RuleApplication::rejected(reason));
            }
            RuleOutcome::NotMatched => {}
        }
    }
    db_tx.commit()?;

    info!(rule_id, modified, "rule applied to all transactions");
    Ok(RuleApplication {
        success: true,
        modified_transactions: modified,
        message: format!("Rule '{}' modified {} transaction(s)", rule.name, modified),
    })
}

/// Run every active rule over the transactions selected by the filter
pub fn apply_all_rules(conn: &Connection, filter: &TransactionFilter, actor: &str) -> Result<BatchApplication> {
    let engine = RuleEngine::load(conn)?;
    let transactions = list_transactions(conn, filter, date_basis(conn)?)?;
    let batch = run_batch(conn, &engine, transactions, actor)?;

    info!(
        processed = batch.processed,
        modified = batch.modified,
        rules_applied = batch.rules_applied,
        "rules applied"
    );
    Ok(batch)
}

fn run_batch(
    conn: &Connection,
    engine: &RuleEngine,
    transactions: Vec<Transaction>,
    actor: &str,
) -> Result<BatchApplication> {
    let mut batch = BatchApplication::default();
    if engine.is_empty() {
        batch.processed = transactions.len();
        return Ok(batch);
    }

    let db_tx = conn.unchecked_transaction()?;
    for mut tx in transactions {
        let run = engine.run_on(&db_tx, &mut tx, actor)?;
        batch.processed += 1;
        batch.rules_applied += run.applied_rule_ids.len();
        if run.changed {
            batch.modified += 1;
        }
    }
    db_tx.commit()?;

    Ok(batch)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_events_for_entity, insert_transaction, open_database};
    use crate::entities::rule::{insert_rule, toggle_rule, NewRule};
    use crate::entities::tag::{insert_tag, NewTag};
    use crate::entities::transaction::{source, NewTransaction, TransactionKind};
    use chrono::{NaiveDate, Utc};

    fn sample_tx(description: &str, amount: f64, category: Option<&str>) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: 1,
            date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            description: description.to_string(),
            amount,
            original_amount: Some(amount),
            kind: TransactionKind::Expense,
            category: category.map(str::to_string),
            source: source::MANUAL.to_string(),
            notes: None,
            invoice_date: None,
            created_at: now,
            updated_at: now,
            tag_ids: vec![],
        }
    }

    fn rule(id: i64, criterion: CriterionKind, value: &str, action: RuleAction, action_value: &str, priority: i64) -> Rule {
        let now = Utc::now();
        Rule {
            id,
            name: format!("rule {}", id),
            action,
            criterion,
            criterion_value: value.to_string(),
            action_value: action_value.to_string(),
            priority,
            active: true,
            tag_ids: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    fn store(conn: &Connection, description: &str, amount: f64) -> Transaction {
        insert_transaction(
            conn,
            &NewTransaction::new(
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                description,
                amount,
                TransactionKind::Expense,
            ),
            "test",
        )
        .unwrap()
    }

    #[test]
    fn test_criteria_are_case_insensitive() {
        let tx = sample_tx("UBER *TRIP SAO PAULO", 30.0, Some("Transport"));

        assert!(rule(1, CriterionKind::DescriptionContains, "uber", RuleAction::SetCategory, "x", 1).matches(&tx));
        assert!(rule(1, CriterionKind::DescriptionEquals, "uber *trip sao paulo", RuleAction::SetCategory, "x", 1).matches(&tx));
        assert!(!rule(1, CriterionKind::DescriptionEquals, "uber", RuleAction::SetCategory, "x", 1).matches(&tx));
        assert!(rule(1, CriterionKind::Category, "TRANSPORT", RuleAction::SetCategory, "x", 1).matches(&tx));
    }

    #[test]
    fn test_category_criterion_ignores_uncategorized() {
        let tx = sample_tx("Anything", 10.0, None);
        assert!(!rule(1, CriterionKind::Category, "", RuleAction::SetCategory, "x", 1).matches(&tx));
    }

    #[test]
    fn test_set_amount_uses_original_amount() {
        let mut tx = sample_tx("Shared dinner", 200.0, None);
        let half = rule(1, CriterionKind::DescriptionContains, "dinner", RuleAction::SetAmount, "50", 1);

        assert_eq!(half.apply_to(&mut tx), RuleOutcome::Applied { changed: true });
        assert_eq!(tx.amount, 100.0);

        // Re-applying does not halve again
        assert_eq!(half.apply_to(&mut tx), RuleOutcome::Applied { changed: false });
        assert_eq!(tx.amount, 100.0);
        assert_eq!(tx.original_amount, Some(200.0));
    }

    #[test]
    fn test_set_amount_records_missing_original() {
        let mut tx = sample_tx("Rent", 1000.0, None);
        tx.original_amount = None;
        let third = rule(1, CriterionKind::DescriptionEquals, "rent", RuleAction::SetAmount, "33.333", 1);

        third.apply_to(&mut tx);
        assert_eq!(tx.original_amount, Some(1000.0));
        assert_eq!(tx.amount, 333.33);
    }

    #[test]
    fn test_invalid_percentage_is_reported() {
        let mut tx = sample_tx("Rent", 1000.0, None);
        let broken = rule(1, CriterionKind::DescriptionEquals, "rent", RuleAction::SetAmount, "abc", 1);
        assert!(matches!(broken.apply_to(&mut tx), RuleOutcome::Invalid(_)));
        assert_eq!(tx.amount, 1000.0);
    }

    #[test]
    fn test_engine_chains_rules_by_priority() {
        let engine = RuleEngine::from_rules(vec![
            rule(1, CriterionKind::Category, "transport", RuleAction::SetAmount, "50", 1),
            rule(2, CriterionKind::DescriptionContains, "uber", RuleAction::SetCategory, "Transport", 10),
        ]);
        let mut tx = sample_tx("Uber trip", 40.0, None);

        let run = engine.apply(&mut tx);
        assert_eq!(run.applied_rule_ids, vec![2, 1]);
        assert!(run.changed);
        assert_eq!(tx.category.as_deref(), Some("Transport"));
        assert_eq!(tx.amount, 20.0);
    }

    #[test]
    fn test_engine_skips_inactive_rules() {
        let mut inactive = rule(1, CriterionKind::DescriptionContains, "uber", RuleAction::SetCategory, "Transport", 1);
        inactive.active = false;
        let engine = RuleEngine::from_rules(vec![inactive]);
        assert_eq!(engine.rule_count(), 0);
    }

    #[test]
    fn test_apply_rule_to_transaction() {
        let conn = open_database(":memory:").unwrap();
        let tx = store(&conn, "Netflix subscription", 39.9);
        let other = store(&conn, "Bakery", 12.0);
        let r = insert_rule(
            &conn,
            &NewRule::new("Streaming", CriterionKind::DescriptionContains, "netflix", RuleAction::SetCategory)
                .with_action_value("Entertainment"),
        )
        .unwrap();

        let applied = apply_rule_to_transaction(&conn, r.id, tx.id, "test").unwrap();
        assert!(applied.success);
        assert_eq!(applied.modified_transactions, 1);
        assert_eq!(get_transaction(&conn, tx.id).unwrap().category.as_deref(), Some("Entertainment"));

        let skipped = apply_rule_to_transaction(&conn, r.id, other.id, "test").unwrap();
        assert!(!skipped.success);
        assert_eq!(skipped.modified_transactions, 0);

        toggle_rule(&conn, r.id).unwrap();
        let inactive = apply_rule_to_transaction(&conn, r.id, tx.id, "test").unwrap();
        assert!(!inactive.success);
        assert_eq!(inactive.message, "Rule 'Streaming' is inactive");

        let events = get_events_for_entity(&conn, "transaction", &tx.id.to_string()).unwrap();
        assert!(events.iter().any(|e| e.event_type == "rule_applied"));
    }

    #[test]
    fn test_apply_rule_to_all_and_tags() {
        let conn = open_database(":memory:").unwrap();
        let a = store(&conn, "Hotel Lisbon", 500.0);
        let b = store(&conn, "HOTEL Porto", 300.0);
        store(&conn, "Groceries", 80.0);
        let tag = insert_tag(&conn, &NewTag::new("Travel")).unwrap();
        let r = insert_rule(
            &conn,
            &NewRule::new("Hotels", CriterionKind::DescriptionContains, "hotel", RuleAction::AddTags)
                .with_tags(vec![tag.id]),
        )
        .unwrap();

        let result = apply_rule_to_all(&conn, r.id, "test").unwrap();
        assert!(result.success);
        assert_eq!(result.modified_transactions, 2);
        assert_eq!(get_transaction(&conn, a.id).unwrap().tag_ids, vec![tag.id]);
        assert_eq!(get_transaction(&conn, b.id).unwrap().tag_ids, vec![tag.id]);

        // Second run changes nothing
        assert_eq!(apply_rule_to_all(&conn, r.id, "test").unwrap().modified_transactions, 0);
    }

    #[test]
    fn test_apply_all_rules_batch() {
        let conn = open_database(":memory:").unwrap();
        store(&conn, "Uber", 20.0);
        store(&conn, "Uber Eats", 50.0);
        store(&conn, "Pharmacy", 15.0);
        insert_rule(
            &conn,
            &NewRule::new("Uber", CriterionKind::DescriptionContains, "uber", RuleAction::SetCategory)
                .with_action_value("Transport"),
        )
        .unwrap();
        insert_rule(
            &conn,
            &NewRule::new("Eats", CriterionKind::DescriptionContains, "eats", RuleAction::SetCategory)
                .with_action_value("Food"),
        )
        .unwrap();

        let batch = apply_all_rules(&conn, &TransactionFilter::default(), "test").unwrap();
        assert_eq!(batch.processed, 3);
        assert_eq!(batch.modified, 2);
        assert_eq!(batch.rules_applied, 3);

        let eats = list_transactions(&conn, &TransactionFilter::default(), date_basis(&conn).unwrap())
            .unwrap()
            .into_iter()
            .find(|t| t.description == "Uber Eats")
            .unwrap();
        // "Eats" has the higher priority, then "Uber" overrides it
        assert_eq!(eats.category.as_deref(), Some("Transport"));
    }

    #[test]
    fn test_apply_rules_to_single_transaction() {
        let conn = open_database(":memory:").unwrap();
        let tx = store(&conn, "Gym membership", 100.0);
        insert_rule(
            &conn,
            &NewRule::new("Gym", CriterionKind::DescriptionContains, "gym", RuleAction::SetAmount)
                .with_action_value("25"),
        )
        .unwrap();

        assert_eq!(apply_rules_to_transaction(&conn, tx.id, "test").unwrap(), 1);
        let stored = get_transaction(&conn, tx.id).unwrap();
        assert_eq!(stored.amount, 25.0);
        assert_eq!(stored.original_amount, Some(100.0));
    }
}
