// 💸 Transaction Entity - a single money movement with its editable values
//
// The imported/typed amount is kept in `original_amount` so any edit made by
// a person or by a rule can be undone later.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

// ============================================================================
// TRANSACTION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Money coming in
    Income,

    /// Money going out
    Expense,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "income" => Ok(TransactionKind::Income),
            "expense" => Ok(TransactionKind::Expense),
            other => Err(LedgerError::validation(format!(
                "Invalid transaction kind '{}' (expected income or expense)",
                other
            ))),
        }
    }
}

/// Where a transaction came from
pub mod source {
    pub const MANUAL: &str = "manual";
    pub const BANK_STATEMENT: &str = "bank_statement";
    pub const CREDIT_CARD_INVOICE: &str = "credit_card_invoice";
}

// ============================================================================
// TRANSACTION ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub date: NaiveDate,
    pub description: String,

    /// Current amount, always non-negative; direction lives in `kind`
    pub amount: f64,

    /// Amount as first recorded; restored by `restore_original_amount`
    pub original_amount: Option<f64>,

    pub kind: TransactionKind,
    pub category: Option<String>,
    pub source: String,
    pub notes: Option<String>,

    /// Credit-card billing date (closing/payment date of the invoice)
    pub invoice_date: Option<NaiveDate>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Attached tag ids, ascending
    #[serde(default)]
    pub tag_ids: Vec<i64>,
}

impl Transaction {
    pub fn is_income(&self) -> bool {
        self.kind == TransactionKind::Income
    }

    pub fn is_expense(&self) -> bool {
        self.kind == TransactionKind::Expense
    }

    pub fn has_category(&self) -> bool {
        self.category.as_deref().map_or(false, |c| !c.is_empty())
    }

    /// Case-insensitive substring match on the description
    pub fn description_contains(&self, text: &str) -> bool {
        self.description.to_lowercase().contains(&text.to_lowercase())
    }

    /// Case-insensitive equality on the description
    pub fn description_equals(&self, text: &str) -> bool {
        self.description.to_lowercase() == text.to_lowercase()
    }

    pub fn set_category(&mut self, category: &str) {
        self.category = Some(category.to_string());
        self.touch();
    }

    pub fn set_amount(&mut self, amount: f64) -> Result<()> {
        validate_non_negative_amount(amount)?;
        if self.original_amount.is_none() {
            self.original_amount = Some(self.amount);
        }
        self.amount = amount;
        self.touch();
        Ok(())
    }

    /// Returns true when the tag was not attached yet
    pub fn add_tag(&mut self, tag_id: i64) -> bool {
        match self.tag_ids.binary_search(&tag_id) {
            Ok(_) => false,
            Err(pos) => {
                self.tag_ids.insert(pos, tag_id);
                self.touch();
                true
            }
        }
    }

    pub fn remove_tag(&mut self, tag_id: i64) -> bool {
        match self.tag_ids.binary_search(&tag_id) {
            Ok(pos) => {
                self.tag_ids.remove(pos);
                self.touch();
                true
            }
            Err(_) => false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Apply a partial update, keeping `original_amount` untouched
    pub fn apply_patch(&mut self, patch: &TransactionPatch) -> Result<()> {
        patch.validate()?;

        let invoice_date = patch.invoice_date.or(self.invoice_date);
        validate_invoice_date(self.date, invoice_date)?;

        if let Some(description) = &patch.description {
            self.description = description.trim().to_string();
        }
        if let Some(amount) = patch.amount {
            self.amount = amount;
        }
        if let Some(category) = &patch.category {
            // Blank clears the category, same as on insert
            let category = category.trim();
            self.category = (!category.is_empty()).then(|| category.to_string());
        }
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
        self.invoice_date = invoice_date;
        self.touch();

        Ok(())
    }

    /// The date used for period filters under the given basis
    pub fn reference_date(&self, use_invoice_date: bool) -> NaiveDate {
        if use_invoice_date {
            self.invoice_date.unwrap_or(self.date)
        } else {
            self.date
        }
    }
}

// ============================================================================
// INPUTS
// ============================================================================

fn default_source() -> String {
    source::MANUAL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub kind: TransactionKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<NaiveDate>,
}

impl NewTransaction {
    pub fn new(date: NaiveDate, description: &str, amount: f64, kind: TransactionKind) -> Self {
        NewTransaction {
            date,
            description: description.to_string(),
            amount,
            kind,
            category: None,
            source: default_source(),
            notes: None,
            invoice_date: None,
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn with_invoice_date(mut self, invoice_date: NaiveDate) -> Self {
        self.invoice_date = Some(invoice_date);
        self
    }

    /// Stored invariants: non-empty description, `amount >= 0`, invoice on or after date
    pub fn validate(&self) -> Result<()> {
        if self.description.trim().is_empty() {
            return Err(LedgerError::validation("Description is required"));
        }
        validate_non_negative_amount(self.amount)?;
        validate_invoice_date(self.date, self.invoice_date)
    }

    /// Manual entry additionally requires a positive amount
    pub fn validate_entry(&self) -> Result<()> {
        self.validate()?;
        validate_positive_amount(self.amount)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<NaiveDate>,
}

impl TransactionPatch {
    pub fn validate(&self) -> Result<()> {
        if let Some(description) = &self.description {
            if description.trim().is_empty() {
                return Err(LedgerError::validation("Description cannot be empty"));
            }
        }
        if let Some(amount) = self.amount {
            validate_positive_amount(amount)?;
        }
        Ok(())
    }
}

fn validate_positive_amount(amount: f64) -> Result<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(LedgerError::validation("Amount must be greater than zero"));
    }
    Ok(())
}

fn validate_non_negative_amount(amount: f64) -> Result<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(LedgerError::validation("Amount must be a non-negative number"));
    }
    Ok(())
}

fn validate_invoice_date(date: NaiveDate, invoice_date: Option<NaiveDate>) -> Result<()> {
    match invoice_date {
        Some(invoice) if invoice < date => Err(LedgerError::validation(
            "Invoice date must be on or after the transaction date",
        )),
        _ => Ok(()),
    }
}

// ============================================================================
// FILTERS
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub month: Option<u32>,
    pub year: Option<i32>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub category: Option<String>,
    pub kind: Option<TransactionKind>,

    /// Matches transactions carrying ANY of these tags
    pub tag_ids: Vec<i64>,
}

impl TransactionFilter {
    pub fn for_month(month: u32, year: i32) -> Self {
        TransactionFilter {
            month: Some(month),
            year: Some(year),
            ..Default::default()
        }
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        TransactionFilter {
            start: Some(start),
            end: Some(end),
            ..Default::default()
        }
    }

    /// Inclusive date range; an explicit start/end pair wins over month/year
    pub fn date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end < start {
                return Err(LedgerError::validation("End date must not be before start date"));
            }
            return Ok(Some((start, end)));
        }

        match (self.month, self.year) {
            (Some(month), Some(year)) => month_bounds(month, year).map(Some),
            _ => Ok(None),
        }
    }
}

/// First and last day of a calendar month
pub fn month_bounds(month: u32, year: i32) -> Result<(NaiveDate, NaiveDate)> {
    if !(1..=12).contains(&month) {
        return Err(LedgerError::validation("Month must be between 1 and 12"));
    }
    if year < 2000 {
        return Err(LedgerError::validation("Year must be 2000 or later"));
    }

    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| LedgerError::validation("Invalid month/year"))?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| LedgerError::validation("Invalid month/year"))?;

    let last = next_first.pred_opt().unwrap_or(first);
    debug_assert_eq!(last.month(), month);
    Ok((first, last))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample() -> Transaction {
        let now = Utc::now();
        Transaction {
            id: 1,
            date: date(2024, 3, 10),
            description: "UBER *TRIP".to_string(),
            amount: 100.0,
            original_amount: Some(100.0),
            kind: TransactionKind::Expense,
            category: None,
            source: source::MANUAL.to_string(),
            notes: None,
            invoice_date: None,
            created_at: now,
            updated_at: now,
            tag_ids: vec![],
        }
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(TransactionKind::parse("Income").unwrap(), TransactionKind::Income);
        assert_eq!(TransactionKind::parse(" expense ").unwrap(), TransactionKind::Expense);
        assert!(TransactionKind::parse("transfer").is_err());
    }

    #[test]
    fn test_description_matching_is_case_insensitive() {
        let tx = sample();
        assert!(tx.description_contains("uber"));
        assert!(tx.description_equals("uber *trip"));
        assert!(!tx.description_equals("uber"));
    }

    #[test]
    fn test_new_transaction_validation() {
        let ok = NewTransaction::new(date(2024, 1, 5), "Rent", 1200.0, TransactionKind::Expense);
        assert!(ok.validate().is_ok());

        let blank = NewTransaction::new(date(2024, 1, 5), "   ", 10.0, TransactionKind::Expense);
        assert!(blank.validate().is_err());

        let zero = NewTransaction::new(date(2024, 1, 5), "Refund", 0.0, TransactionKind::Expense);
        assert!(zero.validate().is_ok());
        assert!(zero.validate_entry().is_err());

        let negative = NewTransaction::new(date(2024, 1, 5), "Rent", -5.0, TransactionKind::Expense);
        assert!(negative.validate().is_err());

        let early_invoice = NewTransaction::new(date(2024, 1, 5), "Card", 10.0, TransactionKind::Expense)
            .with_invoice_date(date(2024, 1, 4));
        assert!(early_invoice.validate().is_err());
    }

    #[test]
    fn test_patch_keeps_original_amount() {
        let mut tx = sample();
        let patch = TransactionPatch {
            amount: Some(42.0),
            category: Some("Transport".to_string()),
            ..Default::default()
        };
        tx.apply_patch(&patch).unwrap();

        assert_eq!(tx.amount, 42.0);
        assert_eq!(tx.original_amount, Some(100.0));
        assert_eq!(tx.category.as_deref(), Some("Transport"));
    }

    #[test]
    fn test_patch_normalizes_category() {
        let mut tx = sample();
        let padded = TransactionPatch {
            category: Some("  Food ".to_string()),
            ..Default::default()
        };
        tx.apply_patch(&padded).unwrap();
        assert_eq!(tx.category.as_deref(), Some("Food"));

        let blank = TransactionPatch {
            category: Some("   ".to_string()),
            ..Default::default()
        };
        tx.apply_patch(&blank).unwrap();
        assert_eq!(tx.category, None);
    }

    #[test]
    fn test_patch_rejects_invoice_before_date() {
        let mut tx = sample();
        let patch = TransactionPatch {
            invoice_date: Some(date(2024, 3, 1)),
            ..Default::default()
        };
        assert!(tx.apply_patch(&patch).is_err());
        assert_eq!(tx.invoice_date, None);
    }

    #[test]
    fn test_tags_stay_sorted_and_unique() {
        let mut tx = sample();
        assert!(tx.add_tag(5));
        assert!(tx.add_tag(2));
        assert!(!tx.add_tag(5));
        assert_eq!(tx.tag_ids, vec![2, 5]);
        assert!(tx.remove_tag(2));
        assert!(!tx.remove_tag(2));
        assert_eq!(tx.tag_ids, vec![5]);
    }

    #[test]
    fn test_month_bounds() {
        assert_eq!(month_bounds(2, 2024).unwrap(), (date(2024, 2, 1), date(2024, 2, 29)));
        assert_eq!(month_bounds(12, 2023).unwrap(), (date(2023, 12, 1), date(2023, 12, 31)));
        assert!(month_bounds(13, 2024).is_err());
        assert!(month_bounds(1, 1999).is_err());
    }

    #[test]
    fn test_explicit_range_wins_over_month() {
        let filter = TransactionFilter {
            month: Some(1),
            year: Some(2024),
            start: Some(date(2024, 5, 1)),
            end: Some(date(2024, 5, 15)),
            ..Default::default()
        };
        assert_eq!(filter.date_range().unwrap(), Some((date(2024, 5, 1), date(2024, 5, 15))));

        let month_only = TransactionFilter::for_month(1, 2024);
        assert_eq!(month_only.date_range().unwrap(), Some((date(2024, 1, 1), date(2024, 1, 31))));

        assert_eq!(TransactionFilter::default().date_range().unwrap(), None);
    }

    #[test]
    fn test_reference_date_falls_back_to_date() {
        let mut tx = sample();
        assert_eq!(tx.reference_date(true), tx.date);
        tx.invoice_date = Some(date(2024, 4, 5));
        assert_eq!(tx.reference_date(true), date(2024, 4, 5));
        assert_eq!(tx.reference_date(false), tx.date);
    }
}
