// 📊 Monthly Summary - income and expenses per category for a period

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::list_transactions;
use crate::entities::setting::{date_basis, DateBasis};
use crate::entities::transaction::{TransactionFilter, TransactionKind};
use crate::error::{LedgerError, Result};
use crate::rules::round_cents;

pub const UNCATEGORIZED: &str = "Uncategorized";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryQuery {
    pub month: Option<u32>,
    pub year: Option<i32>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub tag_ids: Vec<i64>,
}

impl SummaryQuery {
    pub fn for_month(month: u32, year: i32) -> Self {
        SummaryQuery {
            month: Some(month),
            year: Some(year),
            ..Default::default()
        }
    }

    fn to_filter(&self) -> Result<TransactionFilter> {
        let has_month = self.month.is_some() && self.year.is_some();
        let has_range = self.start.is_some() && self.end.is_some();
        if !has_month && !has_range {
            return Err(LedgerError::validation(
                "Provide month and year, or start and end dates",
            ));
        }

        Ok(TransactionFilter {
            month: self.month,
            year: self.year,
            start: self.start,
            end: self.end,
            tag_ids: self.tag_ids.clone(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub month: Option<u32>,
    pub year: Option<i32>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub date_basis: DateBasis,
    pub total_income: f64,
    pub total_expense: f64,
    pub balance: f64,
    pub income_by_category: BTreeMap<String, f64>,
    pub expense_by_category: BTreeMap<String, f64>,
}

pub fn monthly_summary(conn: &Connection, query: &SummaryQuery) -> Result<MonthlySummary> {
    let filter = query.to_filter()?;
    let (start, end) = filter
        .date_range()?
        .ok_or_else(|| LedgerError::validation("A date range is required"))?;

    let basis = date_basis(conn)?;
    let transactions = list_transactions(conn, &filter, basis)?;

    let mut income_by_category: BTreeMap<String, f64> = BTreeMap::new();
    let mut expense_by_category: BTreeMap<String, f64> = BTreeMap::new();
    let mut total_income = 0.0;
    let mut total_expense = 0.0;

    for tx in &transactions {
        let category = tx
            .category
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| UNCATEGORIZED.to_string());

        match tx.kind {
            TransactionKind::Income => {
                *income_by_category.entry(category).or_default() += tx.amount;
                total_income += tx.amount;
            }
            TransactionKind::Expense => {
                *expense_by_category.entry(category).or_default() += tx.amount;
                total_expense += tx.amount;
            }
        }
    }

    // Sums of binary floats drift; report everything in cents
    let total_income = round_cents(total_income);
    let total_expense = round_cents(total_expense);
    for sum in income_by_category.values_mut().chain(expense_by_category.values_mut()) {
        *sum = round_cents(*sum);
    }

    Ok(MonthlySummary {
        month: query.month,
        year: query.year,
        start,
        end,
        date_basis: basis,
        total_income,
        total_expense,
        balance: round_cents(total_income - total_expense),
        income_by_category,
        expense_by_category,
    })
}
