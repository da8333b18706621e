// 📥 Statement Importer - bank statements and credit-card invoices
//
// Reads CSV or Excel files, maps the header to the ledger fields, and stores
// every valid row as a transaction tagged "Routine". Rows that cannot be
// parsed are reported and skipped; the rest of the file still goes in.

use std::io::Cursor;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::{get_events_for_entity, get_transaction, insert_event, insert_transaction, Event};
use crate::entities::tag::{add_transaction_tag, ensure_routine_tag};
use crate::entities::transaction::{source, NewTransaction, TransactionKind};
use crate::error::{LedgerError, Result};
use crate::rules::RuleEngine;

const ACTOR: &str = "importer";

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    /// Positive amounts are income, negative are expenses
    Statement,

    /// Every row is an expense; may carry an invoice date
    Invoice,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::Statement => "statement",
            ImportKind::Invoice => "invoice",
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            ImportKind::Statement => source::BANK_STATEMENT,
            ImportKind::Invoice => source::CREDIT_CARD_INVOICE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Excel,
}

impl FileFormat {
    /// Detect from the file extension (case-insensitive)
    pub fn from_file_name(file_name: &str) -> Result<Self> {
        let lower = file_name.trim().to_lowercase();
        if lower.ends_with(".csv") {
            Ok(FileFormat::Csv)
        } else if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
            Ok(FileFormat::Excel)
        } else {
            Err(LedgerError::validation(
                "Unsupported file format. Use CSV or Excel (.csv, .xlsx, .xls)",
            ))
        }
    }
}

/// One spreadsheet cell, independent of the file format
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Cell {
    fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    fn to_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some(format!("{}", *n as i64)),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRow {
    /// 1-based line in the file, header included
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub total_imported: usize,
    pub transaction_ids: Vec<i64>,
    pub skipped: Vec<SkippedRow>,
    pub rules_applied: usize,
    pub file_hash: String,
    pub message: String,
}

// ============================================================================
// READING
// ============================================================================

struct Sheet {
    header: Vec<String>,

    /// Unreadable rows carry the reader's error message
    rows: Vec<std::result::Result<Vec<Cell>, String>>,
}

fn read_sheet(format: FileFormat, bytes: &[u8]) -> Result<Sheet> {
    match format {
        FileFormat::Csv => read_csv(bytes),
        FileFormat::Excel => read_excel(bytes),
    }
}

/// Semicolon-separated exports are common for Brazilian banks
fn detect_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let commas = first_line.iter().filter(|b| **b == b',').count();
    let semicolons = first_line.iter().filter(|b| **b == b';').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn read_csv(bytes: &[u8]) -> Result<Sheet> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(detect_delimiter(bytes))
        .from_reader(bytes);

    let header = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let cells: std::result::Result<Vec<Cell>, String> = record
            .map(|record| {
                record
                    .iter()
                    .map(|v| if v.trim().is_empty() { Cell::Empty } else { Cell::Text(v.to_string()) })
                    .collect()
            })
            .map_err(|e| format!("Unreadable record: {e}"));
        rows.push(cells);
    }

    Ok(Sheet { header, rows })
}

fn read_excel(bytes: &[u8]) -> Result<Sheet> {
    use calamine::{open_workbook_auto_from_rs, Data, Reader};

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| LedgerError::Spreadsheet(format!("Failed to open workbook: {e}")))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| LedgerError::Spreadsheet("Workbook has no worksheets".to_string()))?
        .map_err(|e| LedgerError::Spreadsheet(format!("Failed to read worksheet: {e}")))?;

    let mut iter = range.rows();
    let header = match iter.next() {
        Some(row) => row
            .iter()
            .map(|c| match c {
                Data::String(s) => s.clone(),
                Data::Empty => String::new(),
                other => other.to_string(),
            })
            .collect(),
        None => Vec::new(),
    };

    let rows: Vec<std::result::Result<Vec<Cell>, String>> = iter
        .map(|row| {
            Ok(row
                .iter()
                .map(|c| match c {
                    Data::Empty => Cell::Empty,
                    Data::String(s) => Cell::Text(s.clone()),
                    Data::Float(f) => Cell::Number(*f),
                    Data::Int(i) => Cell::Number(*i as f64),
                    Data::Bool(b) => Cell::Text(b.to_string()),
                    Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()).map_or(Cell::Empty, Cell::Date),
                    Data::DateTimeIso(s) => Cell::Text(s.clone()),
                    Data::DurationIso(s) => Cell::Text(s.clone()),
                    Data::Error(_) => Cell::Empty,
                })
                .collect())
        })
        .collect();

    Ok(Sheet { header, rows })
}

/// Excel day serial (1900 date system) to a calendar date
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(Duration::days(serial.floor() as i64))
}

// ============================================================================
// COLUMN MAPPING
// ============================================================================

struct Columns {
    date: usize,
    description: usize,
    amount: usize,
    category: Option<usize>,
    invoice_date: Option<usize>,
}

fn find_column(header: &[String], names: &[&str]) -> Option<usize> {
    header
        .iter()
        .position(|h| names.iter().any(|n| h.trim().to_lowercase() == *n))
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self> {
        let required = |names: &[&str]| {
            find_column(header, names).ok_or_else(|| {
                LedgerError::validation(format!("Column '{}' not found in file", names[0]))
            })
        };

        Ok(Columns {
            date: required(&["data", "date"])?,
            description: required(&["descricao", "description"])?,
            amount: required(&["valor", "amount"])?,
            category: find_column(header, &["categoria", "category"]),
            invoice_date: find_column(header, &["data_fatura", "invoice_date"]),
        })
    }
}

// ============================================================================
// ROW PARSING
// ============================================================================

/// `DD/MM/YYYY` when the text has slashes, otherwise ISO with optional time
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    let parsed = if value.contains('/') {
        NaiveDate::parse_from_str(value, "%d/%m/%Y").ok()
    } else {
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").ok().map(|dt| dt.date()))
            .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok().map(|dt| dt.date()))
    };

    parsed.ok_or_else(|| LedgerError::validation(format!("Invalid date '{}'", value)))
}

/// Accepts `-12.50`, `12,50`, `1,234.50` and `1.234,56`.
/// With both separators present the last one is the decimal mark.
pub fn parse_amount(value: &str) -> Result<f64> {
    let cleaned: String = value.trim().chars().filter(|c| !c.is_whitespace()).collect();
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| LedgerError::validation(format!("Invalid amount '{}'", value.trim())))
}

fn cell_at(row: &[Cell], idx: usize) -> &Cell {
    row.get(idx).unwrap_or(&Cell::Empty)
}

fn cell_date(cell: &Cell) -> Result<NaiveDate> {
    match cell {
        Cell::Date(d) => Ok(*d),
        Cell::Number(n) => excel_serial_to_date(*n)
            .ok_or_else(|| LedgerError::validation(format!("Invalid date serial {}", n))),
        Cell::Text(s) => parse_date(s),
        Cell::Empty => Err(LedgerError::validation("Date is empty")),
    }
}

fn cell_amount(cell: &Cell) -> Result<f64> {
    match cell {
        Cell::Number(n) => Ok(*n),
        Cell::Text(s) => parse_amount(s),
        _ => Err(LedgerError::validation("Amount is empty")),
    }
}

fn parse_row(row: &[Cell], columns: &Columns, kind: ImportKind) -> Result<NewTransaction> {
    let date = cell_date(cell_at(row, columns.date))?;
    let description = cell_at(row, columns.description)
        .to_text()
        .ok_or_else(|| LedgerError::validation("Description is empty"))?;
    let raw_amount = cell_amount(cell_at(row, columns.amount))?;

    let tx_kind = match kind {
        ImportKind::Statement if raw_amount > 0.0 => TransactionKind::Income,
        _ => TransactionKind::Expense,
    };

    let mut new = NewTransaction::new(date, &description, raw_amount.abs(), tx_kind).with_source(kind.source());
    new.category = columns.category.and_then(|idx| cell_at(row, idx).to_text());

    if kind == ImportKind::Invoice {
        if let Some(idx) = columns.invoice_date {
            let cell = cell_at(row, idx);
            if !cell.is_empty() {
                new.invoice_date = Some(cell_date(cell)?);
            }
        }
    }

    new.validate()?;
    Ok(new)
}

// ============================================================================
// IMPORT
// ============================================================================

pub fn file_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Import a statement or invoice file into the ledger
pub fn import_file(conn: &Connection, file_name: &str, bytes: &[u8], kind: ImportKind) -> Result<ImportReport> {
    let format = FileFormat::from_file_name(file_name)?;
    let hash = file_hash(bytes);

    let previous = get_events_for_entity(conn, "import", &hash)?;
    if !previous.is_empty() {
        warn!(file = file_name, hash = %hash, times = previous.len(), "file was already imported");
    }

    let sheet = read_sheet(format, bytes)?;
    let columns = Columns::from_header(&sheet.header)?;

    let db_tx = conn.unchecked_transaction()?;
    let routine = ensure_routine_tag(&db_tx)?;
    let engine = RuleEngine::load(&db_tx)?;

    let mut transaction_ids = Vec::new();
    let mut skipped = Vec::new();
    let mut rules_applied = 0;

    for (idx, row) in sheet.rows.iter().enumerate() {
        let line = idx + 2;
        let parsed = match row {
            Ok(cells) if cells.iter().all(Cell::is_empty) => continue,
            Ok(cells) => parse_row(cells, &columns, kind),
            Err(reason) => Err(LedgerError::validation(reason.clone())),
        };

        let new = match parsed {
            Ok(new) => new,
            Err(LedgerError::Validation(reason)) => {
                warn!(file = file_name, row = line, %reason, "skipping row");
                skipped.push(SkippedRow { row: line, reason });
                continue;
            }
            Err(e) => return Err(e),
        };

        let stored = insert_transaction(&db_tx, &new, ACTOR)?;
        add_transaction_tag(&db_tx, stored.id, routine.id)?;

        let mut tx = get_transaction(&db_tx, stored.id)?;
        let run = engine.run_on(&db_tx, &mut tx, ACTOR)?;
        rules_applied += run.applied_rule_ids.len();

        transaction_ids.push(tx.id);
    }

    let event = Event::new(
        "import_completed",
        "import",
        &hash,
        serde_json::json!({
            "file_name": file_name,
            "kind": kind.as_str(),
            "imported": transaction_ids.len(),
            "skipped": skipped.len(),
        }),
        ACTOR,
    );
    insert_event(&db_tx, &event)?;
    db_tx.commit()?;

    let mut message = format!("{} transactions imported successfully", transaction_ids.len());
    if !skipped.is_empty() {
        message.push_str(&format!(" ({} rows skipped)", skipped.len()));
    }

    info!(
        file = file_name,
        kind = kind.as_str(),
        imported = transaction_ids.len(),
        skipped = skipped.len(),
        rules_applied,
        "import finished"
    );

    Ok(ImportReport {
        total_imported: transaction_ids.len(),
        transaction_ids,
        skipped,
        rules_applied,
        file_hash: hash,
        message,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;
    use crate::entities::rule::{insert_rule, CriterionKind, NewRule, RuleAction};
    use crate::entities::tag::{find_tag_by_name, ROUTINE_TAG};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    const STATEMENT: &str = "Data, Descricao ,VALOR,Categoria\n\
        05/01/2024,Salary,5000.00,Income\n\
        2024-01-07,Supermarket,-235.40,\n\
        10/01/2024,Pharmacy,-42.10,Health\n";

    #[test]
    fn test_file_format_detection() {
        assert_eq!(FileFormat::from_file_name("extrato.CSV").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_file_name("fatura.xlsx").unwrap(), FileFormat::Excel);
        assert_eq!(FileFormat::from_file_name("old.xls").unwrap(), FileFormat::Excel);
        assert!(FileFormat::from_file_name("notes.txt").is_err());
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("05/01/2024").unwrap(), date(2024, 1, 5));
        assert_eq!(parse_date("2024-01-05").unwrap(), date(2024, 1, 5));
        assert_eq!(parse_date("2024-01-05 13:45:00").unwrap(), date(2024, 1, 5));
        assert!(parse_date("01/13/2024").is_err());
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount("-12.50").unwrap(), -12.5);
        assert_eq!(parse_amount("12,50").unwrap(), 12.5);
        assert_eq!(parse_amount(" 1,234.50 ").unwrap(), 1234.5);
        assert_eq!(parse_amount("-1.234,56").unwrap(), -1234.56);
        assert_eq!(parse_amount("1.234.567,89").unwrap(), 1234567.89);
        assert!(parse_amount("1,234,567").is_err());
        assert!(parse_amount("abc").is_err());
    }

    #[test]
    fn test_excel_serial_dates() {
        assert_eq!(excel_serial_to_date(45292.0), Some(date(2024, 1, 1)));
        assert_eq!(excel_serial_to_date(45292.75), Some(date(2024, 1, 1)));
        assert_eq!(excel_serial_to_date(0.0), None);
    }

    #[test]
    fn test_import_statement() {
        let conn = open_database(":memory:").unwrap();
        let report = import_file(&conn, "extrato.csv", STATEMENT.as_bytes(), ImportKind::Statement).unwrap();

        assert_eq!(report.total_imported, 3);
        assert!(report.skipped.is_empty());
        assert_eq!(report.file_hash.len(), 64);

        let salary = get_transaction(&conn, report.transaction_ids[0]).unwrap();
        assert_eq!(salary.kind, TransactionKind::Income);
        assert_eq!(salary.amount, 5000.0);
        assert_eq!(salary.category.as_deref(), Some("Income"));
        assert_eq!(salary.source, source::BANK_STATEMENT);

        let market = get_transaction(&conn, report.transaction_ids[1]).unwrap();
        assert_eq!(market.kind, TransactionKind::Expense);
        assert_eq!(market.amount, 235.4);
        assert_eq!(market.original_amount, Some(235.4));
        assert_eq!(market.category, None);
        assert_eq!(market.date, date(2024, 1, 7));

        let routine = find_tag_by_name(&conn, ROUTINE_TAG).unwrap().unwrap();
        assert_eq!(market.tag_ids, vec![routine.id]);
    }

    #[test]
    fn test_import_invoice_is_always_expense() {
        let conn = open_database(":memory:").unwrap();
        let csv = "data;descricao;valor;data_fatura\n\
            28/01/2024;Flight;1200,00;10/02/2024\n\
            29/01/2024;Refund;-50,00;\n";
        let report = import_file(&conn, "fatura.csv", csv.as_bytes(), ImportKind::Invoice).unwrap();
        assert_eq!(report.total_imported, 2);

        let flight = get_transaction(&conn, report.transaction_ids[0]).unwrap();
        assert_eq!(flight.kind, TransactionKind::Expense);
        assert_eq!(flight.amount, 1200.0);
        assert_eq!(flight.invoice_date, Some(date(2024, 2, 10)));
        assert_eq!(flight.source, source::CREDIT_CARD_INVOICE);

        let refund = get_transaction(&conn, report.transaction_ids[1]).unwrap();
        assert_eq!(refund.kind, TransactionKind::Expense);
        assert_eq!(refund.amount, 50.0);
        assert_eq!(refund.invoice_date, None);
    }

    #[test]
    fn test_import_excel_first_worksheet() {
        let conn = open_database(":memory:").unwrap();
        let bytes = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/extrato.xlsx"));
        let report = import_file(&conn, "extrato.xlsx", bytes, ImportKind::Statement).unwrap();

        assert_eq!(report.total_imported, 3);
        assert!(report.skipped.is_empty());

        // Date-formatted cell
        let salary = get_transaction(&conn, report.transaction_ids[0]).unwrap();
        assert_eq!(salary.date, date(2024, 1, 5));
        assert_eq!(salary.amount, 5000.0);
        assert_eq!(salary.kind, TransactionKind::Income);
        assert_eq!(salary.category.as_deref(), Some("Income"));

        // Date with a time part, no category
        let market = get_transaction(&conn, report.transaction_ids[1]).unwrap();
        assert_eq!(market.date, date(2024, 1, 7));
        assert_eq!(market.amount, 235.4);
        assert_eq!(market.kind, TransactionKind::Expense);
        assert_eq!(market.category, None);

        // Date typed as text
        let pharmacy = get_transaction(&conn, report.transaction_ids[2]).unwrap();
        assert_eq!(pharmacy.date, date(2024, 1, 10));
        assert_eq!(pharmacy.amount, 42.1);
    }

    #[test]
    fn test_corrupt_workbook_is_rejected() {
        let conn = open_database(":memory:").unwrap();
        assert!(matches!(
            import_file(&conn, "extrato.xlsx", b"not a zip file", ImportKind::Statement),
            Err(LedgerError::Spreadsheet(_))
        ));
    }

    #[test]
    fn test_missing_required_column() {
        let conn = open_database(":memory:").unwrap();
        let csv = "data,descricao\n05/01/2024,Salary\n";
        let err = import_file(&conn, "x.csv", csv.as_bytes(), ImportKind::Statement).unwrap_err();
        assert_eq!(err.to_string(), "Column 'valor' not found in file");
    }

    #[test]
    fn test_bad_rows_are_skipped() {
        let conn = open_database(":memory:").unwrap();
        let csv = "date,description,amount\n\
            2024-01-01,Good,-10\n\
            not-a-date,Bad date,-10\n\
            2024-01-02,,-10\n\
            2024-01-03,Zero,0\n\
            ,,\n\
            2024-01-04,Also good,25\n";
        let report = import_file(&conn, "x.csv", csv.as_bytes(), ImportKind::Statement).unwrap();

        assert_eq!(report.total_imported, 3);
        let rows: Vec<_> = report.skipped.iter().map(|s| s.row).collect();
        assert_eq!(rows, vec![3, 4]);
        assert!(report.message.contains("2 rows skipped"));

        let zero = get_transaction(&conn, report.transaction_ids[1]).unwrap();
        assert_eq!(zero.description, "Zero");
        assert_eq!(zero.amount, 0.0);
        assert_eq!(zero.kind, TransactionKind::Expense);
    }

    #[test]
    fn test_import_thousands_separators() {
        let conn = open_database(":memory:").unwrap();
        let csv = "data;descricao;valor\n\
            05/01/2024;Aluguel;-1.234,56\n\
            06/01/2024;Bonus;2.500,00\n";
        let report = import_file(&conn, "extrato.csv", csv.as_bytes(), ImportKind::Statement).unwrap();
        assert_eq!(report.total_imported, 2);
        assert!(report.skipped.is_empty());

        let rent = get_transaction(&conn, report.transaction_ids[0]).unwrap();
        assert_eq!(rent.amount, 1234.56);
        assert_eq!(rent.kind, TransactionKind::Expense);

        let bonus = get_transaction(&conn, report.transaction_ids[1]).unwrap();
        assert_eq!(bonus.amount, 2500.0);
        assert_eq!(bonus.kind, TransactionKind::Income);
    }

    #[test]
    fn test_rules_run_after_import() {
        let conn = open_database(":memory:").unwrap();
        insert_rule(
            &conn,
            &NewRule::new("Market", CriterionKind::DescriptionContains, "supermarket", RuleAction::SetCategory)
                .with_action_value("Groceries"),
        )
        .unwrap();

        let report = import_file(&conn, "extrato.csv", STATEMENT.as_bytes(), ImportKind::Statement).unwrap();
        assert_eq!(report.rules_applied, 1);

        let market = get_transaction(&conn, report.transaction_ids[1]).unwrap();
        assert_eq!(market.category.as_deref(), Some("Groceries"));
    }

    #[test]
    fn test_reimport_is_recorded_by_hash() {
        let conn = open_database(":memory:").unwrap();
        let first = import_file(&conn, "a.csv", STATEMENT.as_bytes(), ImportKind::Statement).unwrap();
        let second = import_file(&conn, "b.csv", STATEMENT.as_bytes(), ImportKind::Statement).unwrap();

        assert_eq!(first.file_hash, second.file_hash);
        let events = get_events_for_entity(&conn, "import", &first.file_hash).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let conn = open_database(":memory:").unwrap();
        assert!(matches!(
            import_file(&conn, "statement.pdf", b"whatever", ImportKind::Statement),
            Err(LedgerError::Validation(_))
        ));
    }
}
