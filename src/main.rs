// Pocket Ledger - operator CLI
// Import statements, run rules and print summaries without the HTTP server

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pocket_ledger::{
    apply_all_rules, import_file, list_categories, monthly_summary, open_database, ImportKind,
    ImportReport, MonthlySummary, SummaryQuery, TransactionFilter,
};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

const ACTOR: &str = "cli";

#[derive(Parser)]
#[command(name = "pocket-ledger", about = "Personal-finance ledger: import statements, apply rules, summarize months.")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "LEDGER_DATABASE", default_value = "ledger.db")]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema.
    Init,
    /// Import a CSV/XLSX bank statement or credit-card invoice.
    Import {
        /// Path to CSV or XLSX file to import
        file: PathBuf,
        /// Treat the file as a credit-card invoice
        #[arg(long)]
        invoice: bool,
    },
    /// Re-run every active rule over all transactions.
    ApplyRules,
    /// List the distinct categories in use.
    Categories,
    /// Income and expenses per category for one month.
    Summary {
        #[arg(long)]
        month: u32,
        #[arg(long)]
        year: i32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let conn = open_database(&cli.database)
        .with_context(|| format!("Failed to open database {}", cli.database))?;

    match cli.command {
        Commands::Init => {
            println!("✓ Database ready: {}", cli.database);
        }
        Commands::Import { file, invoice } => {
            let kind = if invoice { ImportKind::Invoice } else { ImportKind::Statement };
            let report = run_import(&conn, &file, kind)?;
            print_import(&report);
        }
        Commands::ApplyRules => {
            let batch = apply_all_rules(&conn, &TransactionFilter::default(), ACTOR)?;
            println!(
                "✓ Processed {} transactions, {} modified ({} rule applications)",
                batch.processed, batch.modified, batch.rules_applied
            );
        }
        Commands::Categories => {
            for category in list_categories(&conn)? {
                println!("{}", category);
            }
        }
        Commands::Summary { month, year } => {
            let summary = monthly_summary(&conn, &SummaryQuery::for_month(month, year))?;
            print_summary(&summary);
        }
    }

    Ok(())
}

fn run_import(conn: &Connection, path: &Path, kind: ImportKind) -> Result<ImportReport> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid file name: {}", path.display()))?;

    let report = import_file(conn, file_name, &bytes, kind)?;
    Ok(report)
}

fn print_import(report: &ImportReport) {
    println!("📂 {}", report.message);
    for skipped in &report.skipped {
        println!("   ⚠️  row {}: {}", skipped.row, skipped.reason);
    }
    if report.rules_applied > 0 {
        println!("   🏷️  {} rule applications", report.rules_applied);
    }
}

fn print_summary(summary: &MonthlySummary) {
    println!("📊 {} → {} ({})", summary.start, summary.end, summary.date_basis.as_str());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Income:   {:>12.2}", summary.total_income);
    for (category, total) in &summary.income_by_category {
        println!("  {:<24} {:>12.2}", category, total);
    }
    println!("Expenses: {:>12.2}", summary.total_expense);
    for (category, total) in &summary.expense_by_category {
        println!("  {:<24} {:>12.2}", category, total);
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Balance:  {:>12.2}", summary.balance);
}
