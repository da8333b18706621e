// Pocket Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod importer;
pub mod rules;
pub mod summary;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use db::{
    Event,
    open_database, setup_database,
    insert_transaction, get_transaction, list_transactions, patch_transaction,
    delete_transaction, restore_original_amount, list_categories,
    insert_event, get_events_for_entity,
};
pub use entities::{
    CriterionKind, DateBasis, NewRule, NewTag, NewTransaction, Rule, RuleAction, RulePatch,
    Setting, Tag, TagPatch, Transaction, TransactionFilter, TransactionKind, TransactionPatch,
};
pub use error::{LedgerError, Result};
pub use importer::{import_file, ImportKind, ImportReport, SkippedRow};
pub use rules::{
    RuleEngine, RuleOutcome, RuleApplication, BatchApplication,
    apply_all_rules, apply_rule_to_all, apply_rule_to_transaction, apply_rules_to_transaction,
};
pub use summary::{monthly_summary, MonthlySummary, SummaryQuery};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
