// Entity Models
//
// Each entity owns its validation and its SQLite persistence functions.
// Transactions are stored through `crate::db`, which also owns the schema.

pub mod rule;
pub mod setting;
pub mod tag;
pub mod transaction;

pub use rule::{CriterionKind, NewRule, Rule, RuleAction, RulePatch};
pub use setting::{DateBasis, Setting};
pub use tag::{NewTag, Tag, TagPatch};
pub use transaction::{NewTransaction, Transaction, TransactionFilter, TransactionKind, TransactionPatch};
