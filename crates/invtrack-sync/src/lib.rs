//! Reconciliation of per-exchange inventory feeds into one dashboard row per
//! data date, plus the append-only detail log each exchange keeps.

pub mod dedup;
pub mod derive;
pub mod engine;
pub mod layout;
pub mod pipeline;
pub mod row;
pub mod weekly;

pub use dedup::{append_if_new, change_from_log, ensure_log_header, is_duplicate, LogOutcome};
pub use engine::{RecomputeSummary, SummaryEngine, UpsertAction, UpsertError, UpsertOutcome};
pub use layout::{DashboardLayout, LayoutError, RatioSlot, SourceSlots};
pub use pipeline::{run_feed_from_env, FeedRunSummary, FeedRunner, SyncConfig};
pub use row::SummaryRow;

pub const CRATE_NAME: &str = "invtrack-sync";
