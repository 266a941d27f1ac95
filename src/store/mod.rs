//! Persistence layer: libSQL-backed opportunity, submission, quota, and run stores.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    BacklogQuery, OpportunityStore, OutcomeStatus, PilotStore, QuotaStore, RunLog, RunOutcome,
    RunRecord, SubmissionRecord, SubmissionStore,
};
