//! # Execution Service
//!
//! The trade-plane integrity layer: consumes approved intents from
//! `risk.order.approved.v1`, drives the submission state machine against a
//! broker adapter, and emits the `trade.*` lifecycle plus the
//! `execution.order.*` result streams through a transactional outbox.
//!
//! Execution is purely mechanical. It sends what risk approved, records
//! what the broker answered, and reconciles ambiguity; no risk logic lives
//! here.

pub mod broker;
pub mod config;
pub mod contracts;
pub mod domain;
pub mod outbox;
pub mod pg_store;
pub mod reconcile;
pub mod store;
pub mod submission;

pub use broker::{BrokerAdapter, BrokerError, DryRunBroker};
pub use config::Config;
pub use contracts::{OrderSpec, RiskOrderDecisionV1, Side};
pub use domain::{Fill, InboxRecord, Intent, IntentState, Order, OutboxRecord};
pub use outbox::OutboxRelay;
pub use pg_store::PgStore;
pub use reconcile::Reconciler;
pub use store::{CommitOutcome, MemStore, StoreError, SubmissionStore, Transition};
pub use submission::{
    run_submission_worker, ApprovalHandler, IngestOutcome, SubmissionError, SubmissionMachine,
};
