//! Cadence - recurring publication queue
//!
//! Books content onto per-account weekly slots and publishes it through
//! platform adapters when the slots come due.

pub mod allocator;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod instant;
mod locks;
pub mod logging;
pub mod orchestrator;
pub mod platforms;
pub mod recurrence;
pub mod runner;
pub mod service;
pub mod slots;
pub mod types;
pub mod vault;

// Re-export commonly used types
pub use allocator::{Allocator, ScheduleMode, ScheduleReport};
pub use broker::TokenBroker;
pub use config::Config;
pub use db::Database;
pub use error::{CadenceError, PublishError, Result, ScheduleError};
pub use orchestrator::{Attempt, Orchestrator, RunOutcome};
pub use runner::{JobQueue, JobRunner};
pub use service::CadenceService;
pub use types::{
    Account, AccountStatus, ContentItem, ContentStatus, Payload, PayloadOverride, QueueSlot,
    RecurrenceRule, SlotStatus, SlotTime,
};
