//! Domain layer shared by the HTTP surface, the sweep worker and storage.
//!
//! Everything in this crate is pure: no I/O, no clock reads. Callers pass
//! the current time in through [`types::OperationContext`] or explicit
//! arguments.
pub mod expiry;
pub mod format;
pub mod policy;
pub mod types;

pub use expiry::{compute_expiry, parse_interval_days, ExpiryCalculator};
pub use format::DateFormat;
pub use policy::{
    Audience, NotificationPolicy, PlannedDelivery, PolicyAction, PolicyOutcome, ReminderCooldown,
    SendHistory,
};
