//! Mail Aggregator: schedules mailbox polls across tenants with exclusive
//! locking, admission control and crash recovery.

pub mod admission;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod journal;
pub mod launcher;
pub mod lock_store;
pub mod mailbox;
pub mod notify;
pub mod scheduler;
pub mod store;
pub mod watchdog;
pub mod worker;

#[cfg(test)]
mod test_support;
