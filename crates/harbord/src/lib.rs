//! harbord - pgharbor control-plane daemon
//!
//! Provisions, heals, protects, and destroys multi-node PostgreSQL HA
//! clusters on ephemeral cloud VMs. Library interface for the orchestration
//! and data-protection engines; the binary wires them to a worker pool and
//! periodic timers.

pub mod backup;
pub mod cloud;
pub mod dns;
pub mod leader;
pub mod outbox;
pub mod provision;
pub mod remote;
pub mod store;
pub mod trust;
