//! Orchestration Core - Fault-Tolerant Datastore Access
//! Circuit breakers, retries, fallbacks and saga transactions

pub mod config;
pub mod observability;
pub mod resilience;
pub mod transaction;
