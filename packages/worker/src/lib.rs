//! # Job worker core
//!
//! Durable, Postgres-backed job queue driving an ETL pipeline
//! (fetch → parse → chunk → embed → upsert), with:
//!
//! - **Exactly-once dispatch**: atomic claims via `FOR UPDATE SKIP LOCKED`
//! - **Lease-based recovery**: heartbeats extend a lease; a sweeper
//!   requeues or fails jobs whose lease expired past a grace period
//! - **Cooperative cancellation**: cancel is an authoritative database
//!   write that running jobs observe at pipeline checkpoints
//!
//! The worker binary (`src/worker/main.rs`) wires [`Config`] to a
//! [`jobs::JobWorker`]; a REST façade or CLI drives [`jobs::JobAdmin`].

pub mod config;
pub mod jobs;

pub use config::{Config, EmbeddingsProvider};
