// Tutor Jobs - asynchronous job dispatch and status polling
//
// This crate accepts tutor work (chat answers, pre-flight checks, lesson
// plans, content backfill) over HTTP, queues it durably with deterministic
// ids, runs it on per-queue worker pools and serves status to polling clients.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
