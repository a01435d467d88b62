//! # hearth-common
//!
//! Shared plumbing for hearth worker processes. Currently this is just the
//! configuration layer; workers (the federation sender, the sync worker, …)
//! all load the same `AppConfig` shape and pick out the sections they need.

pub mod config;
