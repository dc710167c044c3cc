//! Multi-phase LLM translation pipeline orchestrator.
//!
//! A project's dialogue script flows through ingest, context annotation,
//! pretranslation glossary building, translation, QA, editing, and export.
//! Each phase fans chunks of work out to an external agent backend under a
//! bounded concurrency limit, validates the returned batch against the
//! requested one, and persists immutable artifacts with monotonic revisions
//! so downstream staleness is always computable.

pub mod agent;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod phase;
pub mod revision;
pub mod store;
