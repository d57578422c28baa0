#![forbid(unsafe_code)]

//! Shared building blocks for the faunaproc worker host: the recording
//! service data model, configuration, the authenticated API client and the
//! classifier subprocess runner.

pub mod api;
pub mod command;
pub mod config;
pub mod types;
