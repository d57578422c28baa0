#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Job dispatch for the faunaproc worker host: per-pipeline processors
//! with bounded worker pools, and the dispatcher that drives them.

mod dispatcher;
mod processor;

pub use dispatcher::{Dispatcher, ShutdownSignal};
