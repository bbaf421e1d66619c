#![forbid(unsafe_code)]
//! flwor-exec: interpreter, FLWOR evaluator chain and runtime engine.
//!
//! Evaluation is single-threaded and pull-based: the caller pulls items
//! from an `ItemStream`, which pulls the FLWOR's return iterator, which
//! advances the clause chain one round at a time. `order by`, `group by`
//! and windows materialize their input; everything else streams.

pub mod context;
pub mod eval;
mod group;
pub mod interp;
pub mod metrics;
mod order;
pub mod runtime;
mod window;

pub use context::{CancelHandle, PendingUpdate, QueryContext};
pub use runtime::{Engine, ExecError, ItemStream, Prepared};
