#![forbid(unsafe_code)]
//! flwor-core: shared types for the FLWOR optimizer and evaluator.
//!
//! - ids, errors, configuration and plan fingerprints
//! - a small item/value model with sequence types
//! - the variable arena, expression tree and FLWOR clauses
//! - static analysis: effect flags, usage counts, cardinality bounds

pub mod clause;
pub mod config;
pub mod display;
pub mod error;
pub mod expr;
pub mod func;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod seqtype;
pub mod size;
pub mod types;
pub mod usage;
pub mod var;

pub use error::{Error, Result};
