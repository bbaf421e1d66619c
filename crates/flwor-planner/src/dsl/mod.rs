//! Query documents: a YAML rendering of the expression tree with named,
//! lexically scoped variables.

pub mod yaml;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DslError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown variable ${0}")]
    UnknownVariable(String),

    #[error("unknown function {0}()")]
    UnknownFunction(String),

    #[error("wrong number of arguments for {name}(): {got}")]
    Arity { name: String, got: usize },

    #[error("invalid type: {0}")]
    Type(String),

    #[error("invalid query: {0}")]
    Invalid(String),
}
