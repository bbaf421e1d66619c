//! Convenient re-exports for downstream crates.

pub use crate::clause::{
    Clause, Count, For, GroupBy, GroupSpec, Let, OrderBy, OrderKey, Where, Window, WindowCond,
    Flwor,
};
pub use crate::config::EngineConfig;
pub use crate::display::Plan;
pub use crate::error::{Error, Result};
pub use crate::expr::{Axis, Expr, Flag, Step};
pub use crate::func::Func;
pub use crate::id::{NodeId, VarId};
pub use crate::seqtype::{ItemType, Occ, SeqType};
pub use crate::size::SizeBounds;
pub use crate::types::{ArithOp, CmpOp, Item, Node, Value};
pub use crate::usage::VarUsage;
pub use crate::var::{Var, VarScope};
