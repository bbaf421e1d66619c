//! Variable usage counting: the {never, once, many} semiring.

use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::id::VarId;
use crate::var::VarScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarUsage {
    Never,
    Once,
    Many,
}

impl VarUsage {
    /// Uses in sequence.
    pub fn plus(self, other: VarUsage) -> VarUsage {
        match (self, other) {
            (VarUsage::Never, u) | (u, VarUsage::Never) => u,
            _ => VarUsage::Many,
        }
    }

    /// Uses repeated `count` times; `None` is an unbounded repetition.
    pub fn times(self, count: Option<u64>) -> VarUsage {
        match (self, count) {
            (VarUsage::Never, _) | (_, Some(0)) => VarUsage::Never,
            (u, Some(1)) => u,
            _ => VarUsage::Many,
        }
    }

    /// Alternatives (only one branch runs).
    pub fn max(self, other: VarUsage) -> VarUsage {
        std::cmp::max(self, other)
    }

    pub fn sum<'a>(
        var: VarId,
        exprs: impl IntoIterator<Item = &'a Expr>,
        scope: &VarScope,
    ) -> VarUsage {
        exprs
            .into_iter()
            .fold(VarUsage::Never, |acc, e| acc.plus(e.count(var, scope)))
    }
}

#[cfg(test)]
mod tests {
    use super::VarUsage::*;

    #[test]
    fn semiring_laws() {
        assert_eq!(Never.plus(Once), Once);
        assert_eq!(Once.plus(Once), Many);
        assert_eq!(Once.times(Some(1)), Once);
        assert_eq!(Once.times(Some(0)), Never);
        assert_eq!(Once.times(Some(3)), Many);
        assert_eq!(Once.times(None), Many);
        assert_eq!(Never.times(None), Never);
        assert_eq!(Once.max(Many), Many);
    }
}
