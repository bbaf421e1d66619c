//! `group by`: partitions upstream rounds by their atomized keys, in order
//! of first occurrence. Non-grouping values are concatenated per group.

use std::collections::HashMap;

use flwor_core::clause::GroupBy;
use flwor_core::error::Result;
use flwor_core::types::{GroupKey, Value};

use crate::context::QueryContext;
use crate::eval::Eval;
use crate::interp;

struct Group {
    keys: Vec<Value>,
    post: Vec<Value>,
}

pub(crate) struct GroupByEval<'a> {
    up: Box<dyn Eval + 'a>,
    clause: &'a GroupBy,
    groups: Option<std::vec::IntoIter<Group>>,
}

impl<'a> GroupByEval<'a> {
    pub(crate) fn new(up: Box<dyn Eval + 'a>, clause: &'a GroupBy) -> Self {
        Self {
            up,
            clause,
            groups: None,
        }
    }

    fn materialize(&mut self, qc: &mut QueryContext) -> Result<Vec<Group>> {
        let mut groups: Vec<Group> = Vec::new();
        let mut index: HashMap<Vec<GroupKey>, usize> = HashMap::new();
        while self.up.next(qc)? {
            let mut hashed = Vec::with_capacity(self.clause.specs.len());
            let mut keys = Vec::with_capacity(self.clause.specs.len());
            for spec in &self.clause.specs {
                let atoms = Value(interp::value(&spec.expr, qc)?.atomize());
                hashed.push(GroupKey::of(&atoms)?);
                keys.push(atoms);
            }
            let pre = self
                .clause
                .pre
                .iter()
                .map(|e| interp::value(e, qc))
                .collect::<Result<Vec<_>>>()?;
            match index.get(&hashed) {
                Some(&i) => {
                    for (acc, v) in groups[i].post.iter_mut().zip(pre) {
                        acc.extend(v);
                    }
                }
                None => {
                    index.insert(hashed, groups.len());
                    groups.push(Group { keys, post: pre });
                }
            }
        }
        Ok(groups)
    }
}

impl Eval for GroupByEval<'_> {
    fn next(&mut self, qc: &mut QueryContext) -> Result<bool> {
        if self.groups.is_none() {
            let groups = self.materialize(qc)?;
            self.groups = Some(groups.into_iter());
        }
        let Some(group) = self.groups.as_mut().and_then(Iterator::next) else {
            return Ok(false);
        };
        for (spec, key) in self.clause.specs.iter().zip(group.keys) {
            qc.bind(spec.var, key);
        }
        for (var, val) in self.clause.post.iter().zip(group.post) {
            qc.bind(*var, val);
        }
        Ok(true)
    }
}
