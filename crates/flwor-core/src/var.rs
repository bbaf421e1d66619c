//! Per-query variable arena.
//!
//! Clauses own variable *declarations* by id; every expression refers to a
//! variable by its `VarId`. The arena is the only place variable metadata
//! lives, so there is no aliasing between copies of a clause.

use serde::{Deserialize, Serialize};

use crate::id::VarId;
use crate::seqtype::SeqType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Var {
    pub id: VarId,
    pub name: String,
    /// Declared type (`as ...`), or `item()*` when none was given.
    pub declared: SeqType,
    /// Runtime type-check obligation for bound values.
    pub checks: bool,
    /// Type derived from the bound expression during compilation.
    #[serde(default)]
    pub inferred: Option<SeqType>,
}

impl Var {
    pub fn checks_type(&self) -> bool {
        self.checks
    }

    pub fn seq_type(&self) -> SeqType {
        match self.inferred {
            Some(t) if !self.checks || t.is_sub_type_of(&self.declared) => t,
            _ => self.declared,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarScope {
    vars: Vec<Var>,
}

impl VarScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an untyped variable.
    pub fn declare(&mut self, name: impl Into<String>) -> VarId {
        self.declare_typed(name, SeqType::ITEM_ZM, false)
    }

    pub fn declare_typed(&mut self, name: impl Into<String>, declared: SeqType, checks: bool) -> VarId {
        let id = VarId::new(self.vars.len() as u32);
        self.vars.push(Var {
            id,
            name: name.into(),
            declared,
            checks,
            inferred: None,
        });
        id
    }

    /// Fresh variable with the same name and type as `id`.
    pub fn duplicate(&mut self, id: VarId) -> VarId {
        let var = self.get(id).clone();
        let new_id = VarId::new(self.vars.len() as u32);
        self.vars.push(Var { id: new_id, ..var });
        new_id
    }

    pub fn get(&self, id: VarId) -> &Var {
        &self.vars[id.index()]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id.index()]
    }

    pub fn checks_type(&self, id: VarId) -> bool {
        self.get(id).checks
    }

    pub fn name(&self, id: VarId) -> &str {
        &self.get(id).name
    }

    pub fn refine(&mut self, id: VarId, inferred: SeqType) {
        self.get_mut(id).inferred = Some(inferred);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Var> {
        self.vars.iter()
    }
}
