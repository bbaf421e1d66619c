//! YAML → `Expr` loader.
//!
//! Example:
//! ```yaml
//! config: { optimize: true }
//! query:
//!   flwor:
//!     clauses:
//!       - for: { var: x, in: { range: [1, 5] } }
//!       - let: { var: y, value: { mul: ["$x", 2] } }
//!       - where: { gt: ["$y", 4] }
//!       - order_by: [ { key: "$y", descending: true } ]
//!     return: ["$x", "$y"]
//! ```
//!
//! Scalars are literals, except strings starting with `$` (variable
//! references) and `.` (the context item); `{str: ...}` forces a string.
//! Lists are sequences.

use serde::{Deserialize, Serialize};

use flwor_core::clause::{
    Clause, Count, Flwor, For, GroupBy, GroupSpec, Let, OrderBy, OrderKey, Where, Window,
    WindowCond,
};
use flwor_core::config::EngineConfig;
use flwor_core::expr::{Axis, Expr, Step};
use flwor_core::func::Func;
use flwor_core::id::VarId;
use flwor_core::seqtype::SeqType;
use flwor_core::types::{ArithOp, CmpOp, Item, Value};
use flwor_core::var::VarScope;

use super::DslError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDoc {
    #[serde(default)]
    pub config: Option<EngineConfig>,
    pub query: ExprDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExprDoc {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Seq(Vec<ExprDoc>),
    Node(Box<NodeDoc>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDoc {
    Str(String),
    Var(String),
    Range(ExprDoc, ExprDoc),
    Seq(Vec<ExprDoc>),
    And(Vec<ExprDoc>),
    Or(Vec<ExprDoc>),
    Eq(ExprDoc, ExprDoc),
    Ne(ExprDoc, ExprDoc),
    Lt(ExprDoc, ExprDoc),
    Le(ExprDoc, ExprDoc),
    Gt(ExprDoc, ExprDoc),
    Ge(ExprDoc, ExprDoc),
    Add(ExprDoc, ExprDoc),
    Sub(ExprDoc, ExprDoc),
    Mul(ExprDoc, ExprDoc),
    Div(ExprDoc, ExprDoc),
    Idiv(ExprDoc, ExprDoc),
    Mod(ExprDoc, ExprDoc),
    If(IfDoc),
    Call(CallDoc),
    Element(ElementDoc),
    Filter(FilterDoc),
    Path(PathDoc),
    Treat(TreatDoc),
    Flwor(FlworDoc),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfDoc {
    pub cond: ExprDoc,
    pub then: ExprDoc,
    #[serde(rename = "else", default = "empty_doc")]
    pub els: ExprDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDoc {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ExprDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDoc {
    pub name: String,
    #[serde(default = "empty_doc")]
    pub content: ExprDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDoc {
    pub base: ExprDoc,
    pub preds: Vec<ExprDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathDoc {
    pub root: ExprDoc,
    pub steps: Vec<StepDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDoc {
    #[serde(default = "child_axis")]
    pub axis: Axis,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preds: Vec<ExprDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatDoc {
    pub expr: ExprDoc,
    #[serde(rename = "as")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlworDoc {
    pub clauses: Vec<ClauseDoc>,
    #[serde(rename = "return")]
    pub ret: ExprDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseDoc {
    For(ForDoc),
    Let(LetDoc),
    Where(ExprDoc),
    Count(String),
    OrderBy(Vec<OrderKeyDoc>),
    GroupBy(Vec<GroupKeyDoc>),
    Window(WindowDoc),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForDoc {
    pub var: String,
    #[serde(default)]
    pub at: Option<String>,
    #[serde(default)]
    pub score: Option<String>,
    #[serde(rename = "in")]
    pub source: ExprDoc,
    #[serde(default)]
    pub allowing_empty: bool,
    #[serde(rename = "as", default)]
    pub ty: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LetDoc {
    pub var: String,
    pub value: ExprDoc,
    #[serde(rename = "as", default)]
    pub ty: Option<String>,
    #[serde(default)]
    pub score: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderKeyDoc {
    pub key: ExprDoc,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub empty_greatest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyDoc {
    pub var: String,
    /// Defaults to the variable of the same name in scope.
    #[serde(default)]
    pub key: Option<ExprDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowDoc {
    #[serde(default)]
    pub sliding: bool,
    pub var: String,
    #[serde(rename = "in")]
    pub source: ExprDoc,
    pub start: CondDoc,
    #[serde(default)]
    pub end: Option<CondDoc>,
    #[serde(default)]
    pub only_end: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondDoc {
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub at: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    pub when: ExprDoc,
}

fn empty_doc() -> ExprDoc {
    ExprDoc::Seq(Vec::new())
}

fn child_axis() -> Axis {
    Axis::Child
}

/// A resolved query: the expression tree, the arena its variables live in
/// and the document's config section, if any.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub expr: Expr,
    pub scope: VarScope,
    pub config: Option<EngineConfig>,
}

pub fn parse_yaml_query(yaml_src: &str) -> Result<ParsedQuery, DslError> {
    let doc: QueryDoc = serde_yaml::from_str(yaml_src)?;
    doc.resolve()
}

impl QueryDoc {
    pub fn resolve(self) -> Result<ParsedQuery, DslError> {
        let mut scope = VarScope::new();
        let expr = Resolver {
            scope: &mut scope,
            names: Vec::new(),
        }
        .expr(self.query)?;
        Ok(ParsedQuery {
            expr,
            scope,
            config: self.config,
        })
    }
}

/// Maps names to ids; `names` is the lexical stack of visible bindings.
struct Resolver<'s> {
    scope: &'s mut VarScope,
    names: Vec<(String, VarId)>,
}

impl Resolver<'_> {
    fn lookup(&self, name: &str) -> Result<VarId, DslError> {
        let name = name.strip_prefix('$').unwrap_or(name);
        self.names
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
            .ok_or_else(|| DslError::UnknownVariable(name.to_string()))
    }

    fn bind(&mut self, name: &str, ty: Option<&str>) -> Result<VarId, DslError> {
        let name = name.strip_prefix('$').unwrap_or(name).to_string();
        if name.is_empty() {
            return Err(DslError::Invalid("empty variable name".into()));
        }
        let id = match ty {
            Some(ty) => {
                let declared: SeqType = ty.parse().map_err(|e| DslError::Type(format!("{}", e)))?;
                self.scope.declare_typed(name.clone(), declared, true)
            }
            None => self.scope.declare(name.clone()),
        };
        self.names.push((name, id));
        Ok(id)
    }

    fn bind_opt(&mut self, name: Option<&str>) -> Result<Option<VarId>, DslError> {
        name.map(|n| self.bind(n, None)).transpose()
    }

    fn expr(&mut self, doc: ExprDoc) -> Result<Expr, DslError> {
        Ok(match doc {
            ExprDoc::Bool(b) => Expr::bool(b),
            ExprDoc::Int(i) => Expr::int(i),
            ExprDoc::Double(d) => Expr::Value(Value::single(Item::Double(d))),
            ExprDoc::Text(s) if s == "." => Expr::ContextItem,
            ExprDoc::Text(s) if s.starts_with('$') => Expr::var(self.lookup(&s)?),
            ExprDoc::Text(s) => Expr::str(s),
            ExprDoc::Seq(items) => Expr::Seq(self.exprs(items)?),
            ExprDoc::Node(node) => self.node(*node)?,
        })
    }

    fn exprs(&mut self, docs: Vec<ExprDoc>) -> Result<Vec<Expr>, DslError> {
        docs.into_iter().map(|d| self.expr(d)).collect()
    }

    fn pair(&mut self, a: ExprDoc, b: ExprDoc) -> Result<(Expr, Expr), DslError> {
        Ok((self.expr(a)?, self.expr(b)?))
    }

    fn cmp(&mut self, op: CmpOp, a: ExprDoc, b: ExprDoc) -> Result<Expr, DslError> {
        let (l, r) = self.pair(a, b)?;
        Ok(Expr::cmp(op, l, r))
    }

    fn arith(&mut self, op: ArithOp, a: ExprDoc, b: ExprDoc) -> Result<Expr, DslError> {
        let (l, r) = self.pair(a, b)?;
        Ok(Expr::arith(op, l, r))
    }

    fn node(&mut self, doc: NodeDoc) -> Result<Expr, DslError> {
        Ok(match doc {
            NodeDoc::Str(s) => Expr::str(s),
            NodeDoc::Var(name) => Expr::var(self.lookup(&name)?),
            NodeDoc::Range(a, b) => {
                let (l, r) = self.pair(a, b)?;
                Expr::range(l, r)
            }
            NodeDoc::Seq(items) => Expr::Seq(self.exprs(items)?),
            NodeDoc::And(items) => Expr::And(self.exprs(items)?),
            NodeDoc::Or(items) => Expr::Or(self.exprs(items)?),
            NodeDoc::Eq(a, b) => self.cmp(CmpOp::Eq, a, b)?,
            NodeDoc::Ne(a, b) => self.cmp(CmpOp::Ne, a, b)?,
            NodeDoc::Lt(a, b) => self.cmp(CmpOp::Lt, a, b)?,
            NodeDoc::Le(a, b) => self.cmp(CmpOp::Le, a, b)?,
            NodeDoc::Gt(a, b) => self.cmp(CmpOp::Gt, a, b)?,
            NodeDoc::Ge(a, b) => self.cmp(CmpOp::Ge, a, b)?,
            NodeDoc::Add(a, b) => self.arith(ArithOp::Add, a, b)?,
            NodeDoc::Sub(a, b) => self.arith(ArithOp::Sub, a, b)?,
            NodeDoc::Mul(a, b) => self.arith(ArithOp::Mul, a, b)?,
            NodeDoc::Div(a, b) => self.arith(ArithOp::Div, a, b)?,
            NodeDoc::Idiv(a, b) => self.arith(ArithOp::IDiv, a, b)?,
            NodeDoc::Mod(a, b) => self.arith(ArithOp::Mod, a, b)?,
            NodeDoc::If(d) => {
                let cond = self.expr(d.cond)?;
                let (then, els) = self.pair(d.then, d.els)?;
                Expr::iff(cond, then, els)
            }
            NodeDoc::Call(d) => {
                // `fail()` is shorthand for `error()`
                let func = match d.name.as_str() {
                    "fail" | "fn:fail" => Func::Error,
                    name => Func::from_name(name)
                        .ok_or_else(|| DslError::UnknownFunction(d.name.clone()))?,
                };
                let (min, max) = func.arity();
                if d.args.len() < min || d.args.len() > max {
                    return Err(DslError::Arity {
                        name: d.name,
                        got: d.args.len(),
                    });
                }
                Expr::call(func, self.exprs(d.args)?)
            }
            NodeDoc::Element(d) => Expr::Element {
                name: d.name,
                content: Box::new(self.expr(d.content)?),
            },
            NodeDoc::Filter(d) => Expr::Filter {
                base: Box::new(self.expr(d.base)?),
                preds: self.exprs(d.preds)?,
            },
            NodeDoc::Path(d) => {
                let root = self.expr(d.root)?;
                let mut steps = Vec::with_capacity(d.steps.len());
                for s in d.steps {
                    let mut step = Step::new(s.axis, s.name.as_deref());
                    step.preds = self.exprs(s.preds)?;
                    steps.push(step);
                }
                Expr::Path {
                    root: Box::new(root),
                    steps,
                }
            }
            NodeDoc::Treat(d) => {
                let ty: SeqType = d.ty.parse().map_err(|e| DslError::Type(format!("{}", e)))?;
                Expr::type_check(self.expr(d.expr)?, ty)
            }
            NodeDoc::Flwor(d) => self.flwor(d)?,
        })
    }

    fn flwor(&mut self, doc: FlworDoc) -> Result<Expr, DslError> {
        if doc.clauses.is_empty() {
            return Err(DslError::Invalid("flwor without clauses".into()));
        }
        let mark = self.names.len();
        let mut clauses = Vec::with_capacity(doc.clauses.len());
        for c in doc.clauses {
            let clause = self.clause(c, mark)?;
            clauses.push(clause);
        }
        let ret = self.expr(doc.ret)?;
        self.names.truncate(mark);
        Ok(Expr::from(Flwor::new(clauses, ret)))
    }

    /// Ids bound since `mark` that are still visible.
    fn visible_since(&self, mark: usize) -> Vec<(String, VarId)> {
        self.names[mark..]
            .iter()
            .enumerate()
            .filter(|(i, (name, _))| !self.names[mark + i + 1..].iter().any(|(n, _)| n == name))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    fn clause(&mut self, doc: ClauseDoc, mark: usize) -> Result<Clause, DslError> {
        Ok(match doc {
            ClauseDoc::For(d) => {
                let expr = self.expr(d.source)?;
                let var = self.bind(&d.var, d.ty.as_deref())?;
                let pos = self.bind_opt(d.at.as_deref())?;
                let score = self.bind_opt(d.score.as_deref())?;
                Clause::For(For {
                    var,
                    pos,
                    score,
                    expr,
                    allow_empty: d.allowing_empty,
                })
            }
            ClauseDoc::Let(d) => {
                let expr = self.expr(d.value)?;
                let var = self.bind(&d.var, d.ty.as_deref())?;
                Clause::Let(Let {
                    var,
                    expr,
                    score: d.score,
                })
            }
            ClauseDoc::Where(pred) => Clause::Where(Where {
                pred: self.expr(pred)?,
            }),
            ClauseDoc::Count(name) => Clause::Count(Count {
                var: self.bind(&name, None)?,
            }),
            ClauseDoc::OrderBy(keys) => {
                let mut out = Vec::with_capacity(keys.len());
                for k in keys {
                    out.push(OrderKey {
                        expr: self.expr(k.key)?,
                        descending: k.descending,
                        empty_least: !k.empty_greatest,
                    });
                }
                let refs = self.names[mark..].iter().map(|(_, id)| *id).collect();
                Clause::OrderBy(OrderBy { keys: out, refs })
            }
            ClauseDoc::GroupBy(keys) => {
                let mut exprs = Vec::with_capacity(keys.len());
                let mut grouping = Vec::with_capacity(keys.len());
                for k in keys {
                    let name = k.var.strip_prefix('$').unwrap_or(&k.var).to_string();
                    let expr = match k.key {
                        Some(doc) => self.expr(doc)?,
                        None => Expr::var(self.lookup(&name)?),
                    };
                    exprs.push(expr);
                    grouping.push(name);
                }
                let carried: Vec<(String, VarId)> = self
                    .visible_since(mark)
                    .into_iter()
                    .filter(|(name, _)| !grouping.contains(name))
                    .collect();
                let mut specs = Vec::with_capacity(grouping.len());
                for (name, expr) in grouping.iter().zip(exprs) {
                    specs.push(GroupSpec {
                        var: self.bind(name, None)?,
                        expr,
                    });
                }
                let mut pre = Vec::with_capacity(carried.len());
                let mut post = Vec::with_capacity(carried.len());
                for (name, old) in carried {
                    pre.push(Expr::var(old));
                    post.push(self.bind(&name, None)?);
                }
                Clause::GroupBy(GroupBy { specs, pre, post })
            }
            ClauseDoc::Window(d) => {
                let expr = self.expr(d.source)?;
                let start = self.cond(d.start)?;
                let end = d.end.map(|c| self.cond(c)).transpose()?;
                if d.only_end && end.is_none() {
                    return Err(DslError::Invalid("only_end needs an end condition".into()));
                }
                if d.sliding && end.is_none() {
                    return Err(DslError::Invalid("sliding windows need an end condition".into()));
                }
                let var = self.bind(&d.var, None)?;
                Clause::Window(Window {
                    sliding: d.sliding,
                    var,
                    expr,
                    start,
                    end,
                    only_end: d.only_end,
                })
            }
        })
    }

    fn cond(&mut self, doc: CondDoc) -> Result<WindowCond, DslError> {
        let item = self.bind_opt(doc.item.as_deref())?;
        let pos = self.bind_opt(doc.at.as_deref())?;
        let prev = self.bind_opt(doc.previous.as_deref())?;
        let next = self.bind_opt(doc.next.as_deref())?;
        Ok(WindowCond {
            item,
            pos,
            prev,
            next,
            expr: self.expr(doc.when)?,
        })
    }
}
