//! Minimal item/value model shared by the planner (constant folding) and the
//! evaluator. Only what the FLWOR core needs: atomic items, a small element
//! node, effective boolean value, atomization, comparison and arithmetic.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Item {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Node(Node),
}

/// Constructed element node. Identity is the id assigned at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    /// Concatenated text of this node and its descendants, in document order.
    pub fn string_value(&self) -> String {
        let mut out = self.text.clone();
        for c in &self.children {
            out.push_str(&c.string_value());
        }
        out
    }

    /// Descendants in document order (excluding self).
    pub fn descendants(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        for c in &self.children {
            out.push(c);
            out.extend(c.descendants());
        }
        out
    }
}

impl Item {
    pub fn is_node(&self) -> bool {
        matches!(self, Item::Node(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Item::Int(_) | Item::Double(_))
    }

    /// Atomized form: nodes become their string value.
    pub fn atomize(&self) -> Item {
        match self {
            Item::Node(n) => Item::Str(n.string_value()),
            other => other.clone(),
        }
    }

    /// Lexical form used by string functions.
    pub fn string_value(&self) -> String {
        match self {
            Item::Bool(b) => b.to_string(),
            Item::Int(i) => i.to_string(),
            Item::Double(d) => d.to_string(),
            Item::Str(s) => s.clone(),
            Item::Node(n) => n.string_value(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Item::Int(i) => Some(*i as f64),
            Item::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Item::Bool(_) => "xs:boolean",
            Item::Int(_) => "xs:integer",
            Item::Double(_) => "xs:double",
            Item::Str(_) => "xs:string",
            Item::Node(_) => "element()",
        }
    }
}

/// An ordered item sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(pub Vec<Item>);

impl Value {
    pub fn empty() -> Self {
        Value(Vec::new())
    }

    pub fn single(item: Item) -> Self {
        Value(vec![item])
    }

    pub fn bool(b: bool) -> Self {
        Value::single(Item::Bool(b))
    }

    pub fn int(i: i64) -> Self {
        Value::single(Item::Int(i))
    }

    pub fn ints(values: impl IntoIterator<Item = i64>) -> Self {
        Value(values.into_iter().map(Item::Int).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.0
    }

    pub fn push(&mut self, item: Item) {
        self.0.push(item);
    }

    pub fn extend(&mut self, other: Value) {
        self.0.extend(other.0);
    }

    /// Returns the boolean if this value is exactly one boolean item.
    pub fn as_bool(&self) -> Option<bool> {
        match self.0.as_slice() {
            [Item::Bool(b)] => Some(*b),
            _ => None,
        }
    }

    /// Effective boolean value.
    pub fn ebv(&self) -> Result<bool> {
        match self.0.as_slice() {
            [] => Ok(false),
            [first, ..] if first.is_node() => Ok(true),
            [Item::Bool(b)] => Ok(*b),
            [Item::Int(i)] => Ok(*i != 0),
            [Item::Double(d)] => Ok(*d != 0.0 && !d.is_nan()),
            [Item::Str(s)] => Ok(!s.is_empty()),
            _ => Err(Error::dynamic(
                "FORG0006",
                format!("effective boolean value not defined for {}", self),
            )),
        }
    }

    pub fn atomize(&self) -> Vec<Item> {
        self.0.iter().map(Item::atomize).collect()
    }

    /// Relevance score. Items carry no full-text score in this model.
    pub fn score(&self) -> f64 {
        0.0
    }
}

impl From<Vec<Item>> for Value {
    fn from(items: Vec<Item>) -> Self {
        Value(items)
    }
}

impl IntoIterator for Value {
    type Item = Item;
    type IntoIter = std::vec::IntoIter<Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    fn holds(self, ord: Option<Ordering>) -> bool {
        match (self, ord) {
            (CmpOp::Ne, None) => true,
            (_, None) => false,
            (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
            (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
            (CmpOp::Lt, Some(o)) => o == Ordering::Less,
            (CmpOp::Le, Some(o)) => o != Ordering::Greater,
            (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
            (CmpOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "div",
            ArithOp::IDiv => "idiv",
            ArithOp::Mod => "mod",
        }
    }
}

/// Compare two atomized items. `None` means unordered (NaN involved).
fn compare_atoms(a: &Item, b: &Item) -> Result<Option<Ordering>> {
    use Item::*;
    match (a, b) {
        (Int(x), Int(y)) => Ok(Some(x.cmp(y))),
        (Bool(x), Bool(y)) => Ok(Some(x.cmp(y))),
        (Str(x), Str(y)) => Ok(Some(x.cmp(y))),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(x.partial_cmp(&y)),
            _ => Err(Error::dynamic(
                "XPTY0004",
                format!("cannot compare {} with {}", a.type_name(), b.type_name()),
            )),
        },
    }
}

/// General comparison: true if any pair of atomized items satisfies `op`.
pub fn general_compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    let l = left.atomize();
    let r = right.atomize();
    for a in &l {
        for b in &r {
            if op.holds(compare_atoms(a, b)?) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn single_atom(v: &Value, op: ArithOp) -> Result<Option<Item>> {
    match v.0.as_slice() {
        [] => Ok(None),
        [item] => Ok(Some(item.atomize())),
        _ => Err(Error::dynamic(
            "XPTY0004",
            format!("operand of '{}' must be a single item, got {} items", op.symbol(), v.len()),
        )),
    }
}

fn overflow(op: ArithOp) -> Error {
    Error::dynamic("FOAR0002", format!("integer overflow in '{}'", op.symbol()))
}

fn div_by_zero() -> Error {
    Error::dynamic("FOAR0001", "division by zero")
}

/// Arithmetic on two values. An empty operand yields the empty sequence.
pub fn arith(op: ArithOp, left: &Value, right: &Value) -> Result<Value> {
    let (Some(a), Some(b)) = (single_atom(left, op)?, single_atom(right, op)?) else {
        return Ok(Value::empty());
    };
    let item = match (&a, &b) {
        (Item::Int(x), Item::Int(y)) => {
            let (x, y) = (*x, *y);
            match op {
                ArithOp::Add => Item::Int(x.checked_add(y).ok_or_else(|| overflow(op))?),
                ArithOp::Sub => Item::Int(x.checked_sub(y).ok_or_else(|| overflow(op))?),
                ArithOp::Mul => Item::Int(x.checked_mul(y).ok_or_else(|| overflow(op))?),
                ArithOp::Div => {
                    if y == 0 {
                        return Err(div_by_zero());
                    }
                    if x % y == 0 {
                        Item::Int(x / y)
                    } else {
                        Item::Double(x as f64 / y as f64)
                    }
                }
                ArithOp::IDiv => {
                    if y == 0 {
                        return Err(div_by_zero());
                    }
                    Item::Int(x.checked_div(y).ok_or_else(|| overflow(op))?)
                }
                ArithOp::Mod => {
                    if y == 0 {
                        return Err(div_by_zero());
                    }
                    Item::Int(x.checked_rem(y).ok_or_else(|| overflow(op))?)
                }
            }
        }
        _ => {
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return Err(Error::dynamic(
                    "XPTY0004",
                    format!(
                        "'{}' is not defined for {} and {}",
                        op.symbol(),
                        a.type_name(),
                        b.type_name()
                    ),
                ));
            };
            match op {
                ArithOp::Add => Item::Double(x + y),
                ArithOp::Sub => Item::Double(x - y),
                ArithOp::Mul => Item::Double(x * y),
                ArithOp::Div => Item::Double(x / y),
                ArithOp::IDiv => {
                    if y == 0.0 {
                        return Err(div_by_zero());
                    }
                    let q = (x / y).trunc();
                    // i64::MAX as f64 rounds up to 2^63
                    if !q.is_finite() || q < i64::MIN as f64 || q >= i64::MAX as f64 {
                        return Err(overflow(op));
                    }
                    Item::Int(q as i64)
                }
                ArithOp::Mod => Item::Double(x % y),
            }
        }
    };
    Ok(Value::single(item))
}

/// Total order used by `order by`: empty keys first (or last), then values
/// by type; NaN sorts after every other number.
pub fn order_cmp(a: Option<&Item>, b: Option<&Item>, empty_least: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => {
            if empty_least {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Some(_), None) => {
            if empty_least {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Some(x), Some(y)) => item_cmp(x, y),
    }
}

fn item_cmp(a: &Item, b: &Item) -> Ordering {
    use Item::*;
    match (a, b) {
        (Bool(x), Bool(y)) => x.cmp(y),
        (Int(x), Int(y)) => x.cmp(y),
        (Str(x), Str(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => {
                if x.is_nan() && y.is_nan() {
                    Ordering::Equal
                } else if x.is_nan() {
                    Ordering::Greater
                } else if y.is_nan() {
                    Ordering::Less
                } else {
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
            // Mixed types: order by variant order
            _ => type_order(a).cmp(&type_order(b)),
        },
    }
}

fn type_order(i: &Item) -> u8 {
    match i {
        Item::Bool(_) => 0,
        Item::Int(_) | Item::Double(_) => 1,
        Item::Str(_) => 2,
        Item::Node(_) => 3,
    }
}

/// Hashable grouping key for one atomized item. Numbers compare by value,
/// so `1` and `1.0` fall into the same group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Empty,
    Bool(bool),
    Num(u64),
    Str(String),
}

impl GroupKey {
    pub fn of(value: &Value) -> Result<GroupKey> {
        let atoms = value.atomize();
        match atoms.as_slice() {
            [] => Ok(GroupKey::Empty),
            [Item::Bool(b)] => Ok(GroupKey::Bool(*b)),
            [Item::Str(s)] => Ok(GroupKey::Str(s.clone())),
            [n] if n.is_numeric() => {
                let f = n.as_f64().unwrap_or(f64::NAN);
                let bits = if f == 0.0 {
                    0.0f64.to_bits()
                } else if f.is_nan() {
                    f64::NAN.to_bits()
                } else {
                    f.to_bits()
                };
                Ok(GroupKey::Num(bits))
            }
            _ => Err(Error::dynamic(
                "XPTY0004",
                format!("grouping key must be at most one atomic item, got {}", value),
            )),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Bool(b) => write!(f, "{}()", b),
            Item::Int(i) => write!(f, "{}", i),
            Item::Double(d) => write!(f, "{:?}", d),
            Item::Str(s) => write!(f, "\"{}\"", s),
            Item::Node(n) => write!(f, "<{}>", n.name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            items => {
                write!(f, "(")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", it)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ebv_follows_sequence_rules() {
        assert!(!Value::empty().ebv().unwrap());
        assert!(Value::int(3).ebv().unwrap());
        assert!(!Value::single(Item::Str(String::new())).ebv().unwrap());
        assert!(Value::ints([1, 2]).ebv().is_err());
    }

    #[test]
    fn general_comparison_is_existential() {
        let l = Value::ints([1, 2, 3]);
        assert!(general_compare(CmpOp::Eq, &l, &Value::int(2)).unwrap());
        assert!(!general_compare(CmpOp::Gt, &l, &Value::int(3)).unwrap());
        assert!(!general_compare(CmpOp::Eq, &Value::empty(), &l).unwrap());
    }

    #[test]
    fn integer_division_by_zero_fails() {
        let err = arith(ArithOp::Div, &Value::int(1), &Value::int(0)).unwrap_err();
        assert_eq!(err.code(), Some("FOAR0001"));
        assert_eq!(
            arith(ArithOp::Add, &Value::int(5), &Value::int(5)).unwrap(),
            Value::int(10)
        );
        assert_eq!(arith(ArithOp::Add, &Value::empty(), &Value::int(5)).unwrap(), Value::empty());
    }

    #[test]
    fn double_integer_division_must_fit_an_integer() {
        let d = |v: f64| Value::single(Item::Double(v));
        assert_eq!(arith(ArithOp::IDiv, &d(7.5), &d(2.0)).unwrap(), Value::int(3));
        for (a, b) in [(1e300, 1e-10), (f64::NAN, 1.0), (f64::INFINITY, 2.0), (-1e19, 1.0)] {
            let err = arith(ArithOp::IDiv, &d(a), &d(b)).unwrap_err();
            assert_eq!(err.code(), Some("FOAR0002"));
        }
        assert_eq!(
            arith(ArithOp::IDiv, &d(-9.0e18), &d(1.0)).unwrap(),
            Value::int(-9_000_000_000_000_000_000)
        );
    }

    #[test]
    fn numeric_group_keys_unify_int_and_double() {
        let a = GroupKey::of(&Value::int(1)).unwrap();
        let b = GroupKey::of(&Value::single(Item::Double(1.0))).unwrap();
        assert_eq!(a, b);
    }
}
