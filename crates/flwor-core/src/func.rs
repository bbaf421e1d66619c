//! Built-in functions: names, arities, effect flags, static result types and
//! the evaluation of the context-free ones (shared with constant folding).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Flag;
use crate::seqtype::{ItemType, Occ, SeqType};
use crate::types::{Item, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Func {
    True,
    False,
    Boolean,
    Not,
    Count,
    Empty,
    Exists,
    Sum,
    Concat,
    Error,
    Position,
    Last,
    /// `counter($name)`: increments a per-query counter and returns it.
    Counter,
    /// `put($name, $value)`: records a pending update, returns `()`.
    Put,
}

const ALL: [Func; 14] = [
    Func::True,
    Func::False,
    Func::Boolean,
    Func::Not,
    Func::Count,
    Func::Empty,
    Func::Exists,
    Func::Sum,
    Func::Concat,
    Func::Error,
    Func::Position,
    Func::Last,
    Func::Counter,
    Func::Put,
];

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::True => "true",
            Func::False => "false",
            Func::Boolean => "boolean",
            Func::Not => "not",
            Func::Count => "count",
            Func::Empty => "empty",
            Func::Exists => "exists",
            Func::Sum => "sum",
            Func::Concat => "concat",
            Func::Error => "error",
            Func::Position => "position",
            Func::Last => "last",
            Func::Counter => "counter",
            Func::Put => "put",
        }
    }

    /// Resolve a function name, with or without the `fn:` prefix.
    pub fn from_name(name: &str) -> Option<Func> {
        let local = name.strip_prefix("fn:").unwrap_or(name);
        ALL.into_iter().find(|f| f.name() == local)
    }

    /// Accepted argument counts, inclusive.
    pub fn arity(self) -> (usize, usize) {
        match self {
            Func::True | Func::False | Func::Position | Func::Last => (0, 0),
            Func::Boolean | Func::Not | Func::Count | Func::Empty | Func::Exists | Func::Sum => {
                (1, 1)
            }
            Func::Concat => (2, usize::MAX),
            Func::Error => (0, 2),
            Func::Counter => (1, 1),
            Func::Put => (2, 2),
        }
    }

    pub fn has(self, flag: Flag) -> bool {
        match flag {
            Flag::Ndt => self == Func::Counter,
            Flag::Upd => self == Func::Put,
            Flag::Ctx => matches!(self, Func::Position | Func::Last),
            Flag::Cns => false,
        }
    }

    /// Whether a call with constant arguments may be evaluated at compile time.
    pub fn is_pure(self) -> bool {
        !matches!(self, Func::Position | Func::Last | Func::Counter | Func::Put)
    }

    pub fn seq_type(self) -> SeqType {
        match self {
            Func::True | Func::False | Func::Boolean | Func::Not | Func::Empty | Func::Exists => {
                SeqType::BOOLEAN
            }
            Func::Count | Func::Position | Func::Last | Func::Counter => SeqType::INTEGER,
            Func::Sum => SeqType::new(ItemType::Item, Occ::One),
            Func::Concat => SeqType::new(ItemType::String, Occ::One),
            Func::Error => SeqType::ITEM_ZM,
            Func::Put => SeqType::EMPTY,
        }
    }

    /// Evaluate a context-free function over already evaluated arguments.
    pub fn eval_pure(self, args: &[Value]) -> Result<Value> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        match self {
            Func::True => Ok(Value::bool(true)),
            Func::False => Ok(Value::bool(false)),
            Func::Boolean => Ok(Value::bool(arg(0).ebv()?)),
            Func::Not => Ok(Value::bool(!arg(0).ebv()?)),
            Func::Count => Ok(Value::int(arg(0).len() as i64)),
            Func::Empty => Ok(Value::bool(arg(0).is_empty())),
            Func::Exists => Ok(Value::bool(!arg(0).is_empty())),
            Func::Sum => sum(&arg(0)),
            Func::Concat => {
                let mut out = String::new();
                for a in args {
                    for item in a.items() {
                        out.push_str(&item.string_value());
                    }
                }
                Ok(Value::single(Item::Str(out)))
            }
            Func::Error => Err(raised_error(args)),
            Func::Position | Func::Last | Func::Counter | Func::Put => Err(Error::Invariant(
                format!("{}() needs a dynamic context", self.name()),
            )),
        }
    }
}

fn sum(v: &Value) -> Result<Value> {
    let mut int_acc: Option<i64> = Some(0);
    let mut dbl_acc = 0.0f64;
    for item in v.atomize() {
        match item {
            Item::Int(i) => {
                int_acc = int_acc.and_then(|acc| acc.checked_add(i));
                dbl_acc += i as f64;
            }
            Item::Double(d) => {
                int_acc = None;
                dbl_acc += d;
            }
            other => {
                return Err(Error::dynamic(
                    "FORG0006",
                    format!("sum() is not defined for {}", other.type_name()),
                ))
            }
        }
    }
    Ok(match int_acc {
        Some(i) => Value::int(i),
        None => Value::single(Item::Double(dbl_acc)),
    })
}

/// The error raised by `error()`, `error($code)` or `error($code, $message)`.
fn raised_error(args: &[Value]) -> Error {
    let text = |v: Option<&Value>| v.and_then(|v| v.items().first().map(Item::string_value));
    let code = text(args.first()).unwrap_or_else(|| "FOER0000".to_string());
    let message = text(args.get(1)).unwrap_or_else(|| "error raised by fn:error".to_string());
    Error::Dynamic { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_with_prefix() {
        assert_eq!(Func::from_name("fn:count"), Some(Func::Count));
        assert_eq!(Func::from_name("exists"), Some(Func::Exists));
        assert_eq!(Func::from_name("fn:nope"), None);
    }

    #[test]
    fn error_carries_code_and_message() {
        let args = [
            Value::single(Item::Str("APP01".into())),
            Value::single(Item::Str("boom".into())),
        ];
        let err = Func::Error.eval_pure(&args).unwrap_err();
        assert_eq!(err.code(), Some("APP01"));
        assert_eq!(Func::Error.eval_pure(&[]).unwrap_err().code(), Some("FOER0000"));
    }

    #[test]
    fn sum_promotes_to_double() {
        assert_eq!(Func::Sum.eval_pure(&[Value::ints([1, 2, 3])]).unwrap(), Value::int(6));
        let mixed = Value(vec![Item::Int(1), Item::Double(0.5)]);
        assert_eq!(
            Func::Sum.eval_pure(&[mixed]).unwrap(),
            Value::single(Item::Double(1.5))
        );
    }
}
