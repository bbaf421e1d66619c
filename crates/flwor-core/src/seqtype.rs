//! Static sequence types: an item type plus an occurrence indicator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Item, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Item,
    Boolean,
    Integer,
    Double,
    String,
    Node,
}

impl ItemType {
    pub fn matches(self, item: &Item) -> bool {
        matches!(
            (self, item),
            (ItemType::Item, _)
                | (ItemType::Boolean, Item::Bool(_))
                | (ItemType::Integer, Item::Int(_))
                | (ItemType::Double, Item::Double(_))
                | (ItemType::String, Item::Str(_))
                | (ItemType::Node, Item::Node(_))
        )
    }

    pub fn of(item: &Item) -> ItemType {
        match item {
            Item::Bool(_) => ItemType::Boolean,
            Item::Int(_) => ItemType::Integer,
            Item::Double(_) => ItemType::Double,
            Item::Str(_) => ItemType::String,
            Item::Node(_) => ItemType::Node,
        }
    }

    pub fn is_sub_type_of(self, other: ItemType) -> bool {
        other == ItemType::Item || self == other
    }

    pub fn is_disjoint(self, other: ItemType) -> bool {
        !self.is_sub_type_of(other) && !other.is_sub_type_of(self)
    }

    /// Least common supertype.
    pub fn union(self, other: ItemType) -> ItemType {
        if self == other {
            self
        } else {
            ItemType::Item
        }
    }

    pub fn may_be_number(self) -> bool {
        matches!(self, ItemType::Item | ItemType::Integer | ItemType::Double)
    }

    fn name(self) -> &'static str {
        match self {
            ItemType::Item => "item()",
            ItemType::Boolean => "xs:boolean",
            ItemType::Integer => "xs:integer",
            ItemType::Double => "xs:double",
            ItemType::String => "xs:string",
            ItemType::Node => "node()",
        }
    }
}

/// Occurrence indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occ {
    Zero,
    ZeroOrOne,
    One,
    ZeroOrMore,
    OneOrMore,
}

impl Occ {
    pub fn min(self) -> u64 {
        match self {
            Occ::One | Occ::OneOrMore => 1,
            _ => 0,
        }
    }

    /// Upper bound, `None` when unbounded.
    pub fn max(self) -> Option<u64> {
        match self {
            Occ::Zero => Some(0),
            Occ::ZeroOrOne | Occ::One => Some(1),
            Occ::ZeroOrMore | Occ::OneOrMore => None,
        }
    }

    /// Tightest indicator covering `[min, max]`.
    pub fn from_bounds(min: u64, max: Option<u64>) -> Occ {
        match (min, max) {
            (_, Some(0)) => Occ::Zero,
            (0, Some(1)) => Occ::ZeroOrOne,
            (_, Some(1)) => Occ::One,
            (0, _) => Occ::ZeroOrMore,
            _ => Occ::OneOrMore,
        }
    }

    pub fn check(self, len: usize) -> bool {
        let len = len as u64;
        len >= self.min() && self.max().map_or(true, |m| len <= m)
    }

    pub fn contains(self, other: Occ) -> bool {
        other.min() >= self.min()
            && match (self.max(), other.max()) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(a), Some(b)) => b <= a,
            }
    }

    pub fn union(self, other: Occ) -> Occ {
        let max = match (self.max(), other.max()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Occ::from_bounds(self.min().min(other.min()), max)
    }

    fn suffix(self) -> &'static str {
        match self {
            Occ::Zero | Occ::One => "",
            Occ::ZeroOrOne => "?",
            Occ::ZeroOrMore => "*",
            Occ::OneOrMore => "+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqType {
    pub item: ItemType,
    pub occ: Occ,
}

impl SeqType {
    pub const ITEM: SeqType = SeqType::new(ItemType::Item, Occ::One);
    pub const ITEM_ZM: SeqType = SeqType::new(ItemType::Item, Occ::ZeroOrMore);
    pub const BOOLEAN: SeqType = SeqType::new(ItemType::Boolean, Occ::One);
    pub const INTEGER: SeqType = SeqType::new(ItemType::Integer, Occ::One);
    pub const EMPTY: SeqType = SeqType::new(ItemType::Item, Occ::Zero);

    pub const fn new(item: ItemType, occ: Occ) -> Self {
        Self { item, occ }
    }

    pub fn one(&self) -> bool {
        self.occ == Occ::One
    }

    pub fn zero(&self) -> bool {
        self.occ == Occ::Zero
    }

    /// Exact number of items when the occurrence fixes it.
    pub fn exact_size(&self) -> Option<u64> {
        match self.occ {
            Occ::Zero => Some(0),
            Occ::One => Some(1),
            _ => None,
        }
    }

    pub fn with_occ(self, occ: Occ) -> SeqType {
        SeqType { occ, ..self }
    }

    /// Static type of a known value.
    pub fn of_value(v: &Value) -> SeqType {
        let item = v
            .items()
            .iter()
            .map(ItemType::of)
            .reduce(ItemType::union)
            .unwrap_or(ItemType::Item);
        SeqType::new(item, Occ::from_bounds(v.len() as u64, Some(v.len() as u64)))
    }

    pub fn instance(&self, v: &Value) -> bool {
        self.occ.check(v.len()) && v.items().iter().all(|i| self.item.matches(i))
    }

    pub fn is_sub_type_of(&self, other: &SeqType) -> bool {
        other.occ.contains(self.occ) && (self.zero() || self.item.is_sub_type_of(other.item))
    }

    /// True if no value can be an instance of both types.
    pub fn is_disjoint(&self, other: &SeqType) -> bool {
        let min = self.occ.min().max(other.occ.min());
        let max = match (self.occ.max(), other.occ.max()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if max.map_or(false, |m| m < min) {
            return true;
        }
        min > 0 && self.item.is_disjoint(other.item)
    }

    pub fn union(&self, other: &SeqType) -> SeqType {
        let item = if self.zero() {
            other.item
        } else if other.zero() {
            self.item
        } else {
            self.item.union(other.item)
        };
        SeqType::new(item, self.occ.union(other.occ))
    }

    pub fn may_be_number(&self) -> bool {
        self.occ != Occ::Zero && self.item.may_be_number()
    }

    /// Fail with `XPTY0004` unless `v` is an instance of this type.
    pub fn check(&self, v: &Value) -> Result<()> {
        if self.instance(v) {
            Ok(())
        } else {
            Err(Error::dynamic(
                "XPTY0004",
                format!("{} does not match required type {}", v, self),
            ))
        }
    }
}

impl fmt::Display for SeqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zero() {
            return write!(f, "empty-sequence()");
        }
        write!(f, "{}{}", self.item.name(), self.occ.suffix())
    }
}

impl FromStr for SeqType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "empty-sequence()" {
            return Ok(SeqType::EMPTY);
        }
        let (base, occ) = match s.chars().last() {
            Some('?') => (&s[..s.len() - 1], Occ::ZeroOrOne),
            Some('*') => (&s[..s.len() - 1], Occ::ZeroOrMore),
            Some('+') => (&s[..s.len() - 1], Occ::OneOrMore),
            _ => (s, Occ::One),
        };
        let item = match base.trim() {
            "item()" => ItemType::Item,
            "xs:boolean" => ItemType::Boolean,
            "xs:integer" => ItemType::Integer,
            "xs:double" => ItemType::Double,
            "xs:string" => ItemType::String,
            "node()" | "element()" => ItemType::Node,
            other => {
                return Err(Error::static_err(
                    "XPST0051",
                    format!("unknown sequence type '{}'", other),
                ))
            }
        };
        Ok(SeqType::new(item, occ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_occurrence_suffixes() {
        let t: SeqType = "xs:integer?".parse().unwrap();
        assert_eq!(t, SeqType::new(ItemType::Integer, Occ::ZeroOrOne));
        assert_eq!("item()*".parse::<SeqType>().unwrap(), SeqType::ITEM_ZM);
        assert_eq!(t.to_string(), "xs:integer?");
        assert!("xs:date".parse::<SeqType>().is_err());
    }

    #[test]
    fn subtype_and_disjointness() {
        assert!(SeqType::INTEGER.is_sub_type_of(&SeqType::ITEM_ZM));
        assert!(!SeqType::ITEM_ZM.is_sub_type_of(&SeqType::INTEGER));
        let string: SeqType = "xs:string".parse().unwrap();
        assert!(string.is_disjoint(&SeqType::INTEGER));
        let opt_string: SeqType = "xs:string?".parse().unwrap();
        let opt_int: SeqType = "xs:integer?".parse().unwrap();
        assert!(!opt_string.is_disjoint(&opt_int));
    }

    #[test]
    fn occurrence_bounds_round_trip() {
        for occ in [Occ::Zero, Occ::ZeroOrOne, Occ::One, Occ::ZeroOrMore, Occ::OneOrMore] {
            assert_eq!(Occ::from_bounds(occ.min(), occ.max()), occ);
        }
    }
}
