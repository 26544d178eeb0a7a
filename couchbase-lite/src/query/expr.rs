//! Query expressions and their evaluation against documents.

use crate::{document::DocRecord, error::Result, index::IndexData};
use serde_fleece::{Dict, Encoder, Value, ValueType};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

/// Value produced by expression, `Missing` is absence of value
#[derive(Debug, Clone)]
pub(crate) enum QValue {
    Missing,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Data(Vec<u8>),
    Array(Vec<QValue>),
    Dict(BTreeMap<String, QValue>),
}

impl QValue {
    pub(crate) fn from_fleece(value: Value<'_>) -> Self {
        match value.value_type() {
            ValueType::Undefined => QValue::Missing,
            ValueType::Null => QValue::Null,
            ValueType::Boolean => QValue::Bool(value.as_bool()),
            ValueType::Number => {
                if value.is_unsigned() {
                    i64::try_from(value.as_u64())
                        .map(QValue::Int)
                        .unwrap_or_else(|_| QValue::Float(value.as_u64() as f64))
                } else if value.is_integer() {
                    QValue::Int(value.as_i64())
                } else {
                    QValue::Float(value.as_f64())
                }
            }
            ValueType::String => QValue::String(value.as_str().unwrap_or_default().into()),
            ValueType::Data => QValue::Data(value.as_data().unwrap_or_default().to_vec()),
            ValueType::Array => QValue::Array(
                value
                    .as_array()
                    .map(|arr| arr.iter().map(QValue::from_fleece).collect())
                    .unwrap_or_default(),
            ),
            ValueType::Dict => QValue::Dict(
                value
                    .as_dict()
                    .map(|dict| {
                        dict.iter()
                            .map(|(k, v)| (k.to_string(), QValue::from_fleece(v)))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
        }
    }

    pub(crate) fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match value {
            J::Null => QValue::Null,
            J::Bool(b) => QValue::Bool(*b),
            J::Number(n) => match n.as_i64() {
                Some(x) => QValue::Int(x),
                None => QValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            J::String(s) => QValue::String(s.clone()),
            J::Array(arr) => QValue::Array(arr.iter().map(QValue::from_json).collect()),
            J::Object(obj) => QValue::Dict(
                obj.iter()
                    .map(|(k, v)| (k.clone(), QValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Missing values are written as null, caller tracks them separately
    pub(crate) fn encode_to(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            QValue::Missing | QValue::Null => enc.write_null()?,
            QValue::Bool(b) => enc.write_bool(*b)?,
            QValue::Int(x) => enc.write_i64(*x)?,
            QValue::Float(x) => enc.write_f64(*x)?,
            QValue::String(s) => enc.write_string(s)?,
            QValue::Data(d) => enc.write_data(d)?,
            QValue::Array(arr) => {
                enc.begin_array(arr.len())?;
                for item in arr {
                    item.encode_to(enc)?;
                }
                enc.end_array()?;
            }
            QValue::Dict(dict) => {
                enc.begin_dict(dict.len())?;
                for (k, v) in dict {
                    if v.is_missing() {
                        continue;
                    }
                    enc.write_key(k)?;
                    v.encode_to(enc)?;
                }
                enc.end_dict()?;
            }
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn is_missing(&self) -> bool {
        matches!(self, QValue::Missing)
    }
    #[inline]
    pub(crate) fn is_null_or_missing(&self) -> bool {
        matches!(self, QValue::Missing | QValue::Null)
    }

    pub(crate) fn truthy(&self) -> bool {
        match self {
            QValue::Bool(b) => *b,
            QValue::Int(x) => *x != 0,
            QValue::Float(x) => *x != 0.0,
            _ => false,
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            QValue::Int(x) => Some(*x as f64),
            QValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            QValue::Int(x) => Some(*x),
            QValue::Float(x) if x.fract() == 0.0 => Some(*x as i64),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            QValue::Missing => 0,
            QValue::Null => 1,
            QValue::Bool(_) => 2,
            QValue::Int(_) | QValue::Float(_) => 3,
            QValue::String(_) => 4,
            QValue::Data(_) => 5,
            QValue::Array(_) => 6,
            QValue::Dict(_) => 7,
        }
    }
}

impl Ord for QValue {
    /// missing < null < bool < number < string < data < array < dict
    fn cmp(&self, other: &Self) -> Ordering {
        use QValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Int(_) | Float(_), Int(_) | Float(_)) => {
                let (a, b) = (self.as_f64().unwrap_or(0.0), other.as_f64().unwrap_or(0.0));
                a.total_cmp(&b)
            }
            (String(a), String(b)) => a.cmp(b),
            (Data(a), Data(b)) => a.cmp(b),
            (Array(a), Array(b)) => a.cmp(b),
            (Dict(a), Dict(b)) => a.iter().cmp(b.iter()),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for QValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QValue {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathElem {
    Key(String),
    Index(i64),
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElem::Key(k) => write!(f, ".{}", k),
            PathElem::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Parse `a.b[1].c` into path elements
pub(crate) fn parse_path(path: &str) -> Option<Vec<PathElem>> {
    let mut ret = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if !key.is_empty() {
            ret.push(PathElem::Key(key.to_string()));
        } else if rest.is_empty() {
            return None;
        }
        while let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']')?;
            ret.push(PathElem::Index(tail[..end].parse().ok()?));
            rest = &tail[end + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(ret)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetaProp {
    Id,
    Sequence,
    Deleted,
    RevisionId,
    Expiration,
}

impl MetaProp {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "id" | "_id" => Some(MetaProp::Id),
            "sequence" | "_sequence" => Some(MetaProp::Sequence),
            "deleted" | "_deleted" => Some(MetaProp::Deleted),
            "revisionid" | "_revisionid" => Some(MetaProp::RevisionId),
            "expiration" | "_expiration" => Some(MetaProp::Expiration),
            _ => None,
        }
    }
    pub(crate) fn name(self) -> &'static str {
        match self {
            MetaProp::Id => "id",
            MetaProp::Sequence => "sequence",
            MetaProp::Deleted => "deleted",
            MetaProp::RevisionId => "revisionID",
            MetaProp::Expiration => "expiration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
    IsMissing,
    IsNotMissing,
    IsValued,
    IsNotValued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Like,
    NotLike,
    Is,
    IsNot,
    And,
    Or,
}

impl BinaryOp {
    /// `a op b` is the same as `b op.swap() a`
    pub(crate) fn swap(self) -> Option<BinaryOp> {
        use BinaryOp::*;
        match self {
            Eq => Some(Eq),
            Lt => Some(Gt),
            Le => Some(Ge),
            Gt => Some(Lt),
            Ge => Some(Le),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Func {
    Lower,
    Upper,
    Length,
    Abs,
    Round,
    Contains,
    ArrayCount,
    ArrayContains,
    Match,
    Rank,
}

impl Func {
    /// Function by name and its allowed number of arguments
    pub(crate) fn from_name(name: &str) -> Option<(Self, usize, usize)> {
        let f = match name.to_ascii_uppercase().as_str() {
            "LOWER" => (Func::Lower, 1, 1),
            "UPPER" => (Func::Upper, 1, 1),
            "LENGTH" => (Func::Length, 1, 1),
            "ABS" => (Func::Abs, 1, 1),
            "ROUND" => (Func::Round, 1, 2),
            "CONTAINS" => (Func::Contains, 2, 2),
            "ARRAY_COUNT" => (Func::ArrayCount, 1, 1),
            "ARRAY_CONTAINS" => (Func::ArrayContains, 2, 2),
            "MATCH" => (Func::Match, 2, 2),
            "RANK" => (Func::Rank, 1, 1),
            _ => return None,
        };
        Some(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggFunc::Count),
            "SUM" => Some(AggFunc::Sum),
            "AVG" => Some(AggFunc::Avg),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(QValue),
    /// Path inside document body, empty path is the whole body
    Property(Vec<PathElem>),
    Meta(MetaProp),
    Param(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>, bool),
    Between(Box<Expr>, Box<Expr>, Box<Expr>, bool),
    Array(Vec<Expr>),
    Dict(Vec<(String, Expr)>),
    Func(Func, Vec<Expr>),
    /// aggregate over all rows, slot is position in accumulator list
    Aggregate(AggFunc, Option<Box<Expr>>, usize),
}

impl Expr {
    pub(crate) fn binary(op: BinaryOp, a: Expr, b: Expr) -> Expr {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }
    pub(crate) fn unary(op: UnaryOp, a: Expr) -> Expr {
        Expr::Unary(op, Box::new(a))
    }

    /// Visit this expression and all nested ones
    pub(crate) fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Property(_) | Expr::Meta(_) | Expr::Param(_) => {}
            Expr::Unary(_, a) => a.walk(f),
            Expr::Binary(_, a, b) | Expr::In(a, b, _) => {
                a.walk(f);
                b.walk(f);
            }
            Expr::Between(a, b, c, _) => {
                a.walk(f);
                b.walk(f);
                c.walk(f);
            }
            Expr::Array(items) | Expr::Func(_, items) => items.iter().for_each(|x| x.walk(f)),
            Expr::Dict(items) => items.iter().for_each(|(_, x)| x.walk(f)),
            Expr::Aggregate(_, arg, _) => {
                if let Some(arg) = arg {
                    arg.walk(f);
                }
            }
        }
    }

    pub(crate) fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Property(_) | Expr::Meta(_) | Expr::Param(_) => {}
            Expr::Unary(_, a) => a.walk_mut(f),
            Expr::Binary(_, a, b) | Expr::In(a, b, _) => {
                a.walk_mut(f);
                b.walk_mut(f);
            }
            Expr::Between(a, b, c, _) => {
                a.walk_mut(f);
                b.walk_mut(f);
                c.walk_mut(f);
            }
            Expr::Array(items) | Expr::Func(_, items) => {
                items.iter_mut().for_each(|x| x.walk_mut(f))
            }
            Expr::Dict(items) => items.iter_mut().for_each(|(_, x)| x.walk_mut(f)),
            Expr::Aggregate(_, arg, _) => {
                if let Some(arg) = arg {
                    arg.walk_mut(f);
                }
            }
        }
    }

    pub(crate) fn has_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= matches!(e, Expr::Aggregate(..)));
        found
    }

    /// Value does not depend on document
    pub(crate) fn is_constant(&self) -> bool {
        let mut constant = true;
        self.walk(&mut |e| {
            constant &= !matches!(
                e,
                Expr::Property(_) | Expr::Meta(_) | Expr::Aggregate(..) | Expr::Func(Func::Match | Func::Rank, _)
            )
        });
        constant
    }

    /// Split `a AND b AND c` into parts
    pub(crate) fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary(BinaryOp::And, a, b) => {
                let mut ret = a.conjuncts();
                ret.extend(b.conjuncts());
                ret
            }
            _ => vec![self],
        }
    }

    /// Canonical text, used to compare expressions and in query plans
    pub(crate) fn describe(&self) -> String {
        match self {
            Expr::Literal(v) => format!("{:?}", v),
            Expr::Property(path) => {
                let mut s = String::new();
                for (i, elem) in path.iter().enumerate() {
                    match elem {
                        PathElem::Key(k) if i == 0 => s.push_str(k),
                        _ => s.push_str(&elem.to_string()),
                    }
                }
                s
            }
            Expr::Meta(m) => format!("META().{}", m.name()),
            Expr::Param(p) => format!("${}", p),
            Expr::Unary(op, a) => format!("{:?}({})", op, a.describe()),
            Expr::Binary(op, a, b) => format!("({} {:?} {})", a.describe(), op, b.describe()),
            Expr::In(a, b, neg) => format!("({} IN{} {})", a.describe(), neg_str(*neg), b.describe()),
            Expr::Between(a, b, c, neg) => format!(
                "({} BETWEEN{} {} AND {})",
                a.describe(),
                neg_str(*neg),
                b.describe(),
                c.describe()
            ),
            Expr::Array(items) => format!(
                "[{}]",
                items.iter().map(Expr::describe).collect::<Vec<_>>().join(", ")
            ),
            Expr::Dict(items) => format!(
                "{{{}}}",
                items
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.describe()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Expr::Func(func, args) => format!(
                "{:?}({})",
                func,
                args.iter().map(Expr::describe).collect::<Vec<_>>().join(", ")
            ),
            Expr::Aggregate(func, arg, _) => format!(
                "{:?}({})",
                func,
                arg.as_ref().map_or_else(|| "*".to_string(), |x| x.describe())
            ),
        }
    }
}

fn neg_str(neg: bool) -> &'static str {
    if neg {
        " NOT"
    } else {
        ""
    }
}

/// Query terms of `MATCH(index, text)` already split into words
pub(crate) struct FtsQuery {
    pub index: Arc<IndexData>,
    pub terms: Vec<String>,
}

/// Everything expression can refer to while evaluated
pub(crate) struct EvalCtx<'a> {
    pub doc: Option<&'a DocRecord>,
    pub params: Option<Dict<'a>>,
    pub fts: &'a HashMap<String, FtsQuery>,
    pub aggregates: &'a [QValue],
}

impl<'a> EvalCtx<'a> {
    pub(crate) fn constant(params: Option<Dict<'a>>, fts: &'a HashMap<String, FtsQuery>) -> Self {
        Self {
            doc: None,
            params,
            fts,
            aggregates: &[],
        }
    }
}

fn property(doc: &DocRecord, path: &[PathElem]) -> QValue {
    let mut cur: Value<'_> = doc.body.value();
    for elem in path {
        let next = match elem {
            PathElem::Key(k) => cur.as_dict().and_then(|d| d.get(k)),
            PathElem::Index(i) => cur.as_array().and_then(|arr| {
                let idx = if *i < 0 { arr.len() as i64 + i } else { *i };
                usize::try_from(idx).ok().and_then(|idx| arr.get(idx))
            }),
        };
        match next {
            Some(v) => cur = v,
            None => return QValue::Missing,
        }
    }
    QValue::from_fleece(cur)
}

fn meta(doc: &DocRecord, prop: MetaProp) -> QValue {
    match prop {
        MetaProp::Id => QValue::String(doc.id.clone()),
        MetaProp::Sequence => QValue::Int(doc.sequence as i64),
        MetaProp::Deleted => QValue::Bool(doc.deleted),
        MetaProp::RevisionId => QValue::String(doc.rev_id.clone()),
        MetaProp::Expiration => doc.expiration.map_or(QValue::Null, QValue::Int),
    }
}

fn bool_or_unknown(a: &QValue, b: &QValue, f: impl FnOnce() -> bool) -> QValue {
    if a.is_missing() || b.is_missing() {
        QValue::Missing
    } else if matches!(a, QValue::Null) || matches!(b, QValue::Null) {
        QValue::Null
    } else {
        QValue::Bool(f())
    }
}

fn arithmetic(op: BinaryOp, a: &QValue, b: &QValue) -> QValue {
    if a.is_missing() || b.is_missing() {
        return QValue::Missing;
    }
    if let (QValue::Int(x), QValue::Int(y)) = (a, b) {
        let r = match op {
            BinaryOp::Add => x.checked_add(*y),
            BinaryOp::Sub => x.checked_sub(*y),
            BinaryOp::Mul => x.checked_mul(*y),
            BinaryOp::Div if *y != 0 && x.checked_rem(*y) == Some(0) => x.checked_div(*y),
            BinaryOp::Mod if *y != 0 => x.checked_rem(*y),
            BinaryOp::Div | BinaryOp::Mod if *y == 0 => return QValue::Null,
            _ => None,
        };
        if let Some(r) = r {
            return QValue::Int(r);
        }
    }
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return QValue::Null;
    };
    let r = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div if y != 0.0 => x / y,
        BinaryOp::Mod if y != 0.0 => x % y,
        _ => return QValue::Null,
    };
    QValue::Float(r)
}

/// SQL LIKE with `%` (any sequence) and `_` (any char) wildcards
pub(crate) fn like(s: &str, pattern: &str) -> bool {
    fn go(s: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some(('%', rest)) => (0..=s.len()).any(|i| go(&s[i..], rest)),
            Some(('_', rest)) => !s.is_empty() && go(&s[1..], rest),
            Some(('\\', rest)) if !rest.is_empty() => {
                !s.is_empty() && s[0] == rest[0] && go(&s[1..], &rest[1..])
            }
            Some((c, rest)) => !s.is_empty() && s[0] == *c && go(&s[1..], rest),
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    go(&s, &p)
}

fn eval_func(func: Func, args: &[Expr], ctx: &EvalCtx) -> QValue {
    let arg = |i: usize| args.get(i).map_or(QValue::Missing, |a| eval(a, ctx));
    match func {
        Func::Lower | Func::Upper => match arg(0) {
            QValue::String(s) if func == Func::Lower => QValue::String(s.to_lowercase()),
            QValue::String(s) => QValue::String(s.to_uppercase()),
            QValue::Missing => QValue::Missing,
            _ => QValue::Null,
        },
        Func::Length => match arg(0) {
            QValue::String(s) => QValue::Int(s.chars().count() as i64),
            QValue::Missing => QValue::Missing,
            _ => QValue::Null,
        },
        Func::Abs => match arg(0) {
            QValue::Int(x) => QValue::Int(x.saturating_abs()),
            QValue::Float(x) => QValue::Float(x.abs()),
            QValue::Missing => QValue::Missing,
            _ => QValue::Null,
        },
        Func::Round => {
            let digits = if args.len() > 1 {
                arg(1).as_i64().unwrap_or(0)
            } else {
                0
            };
            match arg(0) {
                QValue::Int(x) if digits >= 0 => QValue::Int(x),
                v @ (QValue::Int(_) | QValue::Float(_)) => {
                    let x = v.as_f64().unwrap_or(0.0);
                    let m = 10f64.powi(digits.clamp(-15, 15) as i32);
                    let r = (x * m).round() / m;
                    if digits <= 0 && r.abs() < 9.0e15 {
                        QValue::Int(r as i64)
                    } else {
                        QValue::Float(r)
                    }
                }
                QValue::Missing => QValue::Missing,
                _ => QValue::Null,
            }
        }
        Func::Contains => match (arg(0), arg(1)) {
            (QValue::String(s), QValue::String(sub)) => QValue::Bool(s.contains(sub.as_str())),
            (a, b) => bool_or_unknown(&a, &b, || false).or_null(),
        },
        Func::ArrayCount => match arg(0) {
            QValue::Array(arr) => QValue::Int(arr.len() as i64),
            QValue::Missing => QValue::Missing,
            _ => QValue::Null,
        },
        Func::ArrayContains => match arg(0) {
            QValue::Array(arr) => {
                let needle = arg(1);
                QValue::Bool(arr.iter().any(|x| *x == needle))
            }
            QValue::Missing => QValue::Missing,
            _ => QValue::Null,
        },
        Func::Match => {
            let (Some(doc), Some(index_name)) = (ctx.doc, literal_str(args.first())) else {
                return QValue::Missing;
            };
            match ctx.fts.get(index_name) {
                Some(q) => QValue::Bool(q.index.fts_matches(&doc.id, &q.terms)),
                None => QValue::Bool(false),
            }
        }
        Func::Rank => {
            let (Some(doc), Some(index_name)) = (ctx.doc, literal_str(args.first())) else {
                return QValue::Missing;
            };
            match ctx.fts.get(index_name) {
                Some(q) => QValue::Int(i64::from(q.index.fts_rank(&doc.id, &q.terms))),
                None => QValue::Int(0),
            }
        }
    }
}

impl QValue {
    fn or_null(self) -> QValue {
        match self {
            QValue::Bool(_) => QValue::Null,
            x => x,
        }
    }
}

pub(crate) fn literal_str(expr: Option<&Expr>) -> Option<&str> {
    match expr {
        Some(Expr::Literal(QValue::String(s))) => Some(s),
        _ => None,
    }
}

pub(crate) fn eval(expr: &Expr, ctx: &EvalCtx) -> QValue {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Property(path) => ctx.doc.map_or(QValue::Missing, |doc| property(doc, path)),
        Expr::Meta(prop) => ctx.doc.map_or(QValue::Missing, |doc| meta(doc, *prop)),
        Expr::Param(name) => ctx
            .params
            .and_then(|p| p.get(name))
            .map_or(QValue::Missing, QValue::from_fleece),
        Expr::Unary(op, a) => {
            let a = eval(a, ctx);
            match op {
                UnaryOp::Not => match a {
                    QValue::Missing | QValue::Null => a,
                    a => QValue::Bool(!a.truthy()),
                },
                UnaryOp::Neg => arithmetic(BinaryOp::Sub, &QValue::Int(0), &a),
                UnaryOp::IsNull => QValue::Bool(matches!(a, QValue::Null)),
                UnaryOp::IsNotNull => QValue::Bool(!matches!(a, QValue::Null)),
                UnaryOp::IsMissing => QValue::Bool(a.is_missing()),
                UnaryOp::IsNotMissing => QValue::Bool(!a.is_missing()),
                UnaryOp::IsValued => QValue::Bool(!a.is_null_or_missing()),
                UnaryOp::IsNotValued => QValue::Bool(a.is_null_or_missing()),
            }
        }
        Expr::Binary(BinaryOp::And, a, b) => {
            let a = eval(a, ctx);
            if !a.is_null_or_missing() && !a.truthy() {
                return QValue::Bool(false);
            }
            let b = eval(b, ctx);
            if !b.is_null_or_missing() && !b.truthy() {
                return QValue::Bool(false);
            }
            bool_or_unknown(&a, &b, || true)
        }
        Expr::Binary(BinaryOp::Or, a, b) => {
            let a = eval(a, ctx);
            if a.truthy() {
                return QValue::Bool(true);
            }
            let b = eval(b, ctx);
            if b.truthy() {
                return QValue::Bool(true);
            }
            bool_or_unknown(&a, &b, || false)
        }
        Expr::Binary(op, a, b) => {
            let (a, b) = (eval(a, ctx), eval(b, ctx));
            use BinaryOp::*;
            match op {
                Eq => bool_or_unknown(&a, &b, || a == b),
                Ne => bool_or_unknown(&a, &b, || a != b),
                Lt => bool_or_unknown(&a, &b, || a < b),
                Le => bool_or_unknown(&a, &b, || a <= b),
                Gt => bool_or_unknown(&a, &b, || a > b),
                Ge => bool_or_unknown(&a, &b, || a >= b),
                Is => QValue::Bool(a.type_rank() == b.type_rank() && a == b),
                IsNot => QValue::Bool(!(a.type_rank() == b.type_rank() && a == b)),
                Add | Sub | Mul | Div | Mod => arithmetic(*op, &a, &b),
                Concat => match (&a, &b) {
                    (QValue::String(x), QValue::String(y)) => QValue::String(format!("{}{}", x, y)),
                    _ if a.is_missing() || b.is_missing() => QValue::Missing,
                    _ => QValue::Null,
                },
                Like | NotLike => match (&a, &b) {
                    (QValue::String(s), QValue::String(p)) => {
                        QValue::Bool(like(s, p) == (*op == Like))
                    }
                    _ => bool_or_unknown(&a, &b, || false).or_null(),
                },
                And | Or => QValue::Null,
            }
        }
        Expr::In(a, list, negated) => {
            let a = eval(a, ctx);
            if a.is_null_or_missing() {
                return a;
            }
            match eval(list, ctx) {
                QValue::Array(items) => QValue::Bool(items.contains(&a) != *negated),
                QValue::Missing => QValue::Missing,
                _ => QValue::Null,
            }
        }
        Expr::Between(a, lo, hi, negated) => {
            let (a, lo, hi) = (eval(a, ctx), eval(lo, ctx), eval(hi, ctx));
            if a.is_null_or_missing() || lo.is_null_or_missing() || hi.is_null_or_missing() {
                return QValue::Null;
            }
            QValue::Bool((lo <= a && a <= hi) != *negated)
        }
        Expr::Array(items) => QValue::Array(items.iter().map(|x| eval(x, ctx)).collect()),
        Expr::Dict(items) => QValue::Dict(
            items
                .iter()
                .map(|(k, v)| (k.clone(), eval(v, ctx)))
                .collect(),
        ),
        Expr::Func(func, args) => eval_func(*func, args, ctx),
        Expr::Aggregate(_, _, slot) => ctx.aggregates.get(*slot).cloned().unwrap_or(QValue::Null),
    }
}

/// Running state of one aggregate function
#[derive(Debug, Clone)]
pub(crate) struct Accumulator {
    func: AggFunc,
    count: i64,
    sum: QValue,
    best: QValue,
}

impl Accumulator {
    pub(crate) fn new(func: AggFunc) -> Self {
        Self {
            func,
            count: 0,
            sum: QValue::Int(0),
            best: QValue::Missing,
        }
    }

    /// `value` is `None` for `COUNT(*)`
    pub(crate) fn add(&mut self, value: Option<QValue>) {
        let Some(value) = value else {
            self.count += 1;
            return;
        };
        if value.is_null_or_missing() {
            return;
        }
        match self.func {
            AggFunc::Count => self.count += 1,
            AggFunc::Sum | AggFunc::Avg => {
                if value.as_f64().is_some() {
                    self.count += 1;
                    self.sum = arithmetic(BinaryOp::Add, &self.sum, &value);
                }
            }
            AggFunc::Min => {
                if self.best.is_missing() || value < self.best {
                    self.best = value;
                }
            }
            AggFunc::Max => {
                if self.best.is_missing() || value > self.best {
                    self.best = value;
                }
            }
        }
    }

    pub(crate) fn result(&self) -> QValue {
        match self.func {
            AggFunc::Count => QValue::Int(self.count),
            AggFunc::Sum => self.sum.clone(),
            AggFunc::Avg if self.count == 0 => QValue::Null,
            AggFunc::Avg => QValue::Float(self.sum.as_f64().unwrap_or(0.0) / self.count as f64),
            AggFunc::Min | AggFunc::Max if self.best.is_missing() => QValue::Null,
            AggFunc::Min | AggFunc::Max => self.best.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like() {
        assert!(like("hello", "h%o"));
        assert!(like("hello", "_ello"));
        assert!(like("hello", "%"));
        assert!(!like("hello", "h_o"));
        assert!(like("50%", "50\\%"));
        assert!(!like("500", "50\\%"));
    }

    #[test]
    fn test_value_order() {
        let mut v = vec![
            QValue::String("a".into()),
            QValue::Float(1.5),
            QValue::Null,
            QValue::Int(1),
            QValue::Bool(true),
            QValue::Missing,
            QValue::Int(2),
        ];
        v.sort();
        assert_eq!(
            v,
            vec![
                QValue::Missing,
                QValue::Null,
                QValue::Bool(true),
                QValue::Int(1),
                QValue::Float(1.5),
                QValue::Int(2),
                QValue::String("a".into()),
            ]
        );
        assert_eq!(QValue::Int(2), QValue::Float(2.0));
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("a.b[1].c").unwrap(),
            vec![
                PathElem::Key("a".into()),
                PathElem::Key("b".into()),
                PathElem::Index(1),
                PathElem::Key("c".into()),
            ]
        );
        assert!(parse_path("a..b").is_none());
        assert!(parse_path("a[x]").is_none());
    }

    #[test]
    fn test_eval_without_document() {
        let fts = HashMap::new();
        let ctx = EvalCtx::constant(None, &fts);
        let e = Expr::binary(
            BinaryOp::And,
            Expr::binary(
                BinaryOp::Eq,
                Expr::Literal(QValue::Int(4)),
                Expr::binary(
                    BinaryOp::Add,
                    Expr::Literal(QValue::Int(1)),
                    Expr::Literal(QValue::Float(3.0)),
                ),
            ),
            Expr::Func(
                Func::Contains,
                vec![
                    Expr::Literal(QValue::String("couchbase".into())),
                    Expr::Literal(QValue::String("base".into())),
                ],
            ),
        );
        assert_eq!(eval(&e, &ctx), QValue::Bool(true));
        let e = Expr::binary(
            BinaryOp::Eq,
            Expr::Property(vec![PathElem::Key("x".into())]),
            Expr::Literal(QValue::Int(1)),
        );
        assert!(eval(&e, &ctx).is_missing());
        let mut acc = Accumulator::new(AggFunc::Avg);
        for x in [QValue::Int(1), QValue::Null, QValue::Int(2)] {
            acc.add(Some(x));
        }
        assert_eq!(acc.result(), QValue::Float(1.5));
    }
}
