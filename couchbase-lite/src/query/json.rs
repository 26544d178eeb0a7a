//! Parser of JSON query schema: `{"WHAT": [...], "WHERE": [...], ...}`

use super::{
    exec::{ResultColumn, Select, SourceRef},
    expr::{parse_path, AggFunc, BinaryOp, Expr, Func, MetaProp, QValue, UnaryOp},
};
use crate::error::{Error, Result};
use serde_json::{Map, Value as Json};

struct Parser<'a> {
    source: &'a str,
}

impl Parser<'_> {
    fn err<T>(&self, msg: impl Into<String>) -> Result<T> {
        Err(Error::InvalidQuery {
            pos: -1,
            query_expr: self.source.into(),
            err: msg.into(),
        })
    }

    fn select(&self, root: &Json) -> Result<Select> {
        let obj = match root {
            Json::Object(obj) => obj,
            Json::Array(_) => {
                return Ok(Select {
                    where_: Some(self.expr(root)?),
                    ..Select::default()
                })
            }
            _ => return self.err("query must be JSON object or array"),
        };
        let mut ret = Select::default();
        for (key, value) in obj {
            match key.to_ascii_uppercase().as_str() {
                "WHAT" => ret.columns = self.what(value)?,
                "WHERE" => ret.where_ = Some(self.expr(value)?),
                "ORDER_BY" => ret.order_by = self.order_by(value)?,
                "LIMIT" => ret.limit = Some(self.expr(value)?),
                "OFFSET" => ret.offset = Some(self.expr(value)?),
                "DISTINCT" => match value {
                    Json::Bool(b) => ret.distinct = *b,
                    _ => return self.err("DISTINCT must be boolean"),
                },
                "FROM" => ret.from = self.from(value)?,
                _ => return self.err(format!("unknown query property '{}'", key)),
            }
        }
        Ok(ret)
    }

    fn what(&self, value: &Json) -> Result<Vec<ResultColumn>> {
        let Json::Array(items) = value else {
            return self.err("WHAT must be array");
        };
        items
            .iter()
            .map(|item| match item {
                Json::Array(arr) if op_name(arr).map_or(false, |op| op.eq_ignore_ascii_case("AS")) => {
                    match (arr.get(1), arr.get(2), arr.len()) {
                        (Some(e), Some(Json::String(name)), 3) => Ok(ResultColumn {
                            expr: self.expr(e)?,
                            name: Some(name.clone()),
                        }),
                        _ => self.err("AS needs expression and name"),
                    }
                }
                _ => Ok(ResultColumn {
                    expr: self.expr(item)?,
                    name: None,
                }),
            })
            .collect()
    }

    fn order_by(&self, value: &Json) -> Result<Vec<(Expr, bool)>> {
        let Json::Array(items) = value else {
            return self.err("ORDER_BY must be array");
        };
        items
            .iter()
            .map(|item| {
                if let Json::Array(arr) = item {
                    match op_name(arr).map(str::to_ascii_uppercase).as_deref() {
                        Some(dir @ ("DESC" | "ASC")) if arr.len() == 2 => {
                            return Ok((self.expr(&arr[1])?, dir == "DESC"));
                        }
                        _ => {}
                    }
                }
                Ok((self.expr(item)?, false))
            })
            .collect()
    }

    fn from(&self, value: &Json) -> Result<Option<SourceRef>> {
        let Json::Array(items) = value else {
            return self.err("FROM must be array");
        };
        match items.as_slice() {
            [] => Ok(None),
            [Json::Object(src)] => {
                let mut ret = SourceRef::default();
                for (key, value) in src {
                    match (key.to_ascii_uppercase().as_str(), value) {
                        ("COLLECTION", Json::String(name)) => ret.name = Some(name.clone()),
                        ("AS", Json::String(alias)) => ret.alias = Some(alias.clone()),
                        ("SCOPE", Json::String(scope)) => ret.scope = Some(scope.clone()),
                        _ => return self.err(format!("invalid FROM property '{}'", key)),
                    }
                }
                Ok(Some(ret))
            }
            _ => self.err("joins are not supported, FROM must have one source"),
        }
    }

    fn args(&self, arr: &[Json], min: usize, max: usize) -> Result<Vec<Expr>> {
        let op = op_name(arr).unwrap_or_default();
        let args = &arr[1..];
        if args.len() < min || args.len() > max {
            return self.err(format!(
                "wrong number of arguments to '{}': {}",
                op,
                args.len()
            ));
        }
        args.iter().map(|x| self.expr(x)).collect()
    }

    fn expr(&self, value: &Json) -> Result<Expr> {
        match value {
            Json::Array(arr) => self.operation(arr),
            Json::Object(obj) => self.dict(obj),
            scalar => Ok(Expr::Literal(QValue::from_json(scalar))),
        }
    }

    fn dict(&self, obj: &Map<String, Json>) -> Result<Expr> {
        let items = obj
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.expr(v)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Expr::Dict(items))
    }

    fn operation(&self, arr: &[Json]) -> Result<Expr> {
        let Some(op) = op_name(arr) else {
            return self.err("expression array must start with operator string");
        };
        if let Some(path) = op.strip_prefix('.') {
            if path.is_empty() {
                let mut elems = Vec::new();
                for comp in &arr[1..] {
                    match comp {
                        Json::String(s) => elems.extend(self.path(s)?),
                        Json::Number(n) => match n.as_i64() {
                            Some(i) => elems.push(super::expr::PathElem::Index(i)),
                            None => return self.err("array index must be integer"),
                        },
                        _ => return self.err("invalid property path component"),
                    }
                }
                return Ok(Expr::Property(elems));
            }
            if arr.len() != 1 {
                return self.err(format!("property '{}' takes no arguments", op));
            }
            if !path.contains(['.', '[']) {
                if let Some(meta) = path.strip_prefix('_').and_then(MetaProp::from_name) {
                    return Ok(Expr::Meta(meta));
                }
            }
            return Ok(Expr::Property(self.path(path)?));
        }
        if let Some(name) = op.strip_prefix('$') {
            if name.is_empty() || arr.len() != 1 {
                return self.err("invalid parameter reference");
            }
            return Ok(Expr::Param(name.into()));
        }
        if let Some(func) = op.strip_suffix("()") {
            return self.function(func, arr);
        }
        let upper = op.to_ascii_uppercase();
        let binary = |op: BinaryOp| -> Result<Expr> {
            let mut args = self.args(arr, 2, 2)?.into_iter();
            match (args.next(), args.next()) {
                (Some(a), Some(b)) => Ok(Expr::binary(op, a, b)),
                _ => self.err("binary operator needs two arguments"),
            }
        };
        let unary = |op: UnaryOp| -> Result<Expr> {
            let mut args = self.args(arr, 1, 1)?;
            match args.pop() {
                Some(a) => Ok(Expr::unary(op, a)),
                None => self.err("unary operator needs argument"),
            }
        };
        match upper.as_str() {
            "=" | "==" => binary(BinaryOp::Eq),
            "!=" | "<>" => binary(BinaryOp::Ne),
            "<" => binary(BinaryOp::Lt),
            "<=" => binary(BinaryOp::Le),
            ">" => binary(BinaryOp::Gt),
            ">=" => binary(BinaryOp::Ge),
            "+" => binary(BinaryOp::Add),
            "*" => binary(BinaryOp::Mul),
            "/" => binary(BinaryOp::Div),
            "%" => binary(BinaryOp::Mod),
            "||" => binary(BinaryOp::Concat),
            "LIKE" => binary(BinaryOp::Like),
            "NOT LIKE" => binary(BinaryOp::NotLike),
            "IS" => binary(BinaryOp::Is),
            "IS NOT" => binary(BinaryOp::IsNot),
            "-" if arr.len() == 2 => unary(UnaryOp::Neg),
            "-" => binary(BinaryOp::Sub),
            "AND" | "OR" => {
                let bop = if upper == "AND" {
                    BinaryOp::And
                } else {
                    BinaryOp::Or
                };
                let args = self.args(arr, 1, usize::MAX)?;
                let mut it = args.into_iter();
                let first = match it.next() {
                    Some(first) => first,
                    None => return self.err("AND/OR needs arguments"),
                };
                Ok(it.fold(first, |acc, x| Expr::binary(bop, acc, x)))
            }
            "NOT" => unary(UnaryOp::Not),
            "IS NULL" => unary(UnaryOp::IsNull),
            "IS NOT NULL" => unary(UnaryOp::IsNotNull),
            "IS MISSING" => unary(UnaryOp::IsMissing),
            "IS NOT MISSING" | "EXISTS" => unary(UnaryOp::IsNotMissing),
            "IS VALUED" => unary(UnaryOp::IsValued),
            "IS NOT VALUED" => unary(UnaryOp::IsNotValued),
            "MISSING" if arr.len() == 1 => Ok(Expr::Literal(QValue::Missing)),
            "IN" | "NOT IN" => {
                let mut args = self.args(arr, 2, 2)?.into_iter();
                match (args.next(), args.next()) {
                    (Some(a), Some(b)) => Ok(Expr::In(Box::new(a), Box::new(b), upper == "NOT IN")),
                    _ => self.err("IN needs two arguments"),
                }
            }
            "BETWEEN" | "NOT BETWEEN" => {
                let mut args = self.args(arr, 3, 3)?.into_iter();
                match (args.next(), args.next(), args.next()) {
                    (Some(a), Some(lo), Some(hi)) => Ok(Expr::Between(
                        Box::new(a),
                        Box::new(lo),
                        Box::new(hi),
                        upper == "NOT BETWEEN",
                    )),
                    _ => self.err("BETWEEN needs three arguments"),
                }
            }
            "[]" => Ok(Expr::Array(self.args(arr, 0, usize::MAX)?)),
            _ => self.err(format!("unknown operator '{}'", op)),
        }
    }

    fn function(&self, name: &str, arr: &[Json]) -> Result<Expr> {
        if let Some(agg) = AggFunc::from_name(name) {
            let mut args = self.args(arr, 0, 1)?;
            if args.is_empty() && agg != AggFunc::Count {
                return self.err(format!("{}() needs argument", name));
            }
            return Ok(Expr::Aggregate(agg, args.pop().map(Box::new), 0));
        }
        let Some((func, min, max)) = Func::from_name(name) else {
            return self.err(format!("unknown function '{}()'", name));
        };
        let args = self.args(arr, min, max)?;
        if matches!(func, Func::Match | Func::Rank)
            && !matches!(args.first(), Some(Expr::Literal(QValue::String(_))))
        {
            return self.err(format!("first argument of {}() must be index name", name));
        }
        Ok(Expr::Func(func, args))
    }

    fn path(&self, path: &str) -> Result<Vec<super::expr::PathElem>> {
        match parse_path(path) {
            Some(elems) => Ok(elems),
            None => self.err(format!("invalid property path '{}'", path)),
        }
    }
}

fn op_name(arr: &[Json]) -> Option<&str> {
    match arr.first() {
        Some(Json::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn parse_json(source: &str) -> Result<Json> {
    serde_json::from_str(source).map_err(|err| Error::InvalidQuery {
        pos: -1,
        query_expr: source.into(),
        err: err.to_string(),
    })
}

pub(crate) fn parse_select(source: &str) -> Result<Select> {
    let root = parse_json(source)?;
    Parser { source }.select(&root)
}

/// Expressions of index definition, `[[".a"], [".b"]]` or single `[".a"]`
pub(crate) fn parse_expression_list(source: &str) -> Result<Vec<Expr>> {
    let root = parse_json(source)?;
    let parser = Parser { source };
    match &root {
        Json::Array(items) if op_name(items).is_some() => Ok(vec![parser.expr(&root)?]),
        Json::Array(items) => items.iter().map(|x| parser.expr(x)).collect(),
        _ => parser.err("index expressions must be JSON array"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_query() {
        let q = parse_select(
            r#"{"WHAT": [["._id"], ["AS", [".name.first"], "first"], ["COUNT()", ["."]]],
                "WHERE": ["AND", ["=", [".type"], "user"], [">=", [".age"], ["$min"]]],
                "ORDER_BY": [["DESC", [".age"]]],
                "LIMIT": 10,
                "FROM": [{"COLLECTION": "inventory.users", "AS": "u"}]}"#,
        )
        .unwrap();
        assert_eq!(q.columns.len(), 3);
        assert!(matches!(q.columns[0].expr, Expr::Meta(MetaProp::Id)));
        assert_eq!(q.columns[1].name.as_deref(), Some("first"));
        assert!(q.columns[2].expr.has_aggregate());
        assert_eq!(q.order_by.len(), 1);
        assert!(q.order_by[0].1);
        let from = q.from.unwrap();
        assert_eq!(from.name.as_deref(), Some("inventory.users"));
        assert_eq!(from.alias.as_deref(), Some("u"));
        assert_eq!(
            q.where_.unwrap().describe(),
            r#"((type Eq String("user")) And (age Ge $min))"#
        );
    }

    #[test]
    fn test_bare_where_and_errors() {
        let q = parse_select(r#"["=", [".", "a", 1, "b"], 5]"#).unwrap();
        assert!(q.columns.is_empty());
        assert_eq!(q.where_.unwrap().describe(), "(a[1].b Eq Int(5))");

        for bad in [
            r#"{"WHAT": [["NO_SUCH_OP", 1]]}"#,
            r#"{"WHERE": ["=", 1]}"#,
            r#"{"SELECT": []}"#,
            r#"{"WHAT": [["LOWER()"]]}"#,
            "[broken",
        ] {
            match parse_select(bad) {
                Err(Error::InvalidQuery { pos, .. }) => assert_eq!(pos, -1),
                other => panic!("{} -> {:?}", bad, other.map(|_| ())),
            }
        }
        assert_eq!(parse_expression_list(r#"[[".a"], [".b"]]"#).unwrap().len(), 2);
        assert_eq!(parse_expression_list(r#"[".a"]"#).unwrap().len(), 1);
    }
}
