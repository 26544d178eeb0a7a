//! Planning and execution of parsed SELECT against database snapshot

use super::expr::{
    eval, literal_str, Accumulator, AggFunc, BinaryOp, EvalCtx, Expr, FtsQuery, Func, MetaProp,
    PathElem, QValue,
};
use crate::{
    collection::{CollectionSpec, DEFAULT_NAME},
    document::DocRecord,
    error::{CblErrorCode, Error, Result},
    index::IndexData,
    store::{CollectionData, Snapshot},
};
use serde_fleece::{Dict, Encoder, FlSliceResult};
use std::{
    collections::{BTreeSet, HashMap},
    ops::Bound,
    sync::Arc,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct Select {
    pub columns: Vec<ResultColumn>,
    pub from: Option<SourceRef>,
    pub where_: Option<Expr>,
    /// expression and `true` for descending order
    pub order_by: Vec<(Expr, bool)>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    pub distinct: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ResultColumn {
    pub expr: Expr,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SourceRef {
    /// collection name, may be `scope.collection`
    pub name: Option<String>,
    pub scope: Option<String>,
    pub alias: Option<String>,
}

/// One result row: fleece array of column values
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Row {
    pub data: FlSliceResult,
    /// bit N is set if column N is MISSING
    pub missing: u64,
}

/// Compiled query, ready to run many times with different parameters
#[derive(Debug)]
pub(crate) struct QueryPlan {
    pub collection: CollectionSpec,
    pub column_names: Vec<String>,
    columns: Vec<Expr>,
    where_: Option<Expr>,
    order_by: Vec<(Expr, bool)>,
    limit: Option<Expr>,
    offset: Option<Expr>,
    distinct: bool,
    aggregates: Vec<(AggFunc, Option<Expr>)>,
    include_deleted: bool,
    source_label: String,
}

enum Access<'a> {
    Scan,
    Index {
        index: &'a Arc<IndexData>,
        probe: Probe<'a>,
    },
    FullText {
        index: &'a Arc<IndexData>,
        text: &'a Expr,
    },
}

enum Probe<'a> {
    /// `indexed <op> value`
    Compare(BinaryOp, &'a Expr),
    Between(&'a Expr, &'a Expr),
}

fn invalid(source: &str, err: impl Into<String>) -> Error {
    Error::InvalidQuery {
        pos: -1,
        query_expr: source.into(),
        err: err.into(),
    }
}

impl QueryPlan {
    pub(crate) fn compile(
        select: Select,
        snap: &Snapshot,
        db_name: &str,
        source: &str,
    ) -> Result<Self> {
        let from = select.from.unwrap_or_default();
        let collection = match (&from.scope, &from.name) {
            (Some(scope), Some(name)) => CollectionSpec::new(name.as_str(), scope.as_str()),
            (None, Some(name)) if name == DEFAULT_NAME => CollectionSpec::default(),
            (None, Some(name)) => CollectionSpec::parse(name),
            (_, None) => CollectionSpec::default(),
        };
        if snap.collection(&collection).is_err() {
            return Err(invalid(
                source,
                format!("no such collection \"{}\"", collection),
            ));
        }
        let source_label = from
            .alias
            .clone()
            .or_else(|| from.name.clone())
            .unwrap_or_else(|| db_name.to_string());
        let prefixes: Vec<String> = match (&from.alias, &from.name) {
            (Some(alias), _) => vec![alias.clone()],
            (None, Some(name)) => vec![name.clone(), collection.name.clone()],
            (None, None) => Vec::new(),
        };
        let strip = |expr: &mut Expr| {
            expr.walk_mut(&mut |e| {
                if let Expr::Property(path) = e {
                    if let Some(PathElem::Key(first)) = path.first() {
                        if prefixes.iter().any(|p| p == first) {
                            path.remove(0);
                        }
                    }
                }
            })
        };

        let mut columns = select.columns;
        if columns.is_empty() {
            columns = vec![
                ResultColumn {
                    expr: Expr::Meta(MetaProp::Id),
                    name: None,
                },
                ResultColumn {
                    expr: Expr::Meta(MetaProp::Sequence),
                    name: None,
                },
            ];
        }
        let mut where_ = select.where_;
        let mut order_by = select.order_by;
        for c in columns.iter_mut() {
            strip(&mut c.expr);
        }
        if let Some(w) = where_.as_mut() {
            strip(w);
            if w.has_aggregate() {
                return Err(invalid(source, "aggregate function in WHERE"));
            }
        }
        for (e, _) in order_by.iter_mut() {
            strip(e);
        }

        let mut aggregates = Vec::new();
        let mut assign = |expr: &mut Expr| {
            expr.walk_mut(&mut |e| {
                if let Expr::Aggregate(func, arg, slot) = e {
                    *slot = aggregates.len();
                    aggregates.push((*func, arg.as_deref().cloned()));
                }
            })
        };
        columns.iter_mut().for_each(|c| assign(&mut c.expr));
        order_by.iter_mut().for_each(|(e, _)| assign(e));
        for (_, arg) in &aggregates {
            if arg.as_ref().map_or(false, Expr::has_aggregate) {
                return Err(invalid(source, "nested aggregate functions"));
            }
        }

        let mut column_names = Vec::with_capacity(columns.len());
        for (i, c) in columns.iter().enumerate() {
            let name = match (&c.name, &c.expr) {
                (Some(name), _) => name.clone(),
                (None, Expr::Property(path)) if path.is_empty() => source_label.clone(),
                (None, Expr::Property(path)) => match path.iter().rev().find_map(|x| match x {
                    PathElem::Key(k) => Some(k.clone()),
                    PathElem::Index(_) => None,
                }) {
                    Some(k) => k,
                    None => format!("${}", i + 1),
                },
                (None, Expr::Meta(m)) => m.name().to_string(),
                _ => format!("${}", i + 1),
            };
            column_names.push(name);
        }

        let mut include_deleted = false;
        let mut fts_indexes = Vec::new();
        if let Some(w) = &where_ {
            w.walk(&mut |e| match e {
                Expr::Meta(MetaProp::Deleted) => include_deleted = true,
                Expr::Func(Func::Match, args) => fts_indexes.push(literal_str(args.first())),
                _ => {}
            });
        }
        let coll = snap.collection(&collection)?;
        for name in fts_indexes {
            let name = name.ok_or_else(|| invalid(source, "MATCH needs index name"))?;
            if !coll.indexes.get(name).map_or(false, |x| x.is_full_text()) {
                return Err(invalid(
                    source,
                    format!("no such full-text index \"{}\"", name),
                ));
            }
        }

        Ok(Self {
            collection,
            column_names,
            columns: columns.into_iter().map(|c| c.expr).collect(),
            where_,
            order_by,
            limit: select.limit,
            offset: select.offset,
            distinct: select.distinct,
            aggregates,
            include_deleted,
            source_label,
        })
    }

    #[inline]
    pub(crate) fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn access_path<'a>(&'a self, coll: &'a CollectionData) -> Access<'a> {
        let Some(where_) = self.where_.as_ref() else {
            return Access::Scan;
        };
        let conjuncts = where_.conjuncts();
        for index in coll.indexes.values().filter(|x| !x.is_full_text()) {
            let Some(key) = index.exprs().first().map(Expr::describe) else {
                continue;
            };
            for &c in &conjuncts {
                match c {
                    Expr::Binary(op, a, b)
                        if matches!(
                            op,
                            BinaryOp::Eq | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
                        ) =>
                    {
                        if a.describe() == key && b.is_constant() {
                            return Access::Index {
                                index,
                                probe: Probe::Compare(*op, b),
                            };
                        }
                        if b.describe() == key && a.is_constant() {
                            if let Some(op) = op.swap() {
                                return Access::Index {
                                    index,
                                    probe: Probe::Compare(op, a),
                                };
                            }
                        }
                    }
                    Expr::Between(a, lo, hi, false)
                        if a.describe() == key && lo.is_constant() && hi.is_constant() =>
                    {
                        return Access::Index {
                            index,
                            probe: Probe::Between(lo, hi),
                        };
                    }
                    _ => {}
                }
            }
        }
        for &c in &conjuncts {
            if let Expr::Func(Func::Match, args) = c {
                let index = literal_str(args.first()).and_then(|name| coll.indexes.get(name));
                if let (Some(index), Some(text)) = (index, args.get(1)) {
                    if index.is_full_text() {
                        return Access::FullText { index, text };
                    }
                }
            }
        }
        Access::Scan
    }

    /// Human readable description of how query will be executed
    pub(crate) fn explain(&self, snap: &Snapshot) -> Result<String> {
        let coll = snap.collection(&self.collection)?;
        let mut out = match self.access_path(coll) {
            Access::Scan => format!("SCAN {}", self.source_label),
            Access::Index { index, .. } => format!(
                "SEARCH {} USING INDEX {} ({})",
                self.source_label,
                index.name(),
                index
                    .exprs()
                    .iter()
                    .map(Expr::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Access::FullText { index, .. } => format!(
                "SEARCH {} USING FTS INDEX {}",
                self.source_label,
                index.name()
            ),
        };
        out.push('\n');
        out.push_str(&format!(
            "SELECT {}{}\n",
            if self.distinct { "DISTINCT " } else { "" },
            self.columns
                .iter()
                .map(Expr::describe)
                .collect::<Vec<_>>()
                .join(", ")
        ));
        if let Some(w) = &self.where_ {
            out.push_str(&format!("WHERE {}\n", w.describe()));
        }
        if !self.order_by.is_empty() {
            out.push_str(&format!(
                "ORDER BY {}\n",
                self.order_by
                    .iter()
                    .map(|(e, desc)| format!("{}{}", e.describe(), if *desc { " DESC" } else { "" }))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if let Some(l) = &self.limit {
            out.push_str(&format!("LIMIT {}\n", l.describe()));
        }
        if let Some(o) = &self.offset {
            out.push_str(&format!("OFFSET {}\n", o.describe()));
        }
        Ok(out)
    }

    fn fts_queries(&self, coll: &CollectionData, params: Option<Dict>) -> Result<HashMap<String, FtsQuery>> {
        let mut ret = HashMap::new();
        let Some(where_) = self.where_.as_ref() else {
            return Ok(ret);
        };
        let mut matches = Vec::new();
        where_.walk(&mut |e| {
            if let Expr::Func(Func::Match, args) = e {
                matches.push(args);
            }
        });
        let no_fts = HashMap::new();
        for args in matches {
            let Some(name) = literal_str(args.first()) else {
                continue;
            };
            let index = coll
                .indexes
                .get(name)
                .filter(|x| x.is_full_text())
                .ok_or_else(|| Error::from(CblErrorCode::MissingIndex))?;
            let text = match args.get(1).map(|x| eval(x, &EvalCtx::constant(params, &no_fts))) {
                Some(QValue::String(s)) => s,
                _ => String::new(),
            };
            ret.insert(
                name.to_string(),
                FtsQuery {
                    index: index.clone(),
                    terms: index.tokenize_query(&text),
                },
            );
        }
        Ok(ret)
    }

    fn candidates<'a>(
        &self,
        coll: &'a CollectionData,
        params: Option<Dict>,
        fts: &HashMap<String, FtsQuery>,
    ) -> Vec<&'a Arc<DocRecord>> {
        let ctx = EvalCtx::constant(params, fts);
        let ids: Vec<String> = match self.access_path(coll) {
            Access::Scan => return coll.docs.values().collect(),
            Access::Index { index, probe } => {
                let (lo, hi) = match probe {
                    Probe::Compare(op, value) => {
                        let v = eval(value, &ctx);
                        match op {
                            BinaryOp::Eq => (Bound::Included(v.clone()), Bound::Included(v)),
                            BinaryOp::Lt => (Bound::Unbounded, Bound::Excluded(v)),
                            BinaryOp::Le => (Bound::Unbounded, Bound::Included(v)),
                            BinaryOp::Gt => (Bound::Excluded(v), Bound::Unbounded),
                            _ => (Bound::Included(v), Bound::Unbounded),
                        }
                    }
                    Probe::Between(lo, hi) => {
                        (Bound::Included(eval(lo, &ctx)), Bound::Included(eval(hi, &ctx)))
                    }
                };
                if matches!(&lo, Bound::Included(x) | Bound::Excluded(x) if x.is_null_or_missing())
                    || matches!(&hi, Bound::Included(x) | Bound::Excluded(x) if x.is_null_or_missing())
                {
                    return Vec::new();
                }
                index.lookup(lo.as_ref(), hi.as_ref())
            }
            Access::FullText { index, text } => {
                let terms = match eval(text, &ctx) {
                    QValue::String(s) => index.tokenize_query(&s),
                    _ => return Vec::new(),
                };
                index.fts_candidates(&terms).into_iter().collect()
            }
        };
        let unique: BTreeSet<String> = ids.into_iter().collect();
        unique.iter().filter_map(|id| coll.docs.get(id)).collect()
    }

    /// Run query against `snap`, `params` is dictionary of parameter values
    pub(crate) fn execute(&self, snap: &Snapshot, params: Option<Dict>) -> Result<Vec<Row>> {
        let coll = snap.collection(&self.collection)?;
        let fts = self.fts_queries(coll, params)?;
        let constant = EvalCtx::constant(params, &fts);
        let mut matched = Vec::new();
        for doc in self.candidates(coll, params, &fts) {
            if doc.deleted && !self.include_deleted {
                continue;
            }
            if let Some(w) = &self.where_ {
                let ctx = EvalCtx {
                    doc: Some(doc),
                    ..EvalCtx::constant(params, &fts)
                };
                if !eval(w, &ctx).truthy() {
                    continue;
                }
            }
            matched.push(doc);
        }

        let mut rows: Vec<(Vec<QValue>, Vec<QValue>)> = if self.aggregates.is_empty() {
            matched
                .iter()
                .map(|doc| {
                    let ctx = EvalCtx {
                        doc: Some(doc),
                        ..EvalCtx::constant(params, &fts)
                    };
                    let values = self.columns.iter().map(|c| eval(c, &ctx)).collect();
                    let keys = self.order_by.iter().map(|(e, _)| eval(e, &ctx)).collect();
                    (values, keys)
                })
                .collect()
        } else {
            let mut accs: Vec<Accumulator> =
                self.aggregates.iter().map(|(f, _)| Accumulator::new(*f)).collect();
            for doc in &matched {
                let ctx = EvalCtx {
                    doc: Some(doc),
                    ..EvalCtx::constant(params, &fts)
                };
                for (acc, (_, arg)) in accs.iter_mut().zip(&self.aggregates) {
                    acc.add(arg.as_ref().map(|e| eval(e, &ctx)));
                }
            }
            let results: Vec<QValue> = accs.iter().map(Accumulator::result).collect();
            let ctx = EvalCtx {
                doc: matched.last().copied().map(|x| &**x),
                aggregates: &results,
                ..EvalCtx::constant(params, &fts)
            };
            vec![(self.columns.iter().map(|c| eval(c, &ctx)).collect(), Vec::new())]
        };

        if !self.order_by.is_empty() {
            rows.sort_by(|(_, a), (_, b)| {
                for ((x, y), (_, desc)) in a.iter().zip(b).zip(&self.order_by) {
                    let ord = x.cmp(y);
                    if ord.is_ne() {
                        return if *desc { ord.reverse() } else { ord };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        let mut values: Vec<Vec<QValue>> = rows.into_iter().map(|(v, _)| v).collect();
        if self.distinct {
            let mut seen = BTreeSet::new();
            values.retain(|row| seen.insert(row.clone()));
        }
        let offset = self
            .offset
            .as_ref()
            .and_then(|e| eval(e, &constant).as_i64())
            .map_or(0, |x| usize::try_from(x).unwrap_or(0));
        let limit = self
            .limit
            .as_ref()
            .and_then(|e| eval(e, &constant).as_i64())
            .map(|x| usize::try_from(x).unwrap_or(0));

        let mut enc = Encoder::new();
        values
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| encode_row(&mut enc, &row))
            .collect()
    }
}

fn encode_row(enc: &mut Encoder, row: &[QValue]) -> Result<Row> {
    enc.reset();
    enc.begin_array(row.len())?;
    let mut missing = 0u64;
    for (i, v) in row.iter().enumerate() {
        if v.is_missing() && i < 64 {
            missing |= 1 << i;
        }
        v.encode_to(enc)?;
    }
    enc.end_array()?;
    Ok(Row {
        data: enc.finish()?,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        index::{IndexSpec, ValueIndexConfiguration},
        query::{n1ql, QueryLanguage},
        storage::{ByteBuf, LogOp, StoredDoc},
        store::apply_op,
    };

    fn snapshot() -> Snapshot {
        let mut snap = Snapshot::default();
        let people = [
            ("a", r#"{"name":"Ann","age":31,"city":"Oslo"}"#),
            ("b", r#"{"name":"Bob","age":25,"city":"Rome"}"#),
            ("c", r#"{"name":"Cid","age":40,"city":"Oslo"}"#),
            ("d", r#"{"name":"Dee","city":"Rome"}"#),
        ];
        for (seq, (id, json)) in people.iter().enumerate() {
            let value: serde_json::Value = serde_json::from_str(json).unwrap();
            let body = serde_fleece::to_fl_slice_result(&value).unwrap();
            let op = LogOp::PutDoc {
                scope: DEFAULT_NAME.into(),
                collection: DEFAULT_NAME.into(),
                doc: StoredDoc {
                    id: id.to_string(),
                    rev_id: "1-aa".into(),
                    sequence: seq as u64 + 1,
                    deleted: false,
                    body: ByteBuf(body.as_bytes().to_vec()),
                    history: vec!["1-aa".into()],
                    expiration: None,
                    remote_revs: Default::default(),
                },
            };
            apply_op(&mut snap, &op, false).unwrap();
        }
        snap
    }

    fn run(snap: &Snapshot, n1ql_text: &str) -> Vec<String> {
        let select = n1ql::parse_select(n1ql_text).unwrap();
        let plan = QueryPlan::compile(select, snap, "db", n1ql_text).unwrap();
        plan.execute(snap, None)
            .unwrap()
            .iter()
            .map(|r| r.data.value().to_json())
            .collect()
    }

    #[test]
    fn test_filter_sort_limit() {
        let snap = snapshot();
        assert_eq!(
            run(
                &snap,
                "SELECT name FROM _ WHERE city = 'Oslo' OR age < 30 ORDER BY age DESC"
            ),
            vec![r#"["Cid"]"#, r#"["Ann"]"#, r#"["Bob"]"#]
        );
        assert_eq!(
            run(&snap, "SELECT name FROM _ ORDER BY name LIMIT 2 OFFSET 1"),
            vec![r#"["Bob"]"#, r#"["Cid"]"#]
        );
        assert_eq!(
            run(&snap, "SELECT DISTINCT city FROM _ ORDER BY city"),
            vec![r#"["Oslo"]"#, r#"["Rome"]"#]
        );
    }

    #[test]
    fn test_aggregates() {
        let snap = snapshot();
        assert_eq!(
            run(&snap, "SELECT COUNT(*), COUNT(age), MAX(age), MIN(name) FROM _"),
            vec![r#"[4,3,40,"Ann"]"#]
        );
        assert_eq!(
            run(&snap, "SELECT COUNT(*) FROM _ WHERE age > 100"),
            vec![r#"[0]"#]
        );
    }

    #[test]
    fn test_index_is_used() {
        let mut snap = snapshot();
        let spec = IndexSpec::value(
            "byCity",
            &ValueIndexConfiguration::new(QueryLanguage::N1ql, "city"),
        );
        apply_op(
            &mut snap,
            &LogOp::PutIndex {
                scope: DEFAULT_NAME.into(),
                collection: DEFAULT_NAME.into(),
                spec,
            },
            false,
        )
        .unwrap();
        let text = "SELECT META().id FROM _ AS p WHERE p.city = 'Rome' ORDER BY META().id";
        let plan = QueryPlan::compile(n1ql::parse_select(text).unwrap(), &snap, "db", text).unwrap();
        assert_eq!(plan.column_names, vec!["id".to_string()]);
        let explain = plan.explain(&snap).unwrap();
        assert!(explain.starts_with("SEARCH p USING INDEX byCity (city)"), "{}", explain);
        assert_eq!(run(&snap, text), vec![r#"["b"]"#, r#"["d"]"#]);

        let text = "SELECT name FROM _ WHERE age > 20";
        let plan = QueryPlan::compile(n1ql::parse_select(text).unwrap(), &snap, "db", text).unwrap();
        assert!(plan.explain(&snap).unwrap().starts_with("SCAN _"));
    }

    #[test]
    fn test_unknown_collection() {
        let snap = snapshot();
        let text = "SELECT * FROM nope";
        let err = QueryPlan::compile(n1ql::parse_select(text).unwrap(), &snap, "db", text)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery { .. }));
    }
}
