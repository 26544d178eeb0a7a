mod exec;
pub(crate) mod expr;
pub(crate) mod json;
pub(crate) mod n1ql;

use self::exec::{QueryPlan, Row};
use crate::{
    database::DbInner,
    error::{CblErrorCode, Error},
    lock,
    logging::{cbl_log, LogDomain},
    observer::{ChangeEntry, Listener, ListenerToken},
    value::{FromValueRef, ValueRef},
    Database, Result,
};
use fallible_streaming_iterator::FallibleStreamingIterator;
use serde::{Deserialize, Serialize};
use serde_fleece::{Array, FlSliceResult, MutableDict, MutableValue};
use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
};

/// Language of query or index expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLanguage {
    /// JSON query schema
    Json,
    /// N1QL / SQL++ subset
    N1ql,
}

/// Compiled query
pub struct Query<'db> {
    db: &'db Database,
    plan: Arc<QueryPlan>,
    source: String,
    language: QueryLanguage,
    params: Mutex<Option<FlSliceResult>>,
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({:?}, {})", self.language, self.source)
    }
}

fn compile(inner: &DbInner, language: QueryLanguage, source: &str) -> Result<QueryPlan> {
    let select = match language {
        QueryLanguage::Json => json::parse_select(source)?,
        QueryLanguage::N1ql => n1ql::parse_select(source)?,
    };
    QueryPlan::compile(select, &inner.read_snapshot(), &inner.name, source)
}

impl Query<'_> {
    pub(crate) fn new<'a>(
        db: &'a Database,
        language: QueryLanguage,
        source: &str,
    ) -> Result<Query<'a>> {
        let plan = compile(&db.inner, language, source).map_err(|err| {
            cbl_log!(LogDomain::Query, Info, "can not compile query: {}", err);
            err
        })?;
        Ok(Query {
            db,
            plan: Arc::new(plan),
            source: source.into(),
            language,
            params: Mutex::new(None),
        })
    }

    #[inline]
    pub fn language(&self) -> QueryLanguage {
        self.language
    }

    /// Current parameter values, `None` if they were never set
    pub fn parameters(&self) -> Result<Option<MutableDict>> {
        let params = lock(&self.params);
        match params.as_ref() {
            Some(data) => Ok(Some(MutableDict::from_data(data.as_bytes().to_vec())?)),
            None => Ok(None),
        }
    }

    /// Set parameters from any serializable struct or map,
    /// each key is the name of `$parameter`
    pub fn set_parameters<T>(&self, parameters: &T) -> Result<()>
    where
        T: Serialize,
    {
        let data = serde_fleece::to_fl_slice_result(parameters)?;
        self.set_params_data(data)
    }

    pub fn set_parameters_dict(&self, parameters: &MutableDict) -> Result<()> {
        self.set_params_data(parameters.encode()?)
    }

    fn set_params_data(&self, data: FlSliceResult) -> Result<()> {
        if data.root_dict().is_none() {
            return Err(CblErrorCode::InvalidParameter.into());
        }
        *lock(&self.params) = Some(data);
        Ok(())
    }

    /// Run query with current parameters
    pub fn execute(&self) -> Result<ResultSet> {
        let params = lock(&self.params).clone();
        let snap = self.db.inner.read_snapshot();
        let rows = self
            .plan
            .execute(&snap, params.as_ref().and_then(FlSliceResult::root_dict))?;
        Ok(ResultSet::new(
            Arc::new(rows),
            Arc::new(self.plan.column_names.clone()),
        ))
    }

    /// The same as `execute`
    #[inline]
    pub fn run(&self) -> Result<ResultSet> {
        self.execute()
    }

    /// Human readable description of how query will be executed
    pub fn explain(&self) -> Result<String> {
        self.plan.explain(&self.db.inner.read_snapshot())
    }

    #[inline]
    pub fn column_count(&self) -> usize {
        self.plan.column_count()
    }

    #[inline]
    pub fn column_name(&self, i: usize) -> Option<&str> {
        self.plan.column_names.get(i).map(String::as_str)
    }

    /// Watch results of query. After every commit touching the queried
    /// collection the query is run again, and the listener is called if
    /// the results changed. The first call delivers initial results.
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerToken>
    where
        F: Fn(&QueryChange) + Send + Sync + 'static,
    {
        self.db.inner.check_observable()?;
        let live = Arc::new(LiveQuery {
            db: Arc::downgrade(&self.db.inner),
            plan: self.plan.clone(),
            params: lock(&self.params).clone(),
            column_names: Arc::new(self.plan.column_names.clone()),
            last: Mutex::new(None),
            listener: Box::new(listener),
        });
        let hook_live = Arc::downgrade(&live);
        let token = self
            .db
            .inner
            .notifier
            .add_listener(Listener::Commit(Arc::new(move |changes: &[ChangeEntry]| {
                if let Some(live) = hook_live.upgrade() {
                    if changes.iter().any(|x| x.collection == live.plan.collection) {
                        live.refresh(false);
                    }
                }
            })));
        let initial = Arc::downgrade(&live);
        self.db.inner.notifier.post_job(Box::new(move || {
            if let Some(live) = initial.upgrade() {
                live.refresh(true);
            }
        }));
        Ok(token.with_state(live))
    }

    /// Latest results seen by live query registered with `token`
    pub fn copy_current_results(&self, token: &ListenerToken) -> Result<ResultSet> {
        let live = token
            .state
            .clone()
            .and_then(|x| x.downcast::<LiveQuery>().ok())
            .ok_or_else(|| Error::LogicError("token does not belong to live query".into()))?;
        live.current()
    }
}

struct LiveQuery {
    db: Weak<DbInner>,
    plan: Arc<QueryPlan>,
    params: Option<FlSliceResult>,
    column_names: Arc<Vec<String>>,
    /// rows of last run, guarded so readers never see half updated state
    last: Mutex<Option<Arc<Vec<Row>>>>,
    listener: Box<dyn Fn(&QueryChange) + Send + Sync>,
}

impl LiveQuery {
    fn run(&self) -> Result<Vec<Row>> {
        let db = self.db.upgrade().ok_or_else(|| Error::from(CblErrorCode::NotOpen))?;
        let snap = db.current();
        self.plan
            .execute(&snap, self.params.as_ref().and_then(FlSliceResult::root_dict))
    }

    fn refresh(&self, initial: bool) {
        let change = {
            let mut last = lock(&self.last);
            match self.run() {
                Ok(rows) => {
                    if !initial && last.as_deref() == Some(&rows) {
                        return;
                    }
                    let rows = Arc::new(rows);
                    *last = Some(rows.clone());
                    QueryChange {
                        rows: Ok(rows),
                        column_names: self.column_names.clone(),
                    }
                }
                Err(err) => {
                    cbl_log!(LogDomain::Query, Warning, "live query failed: {}", err);
                    QueryChange {
                        rows: Err(err),
                        column_names: self.column_names.clone(),
                    }
                }
            }
        };
        (self.listener)(&change);
    }

    fn current(&self) -> Result<ResultSet> {
        let mut last = lock(&self.last);
        let rows = match last.as_ref() {
            Some(rows) => rows.clone(),
            None => {
                let rows = Arc::new(self.run()?);
                *last = Some(rows.clone());
                rows
            }
        };
        Ok(ResultSet::new(rows, self.column_names.clone()))
    }
}

/// Change of live query results
pub struct QueryChange {
    rows: Result<Arc<Vec<Row>>>,
    column_names: Arc<Vec<String>>,
}

impl QueryChange {
    /// New results, or error of query re-run
    pub fn results(&self) -> Result<ResultSet> {
        match &self.rows {
            Ok(rows) => Ok(ResultSet::new(rows.clone(), self.column_names.clone())),
            Err(err) => Err(err.clone()),
        }
    }
}

/// Rows of query result, forward-only
pub struct ResultSet {
    rows: Arc<Vec<Row>>,
    column_names: Arc<Vec<String>>,
    pos: usize,
    started: bool,
    reach_end: bool,
}

/// Old name of `ResultSet`
pub type Enumerator = ResultSet;

impl fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("rows", &self.rows.len())
            .field("columns", &self.column_names)
            .finish()
    }
}

impl FallibleStreamingIterator for ResultSet {
    type Error = Error;
    type Item = ResultSet;

    fn advance(&mut self) -> Result<()> {
        if self.reach_end {
            return Ok(());
        }
        if self.started {
            self.pos += 1;
        } else {
            self.started = true;
        }
        if self.pos >= self.rows.len() {
            self.reach_end = true;
        }
        Ok(())
    }

    fn get(&self) -> Option<&ResultSet> {
        if !self.reach_end {
            Some(self)
        } else {
            None
        }
    }
}

impl ResultSet {
    fn new(rows: Arc<Vec<Row>>, column_names: Arc<Vec<String>>) -> Self {
        Self {
            rows,
            column_names,
            pos: 0,
            started: false,
            reach_end: false,
        }
    }

    /// Number of rows in whole result
    #[inline]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    fn row(&self) -> Result<&Row> {
        if !self.started || self.reach_end {
            return Err(Error::LogicError("ResultSet: no current row".into()));
        }
        self.rows
            .get(self.pos)
            .ok_or_else(|| Error::LogicError("ResultSet: no current row".into()))
    }

    /// Columns of current row as fleece array
    pub fn result_array(&self) -> Result<Array<'_>> {
        self.row()?
            .data
            .value()
            .as_array()
            .ok_or_else(|| Error::from(CblErrorCode::CorruptRevisionData))
    }

    /// Value of column `i`, `None` if it is MISSING
    pub fn value_at(&self, i: usize) -> Result<Option<ValueRef<'_>>> {
        let row = self.row()?;
        if i < 64 && row.missing & (1 << i) != 0 {
            return Ok(None);
        }
        Ok(self.result_array()?.get(i).map(ValueRef::from))
    }

    /// Value of column named `key`, `None` if there is no such column
    /// or it is MISSING
    pub fn value_for_key(&self, key: &str) -> Result<Option<ValueRef<'_>>> {
        match self.column_names.iter().position(|x| x == key) {
            Some(i) => self.value_at(i),
            None => Ok(None),
        }
    }

    pub fn get_raw_checked(&self, i: u32) -> Result<ValueRef<'_>> {
        let arr = self.result_array()?;
        let n = arr.len();
        let idx = i as usize;
        if idx >= n {
            return Err(Error::LogicError(format!(
                "ResultSet::get_raw_checked: Index out of bounds {} / {}",
                i, n
            )));
        }
        Ok(self.value_at(idx)?.unwrap_or(ValueRef::Null))
    }

    pub fn get_checked<'a, T>(&'a self, i: u32) -> Result<T>
    where
        T: FromValueRef<'a>,
    {
        let value_ref = self.get_raw_checked(i)?;
        FromValueRef::column_result(value_ref)
    }

    /// Current row as dictionary column name to value, MISSING columns are skipped
    pub fn result_dict(&self) -> Result<MutableDict> {
        let row = self.row()?;
        let arr = self.result_array()?;
        let mut dict = MutableDict::new();
        for (i, (name, value)) in self.column_names.iter().zip(arr.iter()).enumerate() {
            if i >= 64 || row.missing & (1 << i) == 0 {
                dict.set(name.as_str(), MutableValue::from_value(value));
            }
        }
        Ok(dict)
    }

    /// Decode current row, as sequence of columns, into `T`
    pub fn decode_row<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        Ok(serde_fleece::from_fl_value(self.result_array()?.as_value())?)
    }

    /// Decode current row into `T`, taking column values by names
    pub fn decode_row_dict<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let data = self.result_dict()?.encode()?;
        Ok(serde_fleece::from_fl_value(data.value())?)
    }
}
