use crate::{
    blob::collect_blob_digests,
    database::DbInner,
    doc_enumerator::{DocEnumerator, DocEnumeratorFlags},
    document::{
        check_doc_id, child_history, empty_body, new_revision_id, DocRecord, Document,
        MutableDocument,
    },
    error::{CblErrorCode, Error, Result},
    index::{
        DbIndexesListIterator, FullTextIndexConfiguration, IndexData, IndexInfo, IndexOptions,
        IndexSpec, IndexType, ValueIndexConfiguration,
    },
    logging::{cbl_log, LogDomain},
    observer::{ChangeEvent, DocumentChange, Listener, ListenerToken},
    storage::{ByteBuf, LogOp, StoredDoc},
    store::PendingCommit,
};
use fallible_streaming_iterator::FallibleStreamingIterator;
use serde::{Deserialize, Serialize};
use serde_fleece::FlSliceResult;
use std::{
    collections::HashSet,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

pub const DEFAULT_NAME: &str = "_default";
const MAX_NAME_LEN: usize = 251;
/// How many times conflict handler may be asked to merge before giving up
pub const MAX_CONFLICT_RETRIES: usize = 10;

/// Full name of collection: scope and collection name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub scope: String,
    pub name: String,
}

impl Default for CollectionSpec {
    fn default() -> Self {
        Self {
            scope: DEFAULT_NAME.into(),
            name: DEFAULT_NAME.into(),
        }
    }
}

impl CollectionSpec {
    pub fn new<N: Into<String>, S: Into<String>>(name: N, scope: S) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
    #[inline]
    pub fn is_default(&self) -> bool {
        self.scope == DEFAULT_NAME && self.name == DEFAULT_NAME
    }

    /// Parse `name` or `scope.name`, `_` is alias of default collection
    pub(crate) fn parse(full_name: &str) -> Self {
        match full_name.split_once('.') {
            Some((scope, name)) => Self::new(name, scope),
            None if full_name == "_" => Self::default(),
            None => Self::new(full_name, DEFAULT_NAME),
        }
    }
}

impl fmt::Display for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scope, self.name)
    }
}

/// Scope and collection names: 1-251 chars of `[A-Za-z0-9_%-]`,
/// can not start with `_` or `%`, except `_default`
pub(crate) fn check_name(name: &str) -> Result<()> {
    let valid = name == DEFAULT_NAME
        || (!name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && !name.starts_with(['_', '%'])
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '%' | '-')));
    if valid {
        Ok(())
    } else {
        Err(CblErrorCode::InvalidParameter.into())
    }
}

/// Conflict-handling options when saving or deleting a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyControl {
    /// The current save/delete will overwrite a conflicting revision if there is a conflict
    LastWriteWins,
    /// The current save/delete will fail if there is a conflict
    FailOnConflict,
}

pub(crate) enum SaveOutcome {
    Saved(Arc<DocRecord>),
    /// Stored revision that does not match base of saved document
    Conflict(Option<Arc<DocRecord>>),
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Write new revision of `doc` (or tombstone if `body` is `None`) inside transaction
pub(crate) fn save_in_pending(
    db: &DbInner,
    pending: &mut PendingCommit,
    spec: &CollectionSpec,
    doc: &MutableDocument,
    body: Option<FlSliceResult>,
    cc: ConcurrencyControl,
) -> Result<SaveOutcome> {
    if let Some(doc_spec) = doc.collection.as_ref() {
        if doc_spec != spec {
            return Err(Error::LogicError(format!(
                "document {} belongs to collection {}, not {}",
                doc.id(),
                doc_spec,
                spec
            )));
        }
    }
    check_doc_id(doc.id())?;
    let existing = pending.snapshot().get_doc(spec, doc.id())?;
    if cc == ConcurrencyControl::FailOnConflict {
        let conflict = match (&existing, &doc.base) {
            (Some(cur), Some(base)) => cur.sequence != base.sequence,
            (Some(cur), None) => !cur.deleted,
            (None, _) => false,
        };
        if conflict {
            return Ok(SaveOutcome::Conflict(existing));
        }
    }
    let deleted = body.is_none();
    if deleted && existing.as_ref().map_or(true, |x| x.deleted) {
        return Err(Error::not_found());
    }
    let body = match body {
        Some(body) => {
            install_blobs(db, doc, &body)?;
            body
        }
        None => empty_body()?,
    };
    let parent = existing.as_deref();
    let rev_id = new_revision_id(parent.map(|x| x.rev_id.as_str()), deleted, body.as_bytes());
    let stored = StoredDoc {
        id: doc.id().into(),
        history: child_history(&rev_id, parent),
        rev_id,
        sequence: pending.next_sequence(),
        deleted,
        body: ByteBuf(body.as_bytes().to_vec()),
        expiration: parent.and_then(|x| x.expiration),
        remote_revs: parent.map(|x| x.remote_revs.clone()).unwrap_or_default(),
    };
    pending.apply(
        LogOp::PutDoc {
            scope: spec.scope.clone(),
            collection: spec.name.clone(),
            doc: stored,
        },
        false,
    )?;
    let rec = pending
        .snapshot()
        .get_doc(spec, doc.id())?
        .ok_or_else(|| Error::LogicError(format!("saved document {} disappeared", doc.id())))?;
    Ok(SaveOutcome::Saved(rec))
}

/// Blobs referenced by body must be in store, pending ones are written now
pub(crate) fn install_blobs(db: &DbInner, doc: &MutableDocument, body: &FlSliceResult) -> Result<()> {
    let mut digests = HashSet::new();
    collect_blob_digests(body.value(), &mut digests);
    for digest in digests {
        if db.blobs.contains(&digest) {
            continue;
        }
        let content = doc
            .pending_blobs
            .iter()
            .find(|b| b.digest() == digest)
            .and_then(|b| b.pending_content());
        match content {
            Some(content) => db.blobs.install(&digest, content)?,
            None => {
                cbl_log!(
                    LogDomain::Database,
                    Warning,
                    "document {} refers to unknown blob {}",
                    doc.id(),
                    digest
                );
                return Err(Error::not_found());
            }
        }
    }
    Ok(())
}

pub(crate) fn purge_in_pending(
    pending: &mut PendingCommit,
    spec: &CollectionSpec,
    doc_id: &str,
) -> Result<()> {
    if pending.snapshot().get_doc(spec, doc_id)?.is_none() {
        return Err(Error::not_found());
    }
    pending.apply(
        LogOp::PurgeDoc {
            scope: spec.scope.clone(),
            collection: spec.name.clone(),
            id: doc_id.into(),
        },
        false,
    )
}

/// Handle of one collection of database
#[derive(Clone)]
pub struct Collection {
    pub(crate) db: Arc<DbInner>,
    spec: CollectionSpec,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Collection({} in {})", self.spec, self.db.name)
    }
}

impl Collection {
    pub(crate) fn new(db: Arc<DbInner>, spec: CollectionSpec) -> Self {
        Self { db, spec }
    }
    #[inline]
    pub fn spec(&self) -> &CollectionSpec {
        &self.spec
    }
    #[inline]
    pub fn name(&self) -> &str {
        &self.spec.name
    }
    #[inline]
    pub fn scope_name(&self) -> &str {
        &self.spec.scope
    }
    /// Returns the number of (undeleted) documents in the collection
    pub fn count(&self) -> Result<u64> {
        Ok(self.db.read_snapshot().collection(&self.spec)?.live_count())
    }

    /// Returns document, or `None` if there is no such document or it is deleted
    pub fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(self
            .db
            .read_snapshot()
            .get_doc(&self.spec, doc_id)?
            .filter(|x| !x.deleted)
            .map(|x| Document::new(x, self.spec.clone())))
    }

    pub fn get_mutable_document(&self, doc_id: &str) -> Result<Option<MutableDocument>> {
        Ok(self.get_document(doc_id)?.map(|x| x.mutable_copy()))
    }

    /// Save document, last write wins on conflict
    #[inline]
    pub fn save_document(&self, doc: &mut MutableDocument) -> Result<()> {
        self.save_document_with_concurrency_control(doc, ConcurrencyControl::LastWriteWins)
    }

    pub fn save_document_with_concurrency_control(
        &self,
        doc: &mut MutableDocument,
        cc: ConcurrencyControl,
    ) -> Result<()> {
        match self.try_save(doc, cc)? {
            SaveOutcome::Saved(_) => Ok(()),
            SaveOutcome::Conflict(_) => Err(CblErrorCode::Conflict.into()),
        }
    }

    /// Save document, on conflict `conflict_handler` is called with document to save
    /// and the conflicting stored revision (`None` if it was deleted). Handler should
    /// merge changes into document and return `true`, or `false` to give up.
    pub fn save_document_with_conflict_handler<F>(
        &self,
        doc: &mut MutableDocument,
        mut conflict_handler: F,
    ) -> Result<()>
    where
        F: FnMut(&mut MutableDocument, Option<&Document>) -> bool,
    {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = match self.try_save(doc, ConcurrencyControl::FailOnConflict)? {
                SaveOutcome::Saved(_) => return Ok(()),
                SaveOutcome::Conflict(existing) => existing,
            };
            let conflicting = existing
                .as_ref()
                .filter(|x| !x.deleted)
                .map(|x| Document::new(x.clone(), self.spec.clone()));
            let merged = catch_unwind(AssertUnwindSafe(|| {
                conflict_handler(doc, conflicting.as_ref())
            }))
            .unwrap_or_else(|_| {
                cbl_log!(
                    LogDomain::Database,
                    Error,
                    "conflict handler for {} panicked",
                    doc.id()
                );
                false
            });
            if !merged {
                return Err(CblErrorCode::Conflict.into());
            }
            doc.rebase(existing);
        }
        cbl_log!(
            LogDomain::Database,
            Warning,
            "gave up saving {} after {} conflicts",
            doc.id(),
            MAX_CONFLICT_RETRIES
        );
        Err(CblErrorCode::Conflict.into())
    }

    fn try_save(&self, doc: &mut MutableDocument, cc: ConcurrencyControl) -> Result<SaveOutcome> {
        let body = doc.encode_body()?;
        let outcome = self
            .db
            .in_write(|pending| save_in_pending(&self.db, pending, &self.spec, doc, Some(body), cc))?;
        if let SaveOutcome::Saved(rec) = &outcome {
            doc.rebase(Some(rec.clone()));
            doc.collection = Some(self.spec.clone());
            doc.pending_blobs.clear();
        }
        Ok(outcome)
    }

    #[inline]
    pub fn delete_document(&self, doc: &Document) -> Result<()> {
        self.delete_document_with_concurrency_control(doc, ConcurrencyControl::LastWriteWins)
    }

    /// Write tombstone revision of document
    pub fn delete_document_with_concurrency_control(
        &self,
        doc: &Document,
        cc: ConcurrencyControl,
    ) -> Result<()> {
        let mdoc = MutableDocument::from_record(doc.record.clone(), self.spec.clone());
        let outcome = self
            .db
            .in_write(|pending| save_in_pending(&self.db, pending, &self.spec, &mdoc, None, cc))?;
        match outcome {
            SaveOutcome::Saved(_) => Ok(()),
            SaveOutcome::Conflict(_) => Err(CblErrorCode::Conflict.into()),
        }
    }

    /// Remove all trace of document, including tombstone. Repeated purge
    /// through the same `Document` is a no-op.
    pub fn purge_document(&self, doc: &Document) -> Result<()> {
        if doc.is_purged() {
            return Ok(());
        }
        self.purge_document_by_id(doc.id())?;
        doc.mark_purged();
        Ok(())
    }

    pub fn purge_document_by_id(&self, doc_id: &str) -> Result<()> {
        self.db
            .in_write(|pending| purge_in_pending(pending, &self.spec, doc_id))
    }

    /// Expiration time of document in milliseconds since Unix epoch
    pub fn get_document_expiration(&self, doc_id: &str) -> Result<Option<i64>> {
        self.db
            .read_snapshot()
            .get_doc(&self.spec, doc_id)?
            .map(|x| x.expiration)
            .ok_or_else(Error::not_found)
    }

    /// Document will be purged automatically after `expiration`
    /// (milliseconds since Unix epoch), `None` cancels expiration
    pub fn set_document_expiration(&self, doc_id: &str, expiration: Option<i64>) -> Result<()> {
        self.db.in_write(|pending| {
            if pending.snapshot().get_doc(&self.spec, doc_id)?.is_none() {
                return Err(Error::not_found());
            }
            pending.apply(
                LogOp::SetExpiration {
                    scope: self.spec.scope.clone(),
                    collection: self.spec.name.clone(),
                    id: doc_id.into(),
                    expiration,
                },
                false,
            )
        })
    }

    /// Creates an enumerator ordered by docID.
    pub fn enumerate_all_docs(&self, flags: DocEnumeratorFlags) -> Result<DocEnumerator> {
        let snap = self.db.read_snapshot();
        let coll = snap.collection(&self.spec)?;
        let mut docs: Vec<Arc<DocRecord>> = coll
            .docs
            .values()
            .filter(|x| flags.contains(DocEnumeratorFlags::INCLUDE_DELETED) || !x.deleted)
            .cloned()
            .collect();
        if flags.contains(DocEnumeratorFlags::DESCENDING) {
            docs.reverse();
        }
        Ok(DocEnumerator::new(docs, self.spec.clone()))
    }

    /// Listener is called after every commit that changes this collection
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerToken>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.db.check_observable()?;
        self.db.read_snapshot().collection(&self.spec)?;
        Ok(self
            .db
            .notifier
            .add_listener(Listener::Collection(self.spec.clone(), Arc::new(listener))))
    }

    pub fn add_document_change_listener<F>(&self, doc_id: &str, listener: F) -> Result<ListenerToken>
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.db.check_observable()?;
        Ok(self.db.notifier.add_listener(Listener::Document(
            self.spec.clone(),
            doc_id.into(),
            Arc::new(listener),
        )))
    }

    pub fn create_value_index(&self, name: &str, config: &ValueIndexConfiguration) -> Result<()> {
        self.put_index(IndexSpec::value(name, config))
    }

    pub fn create_full_text_index(
        &self,
        name: &str,
        config: &FullTextIndexConfiguration,
    ) -> Result<()> {
        self.put_index(IndexSpec::full_text(name, config))
    }

    /// Creates index of the values of specific expressions across
    /// all documents. The name is used to identify the index for later updating
    /// or deletion; if an index with the same name already exists, it will be
    /// replaced unless it has the exact same expressions.
    /// Note: If some documents are missing the values to be indexed,
    /// those documents will just be omitted from the index. It's not an error.
    pub fn create_index(
        &self,
        index_name: &str,
        expression_json: &str,
        index_type: IndexType,
        index_options: Option<IndexOptions>,
    ) -> Result<()> {
        self.put_index(IndexSpec::from_options(
            index_name,
            expression_json,
            index_type,
            index_options,
        ))
    }

    fn put_index(&self, spec: IndexSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(CblErrorCode::InvalidParameter.into());
        }
        // compile outside of writer lock, to report syntax errors early
        IndexData::new(spec.clone())?;
        self.db.in_write(|pending| {
            let coll = pending.snapshot().collection(&self.spec)?;
            if coll.indexes.get(&spec.name).map_or(false, |x| x.spec == spec) {
                return Ok(());
            }
            cbl_log!(
                LogDomain::Query,
                Info,
                "create index {} on {}: {}",
                spec.name,
                self.spec,
                spec.expressions
            );
            pending.apply(
                LogOp::PutIndex {
                    scope: self.spec.scope.clone(),
                    collection: self.spec.name.clone(),
                    spec: spec.clone(),
                },
                false,
            )
        })
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.db.in_write(|pending| {
            let coll = pending.snapshot().collection(&self.spec)?;
            if !coll.indexes.contains_key(name) {
                return Err(CblErrorCode::MissingIndex.into());
            }
            pending.apply(
                LogOp::DeleteIndex {
                    scope: self.spec.scope.clone(),
                    collection: self.spec.name.clone(),
                    name: name.into(),
                },
                false,
            )
        })
    }

    pub fn index_names(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .read_snapshot()
            .collection(&self.spec)?
            .indexes
            .keys()
            .cloned()
            .collect())
    }

    /// Returns information about all indexes in the collection
    pub fn get_indexes(
        &self,
    ) -> Result<impl FallibleStreamingIterator<Item = IndexInfo, Error = Error>> {
        let infos = self
            .db
            .read_snapshot()
            .collection(&self.spec)?
            .indexes
            .values()
            .map(|x| x.info())
            .collect();
        Ok(DbIndexesListIterator::new(infos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        for good in ["_default", "users", "a-b_c%1", "X"] {
            assert!(check_name(good).is_ok(), "{}", good);
        }
        let long = "a".repeat(MAX_NAME_LEN + 1);
        for bad in ["", "_users", "%x", "a.b", "a b", long.as_str()] {
            assert!(check_name(bad).is_err(), "{}", bad);
        }
        assert_eq!(CollectionSpec::parse("_"), CollectionSpec::default());
        assert_eq!(
            CollectionSpec::parse("inventory.users"),
            CollectionSpec::new("users", "inventory")
        );
        assert_eq!(
            CollectionSpec::parse("users").to_string(),
            "_default.users".to_string()
        );
    }
}
