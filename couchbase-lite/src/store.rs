//! In-memory state of database: immutable snapshots and the way
//! log operations change them.

use crate::{
    collection::CollectionSpec,
    document::DocRecord,
    error::{CblErrorCode, Error, Result},
    index::IndexData,
    observer::{ChangeEntry, RevisionFlags},
    storage::{ByteBuf, LogOp},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Documents and indexes of one collection
#[derive(Debug, Clone, Default)]
pub(crate) struct CollectionData {
    pub docs: BTreeMap<String, Arc<DocRecord>>,
    pub by_sequence: BTreeMap<u64, String>,
    pub indexes: BTreeMap<String, Arc<IndexData>>,
    /// (expiration timestamp in ms, document id)
    pub expirations: BTreeSet<(i64, String)>,
}

impl CollectionData {
    /// Number of not deleted documents
    pub(crate) fn live_count(&self) -> u64 {
        self.docs.values().filter(|x| !x.deleted).count() as u64
    }

    pub(crate) fn next_expiration(&self) -> Option<i64> {
        self.expirations.iter().next().map(|(ts, _)| *ts)
    }

    fn remove_doc(&mut self, id: &str) -> Option<Arc<DocRecord>> {
        let old = self.docs.remove(id)?;
        self.by_sequence.remove(&old.sequence);
        if let Some(ts) = old.expiration {
            self.expirations.remove(&(ts, old.id.clone()));
        }
        for index in self.indexes.values_mut() {
            Arc::make_mut(index).remove_doc(id);
        }
        Some(old)
    }

    fn put_doc(&mut self, rec: Arc<DocRecord>) {
        if let Some(old) = self.docs.get(&rec.id).cloned() {
            self.by_sequence.remove(&old.sequence);
            if let Some(ts) = old.expiration {
                self.expirations.remove(&(ts, old.id.clone()));
            }
        }
        self.by_sequence.insert(rec.sequence, rec.id.clone());
        if let Some(ts) = rec.expiration {
            self.expirations.insert((ts, rec.id.clone()));
        }
        for index in self.indexes.values_mut() {
            Arc::make_mut(index).update_doc(&rec);
        }
        self.docs.insert(rec.id.clone(), rec);
    }

    fn doc_mut(&mut self, id: &str) -> Result<&mut DocRecord> {
        self.docs
            .get_mut(id)
            .map(Arc::make_mut)
            .ok_or_else(Error::not_found)
    }

    pub(crate) fn rebuild_indexes(&mut self) -> Result<()> {
        for index in self.indexes.values_mut() {
            let index = Arc::make_mut(index);
            index.clear();
            for doc in self.docs.values() {
                index.update_doc(doc);
            }
        }
        Ok(())
    }
}

/// Committed state of database, readers keep `Arc<Snapshot>`
/// and never see later changes
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub last_sequence: u64,
    pub collections: BTreeMap<CollectionSpec, Arc<CollectionData>>,
    pub local_docs: BTreeMap<String, Arc<Vec<u8>>>,
}

impl Default for Snapshot {
    fn default() -> Self {
        let mut collections = BTreeMap::new();
        collections.insert(CollectionSpec::default(), Arc::new(CollectionData::default()));
        Self {
            last_sequence: 0,
            collections,
            local_docs: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    pub(crate) fn collection(&self, spec: &CollectionSpec) -> Result<&Arc<CollectionData>> {
        self.collections.get(spec).ok_or_else(Error::not_found)
    }

    pub(crate) fn get_doc(&self, spec: &CollectionSpec, id: &str) -> Result<Option<Arc<DocRecord>>> {
        Ok(self.collection(spec)?.docs.get(id).cloned())
    }

    fn collection_mut(&mut self, spec: &CollectionSpec) -> Result<&mut CollectionData> {
        self.collections
            .get_mut(spec)
            .map(Arc::make_mut)
            .ok_or_else(Error::not_found)
    }

    /// Earliest expiration over all collections
    pub(crate) fn next_expiration(&self) -> Option<i64> {
        self.collections
            .values()
            .filter_map(|c| c.next_expiration())
            .min()
    }

    /// Operations that recreate this snapshot from empty database
    pub(crate) fn to_ops(&self) -> Vec<LogOp> {
        let mut ops = Vec::new();
        for (spec, coll) in &self.collections {
            if !spec.is_default() {
                ops.push(LogOp::CreateCollection {
                    scope: spec.scope.clone(),
                    name: spec.name.clone(),
                });
            }
            let mut docs: Vec<&Arc<DocRecord>> = coll.docs.values().collect();
            docs.sort_by_key(|d| d.sequence);
            for doc in docs {
                ops.push(LogOp::PutDoc {
                    scope: spec.scope.clone(),
                    collection: spec.name.clone(),
                    doc: doc.to_stored(),
                });
            }
            for index in coll.indexes.values() {
                ops.push(LogOp::PutIndex {
                    scope: spec.scope.clone(),
                    collection: spec.name.clone(),
                    spec: index.spec.clone(),
                });
            }
        }
        for (key, value) in &self.local_docs {
            ops.push(LogOp::PutLocal {
                key: key.clone(),
                value: Some(ByteBuf(value.to_vec())),
            });
        }
        ops
    }
}

/// Apply one log operation, used both on replay and on live writes.
/// Returns change to report for document operations.
pub(crate) fn apply_op(snap: &mut Snapshot, op: &LogOp, external: bool) -> Result<Option<ChangeEntry>> {
    let spec_of = |scope: &str, name: &str| CollectionSpec::new(name, scope);
    match op {
        LogOp::CreateCollection { scope, name } => {
            snap.collections
                .entry(spec_of(scope, name))
                .or_insert_with(|| Arc::new(CollectionData::default()));
            Ok(None)
        }
        LogOp::DeleteCollection { scope, name } => {
            let spec = spec_of(scope, name);
            if spec.is_default() {
                return Err(CblErrorCode::InvalidParameter.into());
            }
            snap.collections.remove(&spec);
            Ok(None)
        }
        LogOp::PutDoc {
            scope,
            collection,
            doc,
        } => {
            let spec = spec_of(scope, collection);
            let rec = Arc::new(DocRecord::from_stored(doc.clone())?);
            snap.last_sequence = snap.last_sequence.max(rec.sequence);
            let mut flags = RevisionFlags::empty();
            if rec.deleted {
                flags |= RevisionFlags::DELETED;
            }
            if external {
                flags |= RevisionFlags::EXTERNAL;
            }
            let change = ChangeEntry {
                collection: spec.clone(),
                doc_id: rec.id.clone(),
                rev_id: rec.rev_id.clone(),
                sequence: rec.sequence,
                body_size: u32::try_from(rec.body.len()).unwrap_or(u32::MAX),
                flags,
            };
            snap.collection_mut(&spec)?.put_doc(rec);
            Ok(Some(change))
        }
        LogOp::PurgeDoc {
            scope,
            collection,
            id,
        } => {
            let spec = spec_of(scope, collection);
            let old = snap
                .collection_mut(&spec)?
                .remove_doc(id)
                .ok_or_else(Error::not_found)?;
            let mut flags = RevisionFlags::DELETED;
            if external {
                flags |= RevisionFlags::EXTERNAL;
            }
            Ok(Some(ChangeEntry {
                collection: spec,
                doc_id: old.id.clone(),
                rev_id: old.rev_id.clone(),
                sequence: old.sequence,
                body_size: 0,
                flags,
            }))
        }
        LogOp::PutIndex {
            scope,
            collection,
            spec: index_spec,
        } => {
            let coll = snap.collection_mut(&spec_of(scope, collection))?;
            let index = IndexData::build(index_spec.clone(), coll.docs.values().map(|x| &**x))?;
            coll.indexes.insert(index_spec.name.clone(), Arc::new(index));
            Ok(None)
        }
        LogOp::DeleteIndex {
            scope,
            collection,
            name,
        } => {
            snap.collection_mut(&spec_of(scope, collection))?
                .indexes
                .remove(name);
            Ok(None)
        }
        LogOp::PutLocal { key, value } => {
            match value {
                Some(value) => {
                    snap.local_docs.insert(key.clone(), Arc::new(value.0.clone()));
                }
                None => {
                    snap.local_docs.remove(key);
                }
            }
            Ok(None)
        }
        LogOp::SetExpiration {
            scope,
            collection,
            id,
            expiration,
        } => {
            let coll = snap.collection_mut(&spec_of(scope, collection))?;
            let doc = coll.doc_mut(id)?;
            let old = std::mem::replace(&mut doc.expiration, *expiration);
            if let Some(ts) = old {
                coll.expirations.remove(&(ts, id.clone()));
            }
            if let Some(ts) = expiration {
                coll.expirations.insert((*ts, id.clone()));
            }
            Ok(None)
        }
        LogOp::SetRemoteRev {
            scope,
            collection,
            id,
            remote,
            rev_id,
        } => {
            let doc = snap.collection_mut(&spec_of(scope, collection))?.doc_mut(id)?;
            doc.remote_revs.insert(remote.clone(), rev_id.clone());
            Ok(None)
        }
    }
}

/// Changes made by not yet committed transaction
pub(crate) struct PendingCommit {
    pub working: Arc<Snapshot>,
    pub ops: Vec<LogOp>,
    pub changes: Vec<ChangeEntry>,
    pub expirations_changed: bool,
}

impl PendingCommit {
    pub(crate) fn new(base: Arc<Snapshot>) -> Self {
        Self {
            working: base,
            ops: Vec::new(),
            changes: Vec::new(),
            expirations_changed: false,
        }
    }

    #[inline]
    pub(crate) fn snapshot(&self) -> &Snapshot {
        &self.working
    }

    #[inline]
    pub(crate) fn next_sequence(&self) -> u64 {
        self.working.last_sequence + 1
    }

    pub(crate) fn apply(&mut self, op: LogOp, external: bool) -> Result<()> {
        let snap = Arc::make_mut(&mut self.working);
        if let Some(change) = apply_op(snap, &op, external)? {
            self.changes.push(change);
        }
        if matches!(
            op,
            LogOp::SetExpiration { .. } | LogOp::PutDoc { .. } | LogOp::PurgeDoc { .. }
        ) {
            self.expirations_changed = true;
        }
        self.ops.push(op);
        Ok(())
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        document::{child_history, new_revision_id},
        index::{IndexSpec, ValueIndexConfiguration},
        query::QueryLanguage,
        storage::{ByteBuf, StoredDoc},
    };

    fn put(id: &str, seq: u64, json: &str) -> LogOp {
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        let body = serde_fleece::to_fl_slice_result(&value).unwrap();
        let rev_id = new_revision_id(None, false, body.as_bytes());
        LogOp::PutDoc {
            scope: "_default".into(),
            collection: "_default".into(),
            doc: StoredDoc {
                id: id.into(),
                history: child_history(&rev_id, None),
                rev_id,
                sequence: seq,
                deleted: false,
                body: ByteBuf(body.as_bytes().to_vec()),
                expiration: None,
                remote_revs: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_pending_commit_does_not_touch_base() {
        let base = Arc::new(Snapshot::default());
        let mut pending = PendingCommit::new(base.clone());
        pending.apply(put("a", 1, r#"{"x": 1}"#), false).unwrap();
        pending.apply(put("b", 2, r#"{"x": 2}"#), true).unwrap();
        assert_eq!(pending.next_sequence(), 3);
        assert_eq!(pending.changes.len(), 2);
        assert!(!pending.changes[0].external());
        assert!(pending.changes[1].external());

        let spec = CollectionSpec::default();
        assert_eq!(base.collection(&spec).unwrap().docs.len(), 0);
        assert_eq!(pending.snapshot().collection(&spec).unwrap().live_count(), 2);

        pending
            .apply(
                LogOp::SetExpiration {
                    scope: "_default".into(),
                    collection: "_default".into(),
                    id: "a".into(),
                    expiration: Some(1000),
                },
                false,
            )
            .unwrap();
        assert_eq!(pending.snapshot().next_expiration(), Some(1000));
        pending
            .apply(
                LogOp::PurgeDoc {
                    scope: "_default".into(),
                    collection: "_default".into(),
                    id: "a".into(),
                },
                false,
            )
            .unwrap();
        assert_eq!(pending.snapshot().next_expiration(), None);
        let err = pending
            .apply(
                LogOp::PurgeDoc {
                    scope: "_default".into(),
                    collection: "_default".into(),
                    id: "a".into(),
                },
                false,
            )
            .unwrap_err();
        assert!(err.is(CblErrorCode::NotFound));
    }

    #[test]
    fn test_indexes_follow_documents() {
        let mut snap = Snapshot::default();
        apply_op(&mut snap, &put("a", 1, r#"{"n": 5}"#), false).unwrap();
        apply_op(
            &mut snap,
            &LogOp::PutIndex {
                scope: "_default".into(),
                collection: "_default".into(),
                spec: IndexSpec::value(
                    "n",
                    &ValueIndexConfiguration::new(QueryLanguage::N1ql, "n"),
                ),
            },
            false,
        )
        .unwrap();
        apply_op(&mut snap, &put("b", 2, r#"{"n": 5}"#), false).unwrap();
        let coll = snap.collection(&CollectionSpec::default()).unwrap();
        let five = crate::query::expr::QValue::Int(5);
        let ids = coll.indexes["n"].lookup(
            std::ops::Bound::Included(&five),
            std::ops::Bound::Included(&five),
        );
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        let ops = snap.to_ops();
        let mut copy = Snapshot::default();
        for op in &ops {
            apply_op(&mut copy, op, false).unwrap();
        }
        assert_eq!(copy.last_sequence, 2);
        assert_eq!(
            copy.collection(&CollectionSpec::default()).unwrap().indexes.len(),
            1
        );
    }
}
