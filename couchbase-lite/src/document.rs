use crate::{
    blob::Blob,
    collection::CollectionSpec,
    error::{CblErrorCode, Error, Result},
    storage::{ByteBuf, StoredDoc},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_fleece::{
    to_fl_slice_result_with_encoder, CopyFlags, Dict, FlEncoderSession, FlSliceResult,
    MutableDict,
};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use uuid::Uuid;

/// Only this many ancestors are remembered for each document
pub(crate) const MAX_REV_TREE_DEPTH: usize = 20;
const MAX_DOC_ID_LEN: usize = 250;

/// One revision of document as it lives in snapshot
#[derive(Debug, Clone)]
pub(crate) struct DocRecord {
    pub id: String,
    pub rev_id: String,
    pub sequence: u64,
    pub deleted: bool,
    pub body: FlSliceResult,
    /// current revision first, then its ancestors
    pub history: Vec<String>,
    pub expiration: Option<i64>,
    pub remote_revs: BTreeMap<String, String>,
}

impl DocRecord {
    pub(crate) fn from_stored(doc: StoredDoc) -> Result<Self> {
        let body = if doc.body.0.is_empty() {
            empty_body()?
        } else {
            FlSliceResult::from_untrusted(doc.body.0).ok_or_else(|| {
                Error::from(CblErrorCode::CorruptRevisionData)
            })?
        };
        Ok(Self {
            id: doc.id,
            rev_id: doc.rev_id,
            sequence: doc.sequence,
            deleted: doc.deleted,
            body,
            history: doc.history,
            expiration: doc.expiration,
            remote_revs: doc.remote_revs,
        })
    }

    pub(crate) fn to_stored(&self) -> StoredDoc {
        StoredDoc {
            id: self.id.clone(),
            rev_id: self.rev_id.clone(),
            sequence: self.sequence,
            deleted: self.deleted,
            body: ByteBuf(self.body.as_bytes().to_vec()),
            history: self.history.clone(),
            expiration: self.expiration,
            remote_revs: self.remote_revs.clone(),
        }
    }

    /// Is `rev_id` this revision or one of its remembered ancestors
    pub(crate) fn has_revision(&self, rev_id: &str) -> bool {
        self.rev_id == rev_id || self.history.iter().any(|x| x == rev_id)
    }
}

pub(crate) fn empty_body() -> Result<FlSliceResult> {
    Ok(MutableDict::new().encode()?)
}

/// Generation number, prefix of revision id before `-`
pub(crate) fn rev_generation(rev_id: &str) -> u64 {
    rev_id
        .split_once('-')
        .and_then(|(gen, _)| gen.parse().ok())
        .unwrap_or(0)
}

/// Revision id of child of `parent`: `<generation>-<digest>`,
/// digest covers parent revision, deletion flag and body
pub(crate) fn new_revision_id(parent: Option<&str>, deleted: bool, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.as_bytes());
    }
    hasher.update([0u8, u8::from(deleted)]);
    hasher.update(body);
    let digest = hex::encode(hasher.finalize());
    let gen = parent.map(rev_generation).unwrap_or(0) + 1;
    format!("{}-{}", gen, &digest[..40])
}

/// Ancestors list for new revision `rev_id` on top of `parent`
pub(crate) fn child_history(rev_id: &str, parent: Option<&DocRecord>) -> Vec<String> {
    let mut history = Vec::with_capacity(MAX_REV_TREE_DEPTH);
    history.push(rev_id.to_string());
    if let Some(parent) = parent {
        history.extend(
            parent
                .history
                .iter()
                .take(MAX_REV_TREE_DEPTH - 1)
                .cloned(),
        );
    }
    history
}

pub(crate) fn check_doc_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() || doc_id.len() > MAX_DOC_ID_LEN || doc_id.starts_with('_') {
        Err(CblErrorCode::BadDocId.into())
    } else {
        Ok(())
    }
}

/// Saved revision of a document. It is immutable snapshot,
/// to change document use `Document::mutable_copy`.
#[derive(Debug)]
pub struct Document {
    pub(crate) record: Arc<DocRecord>,
    pub(crate) collection: CollectionSpec,
    purged: AtomicBool,
}

impl Clone for Document {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            collection: self.collection.clone(),
            purged: AtomicBool::new(self.purged.load(Ordering::Acquire)),
        }
    }
}

impl Document {
    pub(crate) fn new(record: Arc<DocRecord>, collection: CollectionSpec) -> Self {
        Self {
            record,
            collection,
            purged: AtomicBool::new(false),
        }
    }
    /// return the document's ID
    #[inline]
    pub fn id(&self) -> &str {
        &self.record.id
    }
    #[inline]
    pub fn revision_id(&self) -> &str {
        &self.record.rev_id
    }
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.record.sequence
    }
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.record.deleted
    }
    /// Expiration time in milliseconds since Unix epoch
    #[inline]
    pub fn expiration(&self) -> Option<i64> {
        self.record.expiration
    }
    #[inline]
    pub fn collection_spec(&self) -> &CollectionSpec {
        &self.collection
    }
    /// Body of document, `None` for deleted documents
    pub fn properties(&self) -> Option<Dict<'_>> {
        if self.record.deleted {
            None
        } else {
            self.record.body.root_dict()
        }
    }
    pub fn to_json(&self) -> String {
        self.record.body.value().to_json()
    }
    /// Decode body of document
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        let x: T = serde_fleece::from_fl_value(self.record.body.value())?;
        Ok(x)
    }
    /// Copy of document that can be changed and saved
    pub fn mutable_copy(&self) -> MutableDocument {
        MutableDocument {
            id: self.record.id.clone(),
            body: MutableDict::from_shared(&self.record.body.shared_root(), CopyFlags::Shallow)
                .unwrap_or_default(),
            base: Some(self.record.clone()),
            pending_blobs: Vec::new(),
            collection: Some(self.collection.clone()),
        }
    }
    #[inline]
    pub(crate) fn is_purged(&self) -> bool {
        self.purged.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn mark_purged(&self) {
        self.purged.store(true, Ordering::Release)
    }
}

/// Document that can be modified, created via `MutableDocument::new*`
/// or `Document::mutable_copy`
#[derive(Debug, Clone)]
pub struct MutableDocument {
    id: String,
    pub(crate) base: Option<Arc<DocRecord>>,
    body: MutableDict,
    pub(crate) pending_blobs: Vec<Blob>,
    pub(crate) collection: Option<CollectionSpec>,
}

impl Default for MutableDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MutableDocument {
    /// New document with random ID
    pub fn new() -> Self {
        Self::new_with_id(Uuid::new_v4().hyphenated().to_string())
    }
    pub fn new_with_id<S: Into<String>>(doc_id: S) -> Self {
        Self {
            id: doc_id.into(),
            base: None,
            body: MutableDict::new(),
            pending_blobs: Vec::new(),
            collection: None,
        }
    }
    /// New document with body created from `data`
    pub fn new_with_body<S, T>(doc_id: S, data: &T, enc: FlEncoderSession) -> Result<Self>
    where
        S: Into<String>,
        T: Serialize,
    {
        let mut doc = Self::new_with_id(doc_id);
        doc.update_body(data, enc)?;
        Ok(doc)
    }
    pub fn from_json<S: Into<String>>(doc_id: S, json: &str) -> Result<Self> {
        let mut doc = Self::new_with_id(doc_id);
        doc.set_json(json)?;
        Ok(doc)
    }
    /// return the document's ID
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }
    /// Sequence of revision this document based on, 0 for new documents
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.base.as_ref().map(|x| x.sequence).unwrap_or(0)
    }
    #[inline]
    pub fn revision_id(&self) -> Option<&str> {
        self.base.as_ref().map(|x| x.rev_id.as_str())
    }
    #[inline]
    pub fn properties(&self) -> &MutableDict {
        &self.body
    }
    #[inline]
    pub fn properties_mut(&mut self) -> &mut MutableDict {
        &mut self.body
    }
    /// Replace body with content of JSON object
    pub fn set_json(&mut self, json: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(Error::LogicError(format!(
                "document body should be JSON object, got: {}",
                json
            )));
        }
        let data = serde_fleece::to_fl_slice_result(&value)?;
        self.set_body_data(data)
    }
    pub fn to_json(&self) -> Result<String> {
        Ok(self.body.to_json()?)
    }
    /// Update internal buffer with data, you need save document
    /// to database to make this change permanent
    pub fn update_body<T>(&mut self, data: &T, enc: FlEncoderSession) -> Result<()>
    where
        T: Serialize,
    {
        let body = to_fl_slice_result_with_encoder(data, enc)?;
        self.set_body_data(body)
    }
    /// Decode body of document
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.body.encode()?;
        let x: T = serde_fleece::from_fl_value(data.value())?;
        Ok(x)
    }
    /// Put reference to `blob` under `key`, content of blob is written
    /// to database when document is saved
    pub fn set_blob(&mut self, key: &str, blob: &Blob) -> Result<()> {
        self.body.set(key, blob.properties_dict()?);
        if !self.pending_blobs.iter().any(|x| x == blob) {
            self.pending_blobs.push(blob.clone());
        }
        Ok(())
    }

    pub(crate) fn encode_body(&self) -> Result<FlSliceResult> {
        Ok(self.body.encode()?)
    }
    pub(crate) fn rebase(&mut self, base: Option<Arc<DocRecord>>) {
        self.base = base;
    }
    pub(crate) fn from_record(record: Arc<DocRecord>, collection: CollectionSpec) -> Self {
        Document::new(record, collection).mutable_copy()
    }

    fn set_body_data(&mut self, data: FlSliceResult) -> Result<()> {
        self.body = MutableDict::from_shared(&data.shared_root(), CopyFlags::Shallow)
            .ok_or_else(|| Error::LogicError("document body should be dictionary".into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_fleece::Encoder;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Message {
        msg: String,
        n: i32,
    }

    #[test]
    fn test_revision_ids() {
        let r1 = new_revision_id(None, false, b"body");
        assert!(r1.starts_with("1-"));
        assert_eq!(r1.len(), 2 + 40);
        let r2 = new_revision_id(Some(&r1), false, b"body");
        assert!(r2.starts_with("2-"));
        assert_ne!(new_revision_id(Some(&r1), true, b"body"), r2);
        assert_eq!(rev_generation(&r2), 2);
        assert_eq!(rev_generation("junk"), 0);
    }

    #[test]
    fn test_history_is_capped() {
        let mut parent: Option<DocRecord> = None;
        for i in 0..30 {
            let rev = format!("{}-abc", i + 1);
            let history = child_history(&rev, parent.as_ref());
            parent = Some(DocRecord {
                id: "d".into(),
                rev_id: rev,
                sequence: i,
                deleted: false,
                body: empty_body().unwrap(),
                history,
                expiration: None,
                remote_revs: BTreeMap::new(),
            });
        }
        let parent = parent.unwrap();
        assert_eq!(parent.history.len(), MAX_REV_TREE_DEPTH);
        assert_eq!(parent.history[0], "30-abc");
        assert!(parent.has_revision("11-abc"));
        assert!(!parent.has_revision("10-abc"));
    }

    #[test]
    fn test_doc_id_rules() {
        assert!(check_doc_id("doc1").is_ok());
        assert!(check_doc_id("").unwrap_err().is(CblErrorCode::BadDocId));
        assert!(check_doc_id("_design").unwrap_err().is(CblErrorCode::BadDocId));
        assert!(check_doc_id(&"x".repeat(251))
            .unwrap_err()
            .is(CblErrorCode::BadDocId));
    }

    #[test]
    fn test_mutable_document_body() {
        let mut enc = Encoder::new();
        let mut doc = MutableDocument::new_with_body(
            "m1",
            &Message {
                msg: "hello".into(),
                n: 5,
            },
            enc.session(),
        )
        .unwrap();
        assert_eq!(
            doc.decode_body::<Message>().unwrap(),
            Message {
                msg: "hello".into(),
                n: 5
            }
        );
        doc.properties_mut().set_string("msg", "bye");
        assert_eq!(doc.to_json().unwrap(), r#"{"msg":"bye","n":5}"#);
        assert!(doc.set_json("[1, 2]").is_err());
        assert_eq!(doc.sequence(), 0);
        assert_eq!(doc.revision_id(), None);
    }
}
