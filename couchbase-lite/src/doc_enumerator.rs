use crate::{
    collection::CollectionSpec,
    document::{DocRecord, Document},
    error::{Error, Result},
};
use bitflags::bitflags;
use fallible_streaming_iterator::FallibleStreamingIterator;
use std::sync::Arc;

/// Iterates over documents of collection, as they were at the moment
/// the enumerator was created
pub struct DocEnumerator {
    docs: Vec<Arc<DocRecord>>,
    collection: CollectionSpec,
    pos: usize,
    started: bool,
    reach_end: bool,
}

/// Metadata of current document
pub struct DocumentInfo<'a> {
    record: &'a DocRecord,
}

impl DocumentInfo<'_> {
    #[inline]
    pub fn doc_id(&self) -> &str {
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
    #[inline]
    pub fn body_size(&self) -> usize {
        self.record.body.len()
    }
    #[inline]
    pub fn expiration(&self) -> Option<i64> {
        self.record.expiration
    }
}

impl DocEnumerator {
    pub(crate) fn new(docs: Vec<Arc<DocRecord>>, collection: CollectionSpec) -> Self {
        Self {
            docs,
            collection,
            pos: 0,
            started: false,
            reach_end: false,
        }
    }

    fn current(&self) -> Option<&Arc<DocRecord>> {
        if self.started && !self.reach_end {
            self.docs.get(self.pos)
        } else {
            None
        }
    }

    #[inline]
    pub fn get_doc_info(&self) -> Result<Option<DocumentInfo>> {
        Ok(self.current().map(|record| DocumentInfo { record }))
    }

    pub fn get_doc(&self) -> Result<Document> {
        let record = self.current().ok_or_else(|| {
            Error::LogicError("DocEnumerator::get_doc: no current document".into())
        })?;
        Ok(Document::new(record.clone(), self.collection.clone()))
    }
}

impl FallibleStreamingIterator for DocEnumerator {
    type Error = Error;
    type Item = DocEnumerator;

    fn advance(&mut self) -> Result<()> {
        if self.reach_end {
            return Ok(());
        }
        if self.started {
            self.pos += 1;
        } else {
            self.started = true;
        }
        if self.pos >= self.docs.len() {
            self.reach_end = true;
        }
        Ok(())
    }

    #[inline]
    fn get(&self) -> Option<&DocEnumerator> {
        if !self.reach_end {
            Some(self)
        } else {
            None
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DocEnumeratorFlags: u16 {
        /// If true, iteration goes by descending document IDs
        const DESCENDING           = 0x01;
        /// If true, include deleted documents
        const INCLUDE_DELETED       = 0x08;
        /// If false, include _only_ documents in conflict
        const INCLUDE_NON_CONFLICTED = 0x10;
        /// If false, caller is going to look only at metadata
        /// (docID, revID, sequence, flags)
        const INCLUDE_BODIES        = 0x20;
    }
}

impl Default for DocEnumeratorFlags {
    #[inline]
    fn default() -> Self {
        DocEnumeratorFlags::INCLUDE_BODIES | DocEnumeratorFlags::INCLUDE_NON_CONFLICTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::empty_body;

    fn record(id: &str, seq: u64) -> Arc<DocRecord> {
        Arc::new(DocRecord {
            id: id.into(),
            rev_id: "1-aa".into(),
            sequence: seq,
            deleted: false,
            body: empty_body().unwrap(),
            history: vec!["1-aa".into()],
            expiration: None,
            remote_revs: Default::default(),
        })
    }

    #[test]
    fn test_enumerate_in_order() {
        let mut it = DocEnumerator::new(
            vec![record("a", 2), record("b", 1)],
            CollectionSpec::default(),
        );
        assert!(it.get_doc_info().unwrap().is_none());
        let mut ids = vec![];
        while let Some(item) = it.next().unwrap() {
            let info = item.get_doc_info().unwrap().unwrap();
            ids.push((info.doc_id().to_string(), info.sequence()));
            assert_eq!(info.doc_id(), item.get_doc().unwrap().id());
        }
        assert_eq!(vec![("a".to_string(), 2), ("b".to_string(), 1)], ids);
        assert!(it.get_doc().is_err());
    }

    #[test]
    fn test_empty_enumerator() {
        let mut it = DocEnumerator::new(vec![], CollectionSpec::default());
        assert!(it.next().unwrap().is_none());
        assert!(it.next().unwrap().is_none());
    }
}
