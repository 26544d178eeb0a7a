use crate::{
    collection::{Collection, ConcurrencyControl},
    document::{Document, MutableDocument},
    logging::{cbl_log, LogDomain},
    Database, Result,
};
use std::{marker::PhantomData, ops::Deref};

/// Batch of changes that becomes visible to other threads at once.
/// Writer lock belongs to thread, so the transaction can not be moved
/// to another thread.
pub struct Transaction<'db> {
    db: &'db Database,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl Transaction<'_> {
    pub(crate) fn new(db: &mut Database) -> Result<Transaction> {
        db.inner.begin()?;
        Ok(Transaction {
            db,
            finished: false,
            _not_send: PhantomData,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.end_transaction(true)
    }

    /// Discard all changes, the same as drop but reports errors
    pub fn rollback(mut self) -> Result<()> {
        self.end_transaction(false)
    }

    fn end_transaction(&mut self, commit: bool) -> Result<()> {
        self.finished = true;
        self.db.inner.end(commit)
    }

    /// Save document in default collection
    pub fn save(&mut self, doc: &mut MutableDocument) -> Result<()> {
        self.db.save_document(doc)
    }

    /// Save document in `collection`, it should belong to the same database
    pub fn save_in(&mut self, collection: &Collection, doc: &mut MutableDocument) -> Result<()> {
        collection.save_document(doc)
    }

    pub fn save_with_concurrency_control(
        &mut self,
        doc: &mut MutableDocument,
        cc: ConcurrencyControl,
    ) -> Result<()> {
        self.db.save_document_with_concurrency_control(doc, cc)
    }

    pub fn delete(&mut self, doc: &Document) -> Result<()> {
        self.db.delete_document(doc)
    }

    pub fn purge(&mut self, doc: &Document) -> Result<()> {
        self.db.purge_document(doc)
    }
}

impl Deref for Transaction<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.end_transaction(false) {
                cbl_log!(LogDomain::Database, Error, "rollback failed: {}", err);
            }
        }
    }
}
