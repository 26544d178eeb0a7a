use crate::{
    collection::{install_blobs, CollectionSpec, MAX_CONFLICT_RETRIES},
    database::DbInner,
    document::{child_history, empty_body, new_revision_id, DocRecord, Document, MutableDocument},
    error::{CblErrorCode, Error, Result},
    logging::{cbl_log, LogDomain},
    repl_transport::RevisionMsg,
    storage::{ByteBuf, LogOp, StoredDoc},
    store::PendingCommit,
};
use log::{debug, info};
use serde_fleece::FlSliceResult;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// Decides content of document when pulled revision conflicts with
/// not pushed local one. Arguments: document id, local revision and remote
/// revision (`None` means deleted). Returned document is saved as child of
/// remote revision, `None` saves deletion.
pub type ConflictResolver = Arc<
    dyn Fn(&str, Option<&Document>, Option<&Document>) -> Option<MutableDocument> + Send + Sync,
>;

/// Keeps local revision, deletion if local document was deleted
pub fn default_conflict_resolver(
    _doc_id: &str,
    local: Option<&Document>,
    _remote: Option<&Document>,
) -> Option<MutableDocument> {
    local.map(Document::mutable_copy)
}

/// What to do with pulled revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullAction {
    /// Revision or its descendant is already here
    Skip,
    /// Revision replaces local one
    FastForward,
    Conflict,
}

pub(crate) fn classify(local: Option<&DocRecord>, remote: &RevisionMsg, remote_key: &str) -> PullAction {
    let Some(local) = local else {
        return PullAction::FastForward;
    };
    if local.has_revision(&remote.rev_id) {
        PullAction::Skip
    } else if remote.history.contains(&local.rev_id)
        || local.remote_revs.get(remote_key) == Some(&local.rev_id)
    {
        PullAction::FastForward
    } else {
        PullAction::Conflict
    }
}

/// Write pulled revision as current revision of document
pub(crate) fn store_remote_revision(
    pending: &mut PendingCommit,
    spec: &CollectionSpec,
    remote_key: &str,
    remote: &RevisionMsg,
    body: Option<&FlSliceResult>,
) -> Result<()> {
    let base = pending.snapshot().get_doc(spec, &remote.id)?;
    let mut doc = remote.to_stored(body, pending.next_sequence(), base.as_deref());
    doc.remote_revs
        .insert(remote_key.to_string(), remote.rev_id.clone());
    pending.apply(
        LogOp::PutDoc {
            scope: spec.scope.clone(),
            collection: spec.name.clone(),
            doc,
        },
        true,
    )
}

/// Document as resolver sees remote revision, `None` for deletion
fn remote_document(
    spec: &CollectionSpec,
    remote: &RevisionMsg,
    body: Option<&FlSliceResult>,
) -> Result<Option<Document>> {
    if remote.deleted {
        return Ok(None);
    }
    let body = match body {
        Some(body) => body.clone(),
        None => empty_body()?,
    };
    let record = DocRecord {
        id: remote.id.clone(),
        rev_id: remote.rev_id.clone(),
        sequence: 0,
        deleted: false,
        body,
        history: remote.history.clone(),
        expiration: None,
        remote_revs: Default::default(),
    };
    Ok(Some(Document::new(Arc::new(record), spec.clone())))
}

async fn run_resolver(
    resolver: ConflictResolver,
    doc_id: &str,
    local: Option<Document>,
    remote: Option<Document>,
) -> Result<Option<MutableDocument>> {
    let id = doc_id.to_string();
    let ret = tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| {
            resolver(&id, local.as_ref(), remote.as_ref())
        }))
    })
    .await;
    match ret {
        Ok(Ok(resolved)) => Ok(resolved),
        Ok(Err(_)) | Err(_) => {
            cbl_log!(
                LogDomain::Replicator,
                Error,
                "conflict resolver panicked while resolving {}",
                doc_id
            );
            Err(Error::LogicError(format!(
                "conflict resolver panicked while resolving {}",
                doc_id
            )))
        }
    }
}

enum Resolution {
    Remote,
    Resolved(Option<MutableDocument>),
}

/// Save result of resolution, `Ok(false)` if local document changed
/// since `local_seq` and resolution should be repeated
fn apply_resolution(
    db: &DbInner,
    spec: &CollectionSpec,
    remote_key: &str,
    remote: &RevisionMsg,
    remote_body: Option<&FlSliceResult>,
    local_seq: u64,
    resolution: Resolution,
) -> Result<bool> {
    // `None` keeps remote revision, `Some(None)` writes deletion
    let (body, resolved) = match resolution {
        Resolution::Remote => (None, None),
        Resolution::Resolved(Some(doc)) => {
            if doc.id() != remote.id {
                info!(
                    "resolver returned document {} for {}, using its properties",
                    doc.id(),
                    remote.id
                );
            }
            let unchanged_remote = doc.revision_id() == Some(remote.rev_id.as_str())
                && !doc.properties().is_changed();
            if unchanged_remote {
                (None, None)
            } else {
                (Some(Some(doc.encode_body()?)), Some(doc))
            }
        }
        Resolution::Resolved(None) if remote.deleted => (None, None),
        Resolution::Resolved(None) => (Some(None), None),
    };
    db.in_write(|pending| {
        let cur = pending.snapshot().get_doc(spec, &remote.id)?;
        if cur.as_ref().map_or(0, |x| x.sequence) != local_seq {
            return Ok(false);
        }
        let Some(body) = body else {
            debug!("{}: pulled revision {} becomes current", remote.id, remote.rev_id);
            store_remote_revision(pending, spec, remote_key, remote, remote_body)?;
            return Ok(true);
        };
        let deleted = body.is_none();
        let body = match body {
            Some(body) => {
                if let Some(doc) = resolved.as_ref() {
                    install_blobs(db, doc, &body)?;
                }
                body
            }
            None => empty_body()?,
        };
        let rev_id = new_revision_id(Some(&remote.rev_id), deleted, body.as_bytes());
        let mut parent = remote.to_stored(remote_body, 0, cur.as_deref());
        parent
            .remote_revs
            .insert(remote_key.to_string(), remote.rev_id.clone());
        let parent = DocRecord::from_stored(parent)?;
        let doc = StoredDoc {
            id: remote.id.clone(),
            history: child_history(&rev_id, Some(&parent)),
            rev_id,
            sequence: pending.next_sequence(),
            deleted,
            body: ByteBuf(body.as_bytes().to_vec()),
            expiration: parent.expiration,
            remote_revs: parent.remote_revs,
        };
        pending.apply(
            LogOp::PutDoc {
                scope: spec.scope.clone(),
                collection: spec.name.clone(),
                doc,
            },
            false,
        )?;
        Ok(true)
    })
}

/// Resolve conflict between local document and pulled revision `remote`,
/// local document may change while resolver works, then resolution repeats
pub(crate) async fn resolve_conflict(
    db: Arc<DbInner>,
    spec: CollectionSpec,
    remote_key: Arc<str>,
    resolver: ConflictResolver,
    remote: RevisionMsg,
    remote_body: Option<FlSliceResult>,
) -> Result<()> {
    for retry in 0..MAX_CONFLICT_RETRIES {
        let local = db.current().get_doc(&spec, &remote.id)?;
        let local_seq = local.as_ref().map_or(0, |x| x.sequence);
        let resolution = match classify(local.as_deref(), &remote, &remote_key) {
            PullAction::Skip => return Ok(()),
            PullAction::FastForward => Resolution::Remote,
            PullAction::Conflict => {
                let local_doc = local
                    .filter(|x| !x.deleted)
                    .map(|x| Document::new(x, spec.clone()));
                let remote_doc = remote_document(&spec, &remote, remote_body.as_ref())?;
                Resolution::Resolved(
                    run_resolver(resolver.clone(), &remote.id, local_doc, remote_doc).await?,
                )
            }
        };
        let done = apply_resolution(
            &db,
            &spec,
            &remote_key,
            &remote,
            remote_body.as_ref(),
            local_seq,
            resolution,
        )?;
        if done {
            return Ok(());
        }
        cbl_log!(
            LogDomain::Replicator,
            Info,
            "document {} changed during conflict resolution, retry {}",
            remote.id,
            retry + 1
        );
    }
    cbl_log!(
        LogDomain::Replicator,
        Warning,
        "gave up resolving conflict in {} after {} attempts",
        remote.id,
        MAX_CONFLICT_RETRIES
    );
    Err(CblErrorCode::Conflict.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{document::rev_generation, Database, DatabaseConfig, DatabaseFlags};

    fn remote_rev(id: &str, rev_id: &str, json: &str) -> (RevisionMsg, FlSliceResult) {
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        let body = serde_fleece::to_fl_slice_result(&value).unwrap();
        let msg = RevisionMsg {
            id: id.into(),
            rev_id: rev_id.into(),
            history: vec![rev_id.into(), "1-base".into()],
            deleted: false,
            body: String::new(),
        };
        (msg, body)
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn test_classify_pulled_revision() {
        let (remote, _) = remote_rev("doc1", "2-remote", "{}");
        assert_eq!(PullAction::FastForward, classify(None, &remote, "peer"));
        let mut local = DocRecord {
            id: "doc1".into(),
            rev_id: "2-local".into(),
            sequence: 3,
            deleted: false,
            body: empty_body().unwrap(),
            history: vec!["2-local".into(), "1-base".into()],
            expiration: None,
            remote_revs: Default::default(),
        };
        assert_eq!(PullAction::Conflict, classify(Some(&local), &remote, "peer"));
        local.remote_revs.insert("peer".into(), "2-local".into());
        assert_eq!(PullAction::FastForward, classify(Some(&local), &remote, "peer"));
        local.history.insert(0, "3-newer".into());
        local.history.insert(1, "2-remote".into());
        local.rev_id = "3-newer".into();
        assert_eq!(PullAction::Skip, classify(Some(&local), &remote, "peer"));
    }

    #[test]
    fn test_default_resolver_keeps_local_as_child_of_remote() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            "resolve",
            Some(DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::CREATE)),
        )
        .unwrap();
        let mut doc = crate::MutableDocument::from_json("doc1", r#"{"who": "local"}"#).unwrap();
        db.save_document(&mut doc).unwrap();
        let (remote, body) = remote_rev("doc1", "2-remote", r#"{"who": "remote"}"#);
        let resolver: ConflictResolver = Arc::new(default_conflict_resolver);
        block_on(resolve_conflict(
            db.inner.clone(),
            CollectionSpec::default(),
            Arc::from("peer"),
            resolver,
            remote,
            Some(body),
        ))
        .unwrap();
        let saved = db.get_existing("doc1").unwrap();
        assert_eq!(3, rev_generation(saved.revision_id()));
        assert_eq!(r#"{"who":"local"}"#, saved.to_json());
        assert!(saved.record.has_revision("2-remote"));
        assert_eq!(
            Some(&"2-remote".to_string()),
            saved.record.remote_revs.get("peer")
        );
    }

    #[test]
    fn test_panicking_resolver_fails_only_this_document() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            "resolve",
            Some(DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::CREATE)),
        )
        .unwrap();
        let mut doc = crate::MutableDocument::from_json("doc1", r#"{"n": 1}"#).unwrap();
        db.save_document(&mut doc).unwrap();
        let (remote, body) = remote_rev("doc1", "2-remote", r#"{"n": 2}"#);
        let resolver: ConflictResolver = Arc::new(
            |_: &str, _: Option<&Document>, _: Option<&Document>| -> Option<MutableDocument> {
                panic!("resolver failure")
            },
        );
        let err = block_on(resolve_conflict(
            db.inner.clone(),
            CollectionSpec::default(),
            Arc::from("peer"),
            resolver,
            remote,
            Some(body),
        ))
        .unwrap_err();
        assert!(matches!(err, Error::LogicError(_)));
        assert_eq!(r#"{"n":1}"#, db.get_existing("doc1").unwrap().to_json());
    }
}
