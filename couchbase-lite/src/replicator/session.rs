//! One connection to peer: checkpoints, then pull and push of every
//! replicated collection, repeated while replicator is continuous.

use super::{
    call_filter, EndpointKind, ReplicatedDocument, ReplicatedDocumentFlags, ReplicationCollection,
    ReplicationDirection, ReplicatorActivityLevel, ReplicatorConfiguration, ReplicatorProgress,
    Shared,
};
use crate::{
    blob::collect_blob_digests,
    collection::{purge_in_pending, CollectionSpec},
    conflict_resolver::{classify, resolve_conflict, store_remote_revision, PullAction},
    document::{empty_body, DocRecord, Document},
    encryptable::{decrypt_body, encrypt_body},
    error::{CblError, CblErrorCode, Error, Result},
    logging::{cbl_log, LogDomain},
    repl_transport::{
        unexpected, ChangeMsg, Checkpoint, Connection, PassivePeer, Request, Response, RevisionMsg,
        CHANGES_BATCH,
    },
    storage::LogOp,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::FutureExt;
use log::{debug, error, trace};
use serde_fleece::FlSliceResult;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinSet},
};

/// How often continuous replicator looks for remote changes
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);
#[cfg(feature = "use-tokio-websocket")]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CHECKPOINT_PREFIX: &str = "checkpoint/";
const CONFLICT_STATUS: i32 = 409;
const FORBIDDEN_STATUS: i32 = 403;

pub(crate) enum SessionEnd {
    /// One-shot replication is done or replicator was stopped
    Finished,
    /// Went offline, connect again when back online
    Interrupted,
}

pub(crate) async fn connect(config: &ReplicatorConfiguration) -> Result<Connection> {
    match &config.endpoint.kind {
        EndpointKind::LocalDb(db) => Ok(Connection::local(PassivePeer::new(db.clone(), false))),
        #[cfg(feature = "use-tokio-websocket")]
        EndpointKind::Url(url) => {
            let client = tokio::time::timeout(
                CONNECT_TIMEOUT,
                super::tokio_socket::WsClient::connect(config, url),
            )
            .await
            .map_err(|_| {
                Error::from(CblError::network(crate::error::NetworkErrorCode::Timeout))
            })??;
            Ok(Connection::websocket(client))
        }
        #[cfg(not(feature = "use-tokio-websocket"))]
        EndpointKind::Url(_) => Err(CblErrorCode::Unsupported.into()),
    }
}

fn document_flags(deleted: bool) -> ReplicatedDocumentFlags {
    if deleted {
        ReplicatedDocumentFlags::DELETED
    } else {
        ReplicatedDocumentFlags::empty()
    }
}

/// Has local changes that should be pushed to peer identified by `remote_key`
pub(crate) fn is_pending(
    coll: &ReplicationCollection,
    remote_key: &str,
    rec: &Arc<DocRecord>,
) -> bool {
    if !coll.accepts_id(&rec.id) || rec.remote_revs.get(remote_key) == Some(&rec.rev_id) {
        return false;
    }
    // peer never saw the document, nothing to delete there
    if rec.deleted && !rec.remote_revs.contains_key(remote_key) {
        return false;
    }
    match &coll.push_filter {
        Some(filter) => call_filter(
            filter,
            &Document::new(rec.clone(), coll.spec.clone()),
            document_flags(rec.deleted),
        ),
        None => true,
    }
}

fn checkpoint_id(private_uuid: &uuid::Uuid, spec: &CollectionSpec, remote_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(private_uuid.as_bytes());
    hasher.update(spec.to_string().as_bytes());
    hasher.update(remote_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Document as pull filter sees it
fn pulled_document(
    spec: &CollectionSpec,
    rev: &RevisionMsg,
    body: Option<&FlSliceResult>,
) -> Result<Document> {
    let body = match body {
        Some(body) => body.clone(),
        None => empty_body()?,
    };
    let record = DocRecord {
        id: rev.id.clone(),
        rev_id: rev.rev_id.clone(),
        sequence: 0,
        deleted: rev.deleted,
        body,
        history: rev.history.clone(),
        expiration: None,
        remote_revs: Default::default(),
    };
    Ok(Document::new(Arc::new(record), spec.clone()))
}

fn replicated(
    spec: &CollectionSpec,
    id: &str,
    flags: ReplicatedDocumentFlags,
    error: Option<Error>,
) -> ReplicatedDocument {
    ReplicatedDocument {
        collection: spec.clone(),
        id: id.into(),
        flags,
        error,
    }
}

struct CollectionState {
    coll: ReplicationCollection,
    checkpoint_id: String,
    checkpoint: Checkpoint,
    saved: Checkpoint,
    /// Remote sequence reached by this session
    pulled_to: u64,
    /// Local sequence reached by this session
    pushed_to: u64,
    /// Remote sequences of documents that failed or are still resolving,
    /// next session pulls them again
    pull_held: BTreeMap<u64, String>,
    /// Local sequences of documents that were not pushed
    push_held: BTreeMap<u64, String>,
    /// Documents with conflict resolution in progress
    resolving: HashSet<String>,
}

impl CollectionState {
    /// Checkpoint never passes a document that has to be replicated again
    fn current_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            local: held_at(&self.push_held, self.pushed_to),
            remote: held_at(&self.pull_held, self.pulled_to),
        }
    }
}

fn held_at(held: &BTreeMap<u64, String>, reached: u64) -> u64 {
    held.keys()
        .next()
        .map_or(reached, |seq| reached.min(seq.saturating_sub(1)))
}

fn release(held: &mut BTreeMap<u64, String>, id: &str) {
    held.retain(|_, x| x != id);
}

/// Pulled revision after decryption and pull filter
enum Pulled {
    Accepted(Option<FlSliceResult>),
    Rejected,
}

/// Outcome of conflict resolution running in background
struct Resolved {
    idx: usize,
    id: String,
    deleted: bool,
    seq: u64,
    result: Result<()>,
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    conn: Connection,
    collections: Vec<CollectionState>,
    resolutions: JoinSet<Resolved>,
    /// Resolution saved local revision since pass started
    resolved_local: bool,
    base_progress: ReplicatorProgress,
    found: u64,
    processed: u64,
    transferred: u64,
    last_io: Instant,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, conn: Connection) -> Self {
        let base_progress = shared.progress();
        Self {
            shared,
            conn,
            collections: Vec::new(),
            resolutions: JoinSet::new(),
            resolved_local: false,
            base_progress,
            found: 0,
            processed: 0,
            transferred: 0,
            last_io: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self, attempt: &mut u32) -> Result<SessionEnd> {
        let result = self.replicate(attempt).await;
        self.wait_resolutions().await;
        self.publish_progress();
        self.conn.close().await;
        result
    }

    async fn replicate(&mut self, attempt: &mut u32) -> Result<SessionEnd> {
        let shared = self.shared.clone();
        let config = &shared.config;
        let client = config.db.public_uuid().hyphenated().to_string();
        match self.call(Request::Hello { client }).await? {
            Response::Hello { peer_id, read_only } => {
                cbl_log!(
                    LogDomain::Replicator,
                    Info,
                    "{}: connected to peer {}{}",
                    config.db.name,
                    peer_id,
                    if read_only { " (read only)" } else { "" }
                );
            }
            other => return Err(unexpected(&other)),
        }

        let reset = shared.take_reset_checkpoint();
        for coll in config.collections() {
            let state = self.load_checkpoint(coll, reset).await?;
            self.collections.push(state);
        }

        let commits = Arc::new(Notify::new());
        config.db.notifier.add_commit_waiter(Arc::downgrade(&commits));

        loop {
            self.resolved_local = false;
            for idx in 0..self.collections.len() {
                if config.replicator_type.pull() {
                    self.pull_collection(idx).await?;
                }
                self.poll_resolutions();
                if config.replicator_type.push() {
                    self.push_collection(idx).await?;
                }
                if shared.stop_requested() {
                    return Ok(SessionEnd::Finished);
                }
            }
            if !config.continuous {
                self.wait_resolutions().await;
                if self.resolved_local && config.replicator_type.push() {
                    trace!("{}: push resolved conflicts", config.db.name);
                    continue;
                }
            }
            for idx in 0..self.collections.len() {
                self.save_checkpoint(idx).await?;
            }
            self.found = 0;
            self.processed = 0;
            self.publish_progress();
            if !config.continuous {
                return Ok(SessionEnd::Finished);
            }
            if self.resolutions.is_empty() {
                shared.set_activity(ReplicatorActivityLevel::Idle, None);
                *attempt = 0;
            }

            let resolved = tokio::select! {
                done = self.resolutions.join_next(), if !self.resolutions.is_empty() => done,
                _ = commits.notified() => None,
                _ = shared.wake.notified() => None,
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => None,
            };
            if let Some(done) = resolved {
                self.finish_resolution(done);
            }
            if shared.stop_requested() {
                return Ok(SessionEnd::Finished);
            }
            if !shared.online() {
                return Ok(SessionEnd::Interrupted);
            }
            if self.last_io.elapsed() >= config.heartbeat {
                trace!("{}: heartbeat", config.db.name);
                self.conn.heartbeat().await?;
                self.last_io = Instant::now();
            }
        }
    }

    async fn call(&mut self, req: Request) -> Result<Response> {
        let ret = self.conn.call(req).await;
        self.last_io = Instant::now();
        ret
    }

    fn publish_progress(&self) {
        let complete = if self.found == 0 {
            1.0
        } else {
            (self.processed as f32 / self.found as f32).min(1.0)
        };
        self.shared.set_progress(ReplicatorProgress {
            complete,
            document_count: self.base_progress.document_count + self.transferred,
            bytes_transferred: self.base_progress.bytes_transferred
                + self.conn.bytes_transferred(),
        });
    }

    async fn load_checkpoint(
        &mut self,
        coll: ReplicationCollection,
        reset: bool,
    ) -> Result<CollectionState> {
        let db = self.shared.config.db.clone();
        let id = checkpoint_id(&db.private_uuid(), &coll.spec, &self.shared.remote_key);
        let local: Option<Checkpoint> = match db.get_local(&format!("{CHECKPOINT_PREFIX}{id}")) {
            Some(data) => Some(serde_json::from_slice(&data)?),
            None => None,
        };
        let remote = match self.call(Request::GetCheckpoint { id: id.clone() }).await? {
            Response::Checkpoint { checkpoint } => checkpoint,
            other => return Err(unexpected(&other)),
        };
        let checkpoint = if reset {
            Checkpoint::default()
        } else if local == remote {
            local.unwrap_or_default()
        } else {
            cbl_log!(
                LogDomain::Replicator,
                Info,
                "{}: checkpoint of {} differs from peer ({:?} vs {:?}), starting over",
                db.name,
                coll.spec,
                local,
                remote
            );
            Checkpoint::default()
        };
        debug!("{}: {} starts from {:?}", db.name, coll.spec, checkpoint);
        Ok(CollectionState {
            coll,
            checkpoint_id: id,
            checkpoint,
            saved: remote.unwrap_or_default(),
            pulled_to: checkpoint.remote,
            pushed_to: checkpoint.local,
            pull_held: BTreeMap::new(),
            push_held: BTreeMap::new(),
            resolving: HashSet::new(),
        })
    }

    async fn save_checkpoint(&mut self, idx: usize) -> Result<()> {
        let state = &mut self.collections[idx];
        state.checkpoint = state.current_checkpoint();
        if state.checkpoint == state.saved {
            return Ok(());
        }
        let id = state.checkpoint_id.clone();
        let checkpoint = state.checkpoint;
        match self
            .call(Request::SetCheckpoint {
                id: id.clone(),
                checkpoint,
            })
            .await?
        {
            Response::Ok => {}
            other => return Err(unexpected(&other)),
        }
        self.shared.config.db.put_local(
            &format!("{CHECKPOINT_PREFIX}{id}"),
            Some(serde_json::to_vec(&checkpoint)?),
        )?;
        self.collections[idx].saved = checkpoint;
        Ok(())
    }

    /// Handle conflict resolutions that are already done
    fn poll_resolutions(&mut self) {
        while let Some(Some(done)) = self.resolutions.join_next().now_or_never() {
            self.finish_resolution(done);
        }
    }

    async fn wait_resolutions(&mut self) {
        if !self.resolutions.is_empty() {
            debug!(
                "{}: waiting for {} conflict resolution(s)",
                self.shared.config.db.name,
                self.resolutions.len()
            );
        }
        while let Some(done) = self.resolutions.join_next().await {
            self.finish_resolution(done);
        }
    }

    fn finish_resolution(&mut self, done: std::result::Result<Resolved, JoinError>) {
        let done = match done {
            Ok(done) => done,
            Err(err) => {
                error!("conflict resolution task failed: {}", err);
                return;
            }
        };
        let state = &mut self.collections[done.idx];
        state.resolving.remove(&done.id);
        let error = match done.result {
            Ok(()) => {
                if state.pull_held.get(&done.seq) == Some(&done.id) {
                    state.pull_held.remove(&done.seq);
                }
                self.transferred += 1;
                self.resolved_local = true;
                None
            }
            Err(err) => {
                state.pull_held.insert(done.seq, done.id.clone());
                Some(err)
            }
        };
        let doc = replicated(&state.coll.spec, &done.id, document_flags(done.deleted), error);
        self.shared
            .report_documents(ReplicationDirection::Pull, &[doc]);
        self.publish_progress();
    }

    async fn pull_collection(&mut self, idx: usize) -> Result<()> {
        let shared = self.shared.clone();
        let db = shared.config.db.clone();
        let coll = self.collections[idx].coll.clone();
        loop {
            if shared.stop_requested() {
                return Ok(());
            }
            let since = self.collections[idx].pulled_to;
            let req = Request::Changes {
                collection: coll.spec.clone(),
                since,
                limit: CHANGES_BATCH,
                channels: coll.channels.clone(),
                doc_ids: coll.document_ids.clone(),
            };
            let (changes, last_seq) = match self.call(req).await? {
                Response::Changes { changes, last_seq } => (changes, last_seq),
                other => return Err(unexpected(&other)),
            };
            if changes.is_empty() {
                if last_seq > since {
                    self.collections[idx].pulled_to = last_seq;
                    self.save_checkpoint(idx).await?;
                }
                return Ok(());
            }
            shared.set_activity(ReplicatorActivityLevel::Busy, None);
            self.found += changes.len() as u64;

            let mut report = Vec::new();
            let mut wanted = Vec::new();
            let mut seqs = HashMap::new();
            {
                let snap = db.current();
                for change in changes {
                    if change.removed {
                        report.push(self.remove_access(&coll, &change)?);
                        self.processed += 1;
                        continue;
                    }
                    let known = snap
                        .get_doc(&coll.spec, &change.id)?
                        .map_or(false, |x| x.has_revision(&change.rev_id));
                    if known {
                        self.processed += 1;
                    } else {
                        seqs.insert(change.id.clone(), change.seq);
                        wanted.push(change.id);
                    }
                }
            }
            if !wanted.is_empty() {
                let req = Request::GetRevs {
                    collection: coll.spec.clone(),
                    ids: wanted,
                };
                let revs = match self.call(req).await? {
                    Response::Revs { revs } => revs,
                    other => return Err(unexpected(&other)),
                };
                self.apply_pulled(idx, revs, &seqs, &mut report).await?;
            }
            shared.report_documents(ReplicationDirection::Pull, &report);

            self.collections[idx].pulled_to = last_seq;
            self.save_checkpoint(idx).await?;
            self.publish_progress();
        }
    }

    /// Document is not in our channels anymore
    fn remove_access(
        &mut self,
        coll: &ReplicationCollection,
        change: &ChangeMsg,
    ) -> Result<ReplicatedDocument> {
        let config = &self.shared.config;
        if !config.disable_auto_purge {
            config.db.in_write(|pending| {
                if pending.snapshot().get_doc(&coll.spec, &change.id)?.is_some() {
                    purge_in_pending(pending, &coll.spec, &change.id)
                } else {
                    Ok(())
                }
            })?;
            debug!("{}: purged {}, access removed", config.db.name, change.id);
        }
        Ok(replicated(
            &coll.spec,
            &change.id,
            document_flags(change.deleted) | ReplicatedDocumentFlags::ACCESS_REMOVED,
            None,
        ))
    }

    /// Write fast-forward revisions, conflicts go to background resolution.
    /// `seqs` maps document ids to their remote sequences.
    async fn apply_pulled(
        &mut self,
        idx: usize,
        revs: Vec<RevisionMsg>,
        seqs: &HashMap<String, u64>,
        report: &mut Vec<ReplicatedDocument>,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let db = shared.config.db.clone();
        let coll = self.collections[idx].coll.clone();
        let seq_of = |id: &str| seqs.get(id).copied().unwrap_or_default();
        let mut accepted = Vec::with_capacity(revs.len());
        for rev in revs {
            self.processed += 1;
            let error = match self.prepare_pulled(&coll, &rev).await {
                Ok(Pulled::Accepted(body)) => {
                    accepted.push((rev, body));
                    continue;
                }
                Ok(Pulled::Rejected) => {
                    debug!("{}: pull filter rejected {}", db.name, rev.id);
                    Error::from(CblError::websocket(FORBIDDEN_STATUS))
                }
                Err(err) if err.cbl_error().is_transient() => return Err(err),
                Err(err) => {
                    cbl_log!(
                        LogDomain::Replicator,
                        Info,
                        "{}: pulled {} failed: {}",
                        db.name,
                        rev.id,
                        err
                    );
                    self.collections[idx]
                        .pull_held
                        .insert(seq_of(&rev.id), rev.id.clone());
                    err
                }
            };
            report.push(replicated(
                &coll.spec,
                &rev.id,
                document_flags(rev.deleted),
                Some(error),
            ));
        }

        let remote_key = shared.remote_key.clone();
        let mut conflicts = Vec::new();
        let applied = db.in_write(|pending| {
            let mut applied = Vec::new();
            for (rev, body) in accepted {
                let local = pending.snapshot().get_doc(&coll.spec, &rev.id)?;
                match classify(local.as_deref(), &rev, &remote_key) {
                    PullAction::Skip => {}
                    PullAction::FastForward => {
                        store_remote_revision(pending, &coll.spec, &remote_key, &rev, body.as_ref())?;
                        applied.push(replicated(
                            &coll.spec,
                            &rev.id,
                            document_flags(rev.deleted),
                            None,
                        ));
                    }
                    PullAction::Conflict => conflicts.push((rev, body)),
                }
            }
            Ok(applied)
        })?;
        let state = &mut self.collections[idx];
        for doc in &applied {
            release(&mut state.pull_held, &doc.id);
        }
        self.transferred += applied.len() as u64;
        report.extend(applied);

        if conflicts.is_empty() {
            return Ok(());
        }
        debug!("{}: resolving {} conflict(s)", db.name, conflicts.len());
        let resolver = coll.resolver();
        for (rev, body) in conflicts {
            let seq = seq_of(&rev.id);
            let state = &mut self.collections[idx];
            state.pull_held.insert(seq, rev.id.clone());
            if !state.resolving.insert(rev.id.clone()) {
                debug!("{}: {} is being resolved already", db.name, rev.id);
                continue;
            }
            let id = rev.id.clone();
            let deleted = rev.deleted;
            let resolution = resolve_conflict(
                db.clone(),
                coll.spec.clone(),
                remote_key.clone(),
                resolver.clone(),
                rev,
                body,
            );
            self.resolutions.spawn(async move {
                Resolved {
                    idx,
                    id,
                    deleted,
                    seq,
                    result: resolution.await,
                }
            });
        }
        Ok(())
    }

    /// Decoded and decrypted body of pulled revision, with its blobs
    /// downloaded, or rejection by pull filter
    async fn prepare_pulled(
        &mut self,
        coll: &ReplicationCollection,
        rev: &RevisionMsg,
    ) -> Result<Pulled> {
        let shared = self.shared.clone();
        let config = &shared.config;
        let mut body = rev.decode_body()?;
        if let Some(encrypted) = &body {
            if let Some(plain) = decrypt_body(
                &coll.spec,
                &rev.id,
                encrypted,
                config.property_decryptor.as_ref(),
            )? {
                body = Some(plain);
            }
        }
        if let Some(body) = &body {
            let mut digests = HashSet::new();
            collect_blob_digests(body.value(), &mut digests);
            for digest in digests {
                if config.db.blobs.contains(&digest) {
                    continue;
                }
                let data = match self.call(Request::GetBlob { digest: digest.clone() }).await? {
                    Response::Blob { data } => data,
                    other => return Err(unexpected(&other)),
                };
                let data = BASE64
                    .decode(data)
                    .map_err(|_| Error::from(CblErrorCode::CorruptRevisionData))?;
                config.db.blobs.install(&digest, &data)?;
            }
        }
        if let Some(filter) = &coll.pull_filter {
            let doc = pulled_document(&coll.spec, rev, body.as_ref())?;
            if !call_filter(filter, &doc, document_flags(rev.deleted)) {
                return Ok(Pulled::Rejected);
            }
        }
        Ok(Pulled::Accepted(body))
    }

    async fn push_collection(&mut self, idx: usize) -> Result<()> {
        let shared = self.shared.clone();
        let db = shared.config.db.clone();
        let coll = self.collections[idx].coll.clone();
        loop {
            if shared.stop_requested() {
                return Ok(());
            }
            let since = self.collections[idx].pushed_to;
            let (batch, last_seq) = {
                let state = &mut self.collections[idx];
                let snap = db.current();
                let data = snap.collection(&coll.spec)?;
                let mut last_seq = since;
                let mut batch = Vec::new();
                for (seq, id) in data
                    .by_sequence
                    .range(since.saturating_add(1)..)
                    .take(CHANGES_BATCH as usize)
                {
                    last_seq = *seq;
                    let Some(rec) = data.docs.get(id) else {
                        continue;
                    };
                    if !is_pending(&coll, &shared.remote_key, rec) {
                        continue;
                    }
                    if state.resolving.contains(id) {
                        // resolution writes a new revision, unless it fails
                        state.push_held.insert(*seq, id.clone());
                    } else {
                        batch.push(rec.clone());
                    }
                }
                (batch, last_seq)
            };
            if last_seq == since {
                return Ok(());
            }
            if !batch.is_empty() {
                self.push_batch(idx, batch).await?;
            }
            self.collections[idx].pushed_to = last_seq;
            self.save_checkpoint(idx).await?;
            self.publish_progress();
        }
    }

    async fn push_batch(&mut self, idx: usize, batch: Vec<Arc<DocRecord>>) -> Result<()> {
        let shared = self.shared.clone();
        let config = &shared.config;
        let coll = self.collections[idx].coll.clone();
        shared.set_activity(ReplicatorActivityLevel::Busy, None);
        self.found += batch.len() as u64;

        let req = Request::RevsDiff {
            collection: coll.spec.clone(),
            revs: batch
                .iter()
                .map(|x| (x.id.clone(), x.rev_id.clone()))
                .collect(),
        };
        let missing: HashSet<String> = match self.call(req).await? {
            Response::Missing { items } => items.into_iter().collect(),
            other => return Err(unexpected(&other)),
        };

        let mut report = Vec::new();
        let mut acked = Vec::new();
        let mut failed = Vec::new();
        let mut outgoing = Vec::new();
        let mut messages = Vec::new();
        let mut digests = HashSet::new();
        for rec in batch {
            self.processed += 1;
            if !missing.contains(&rec.id) {
                acked.push((rec.id.clone(), rec.rev_id.clone()));
                continue;
            }
            let body = if rec.deleted {
                None
            } else {
                match encrypt_body(
                    &coll.spec,
                    &rec.id,
                    &rec.body,
                    config.property_encryptor.as_ref(),
                ) {
                    Ok(encrypted) => Some(encrypted.unwrap_or_else(|| rec.body.clone())),
                    Err(err) => {
                        cbl_log!(
                            LogDomain::Replicator,
                            Warning,
                            "{}: can not encrypt {}: {}",
                            config.db.name,
                            rec.id,
                            err
                        );
                        report.push(replicated(&coll.spec, &rec.id, document_flags(false), Some(err)));
                        failed.push((rec.sequence, rec.id.clone()));
                        continue;
                    }
                }
            };
            if let Some(body) = &body {
                collect_blob_digests(body.value(), &mut digests);
            }
            messages.push(RevisionMsg::with_body(&rec, body.as_ref()));
            outgoing.push(rec);
        }

        if !digests.is_empty() {
            self.push_blobs(digests.into_iter().collect()).await?;
        }

        if !messages.is_empty() {
            let req = Request::PutRevs {
                collection: coll.spec.clone(),
                revs: messages,
            };
            let results: HashMap<String, Option<i32>> = match self.call(req).await? {
                Response::PutRevs { results } => {
                    results.into_iter().map(|x| (x.id, x.status)).collect()
                }
                other => return Err(unexpected(&other)),
            };
            for rec in outgoing {
                let error = match results.get(&rec.id) {
                    Some(None) => {
                        acked.push((rec.id.clone(), rec.rev_id.clone()));
                        self.transferred += 1;
                        None
                    }
                    Some(Some(CONFLICT_STATUS)) => Some(Error::from(CblErrorCode::Conflict)),
                    Some(Some(status)) => Some(CblError::websocket(*status).into()),
                    None => Some(CblError::websocket(crate::repl_transport::PROTOCOL_ERROR).into()),
                };
                if error.is_some() {
                    failed.push((rec.sequence, rec.id.clone()));
                }
                report.push(replicated(&coll.spec, &rec.id, document_flags(rec.deleted), error));
            }
        }

        let state = &mut self.collections[idx];
        for (id, _) in &acked {
            release(&mut state.push_held, id);
        }
        state.push_held.extend(failed);

        if !acked.is_empty() {
            let remote_key = shared.remote_key.to_string();
            config.db.in_write(|pending| {
                for (id, rev_id) in acked {
                    if pending.snapshot().get_doc(&coll.spec, &id)?.is_none() {
                        continue;
                    }
                    pending.apply(
                        LogOp::SetRemoteRev {
                            scope: coll.spec.scope.clone(),
                            collection: coll.spec.name.clone(),
                            id,
                            remote: remote_key.clone(),
                            rev_id,
                        },
                        false,
                    )?;
                }
                Ok(())
            })?;
        }
        shared.report_documents(ReplicationDirection::Push, &report);
        Ok(())
    }

    /// Upload blobs peer does not have yet
    async fn push_blobs(&mut self, mut digests: Vec<String>) -> Result<()> {
        digests.sort();
        let missing = match self.call(Request::HasBlobs { digests }).await? {
            Response::Missing { items } => items,
            other => return Err(unexpected(&other)),
        };
        for digest in missing {
            let data = match self.shared.config.db.blobs.read(&digest) {
                Ok(data) => data,
                Err(err) => {
                    cbl_log!(
                        LogDomain::Replicator,
                        Warning,
                        "blob {} is not available locally: {}",
                        digest,
                        err
                    );
                    continue;
                }
            };
            let req = Request::PutBlob {
                digest,
                data: BASE64.encode(data),
            };
            match self.call(req).await? {
                Response::Ok => {}
                other => return Err(unexpected(&other)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DatabaseConfig, DatabaseFlags, MutableDocument};

    #[test]
    fn test_checkpoint_id_depends_on_peer_and_collection() {
        let uuid = uuid::Uuid::new_v4();
        let spec = CollectionSpec::default();
        let a = checkpoint_id(&uuid, &spec, "ws://a/db");
        assert_eq!(64, a.len());
        assert_eq!(a, checkpoint_id(&uuid, &spec, "ws://a/db"));
        assert_ne!(a, checkpoint_id(&uuid, &spec, "ws://b/db"));
        assert_ne!(a, checkpoint_id(&uuid, &CollectionSpec::new("other", "_default"), "ws://a/db"));
    }

    #[test]
    fn test_checkpoint_stops_before_failed_documents() {
        let mut held = BTreeMap::new();
        assert_eq!(40, held_at(&held, 40));
        held.insert(17, "b".to_string());
        held.insert(12, "a".to_string());
        assert_eq!(11, held_at(&held, 40));
        assert_eq!(5, held_at(&held, 5));
        release(&mut held, "a");
        assert_eq!(16, held_at(&held, 40));
        release(&mut held, "b");
        assert_eq!(40, held_at(&held, 40));
    }

    #[test]
    fn test_pending_documents() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            "pending",
            Some(DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::CREATE)),
        )
        .unwrap();
        let mut doc = MutableDocument::new_with_id("a");
        db.save_document(&mut doc).unwrap();
        let rec = db
            .inner
            .current()
            .get_doc(&CollectionSpec::default(), "a")
            .unwrap()
            .unwrap();
        let coll = ReplicationCollection::with_spec(CollectionSpec::default());
        assert!(is_pending(&coll, "peer", &rec));

        let only_b = coll.clone().with_document_ids(vec!["b".into()]);
        assert!(!is_pending(&only_b, "peer", &rec));

        let reject_all = coll.clone().with_push_filter(|_, _| false);
        assert!(!is_pending(&reject_all, "peer", &rec));

        let mut pushed = (*rec).clone();
        pushed.remote_revs.insert("peer".into(), pushed.rev_id.clone());
        assert!(!is_pending(&coll, "peer", &Arc::new(pushed.clone())));
        assert!(is_pending(&coll, "other-peer", &Arc::new(pushed)));

        let mut never_pushed_tombstone = (*rec).clone();
        never_pushed_tombstone.deleted = true;
        assert!(!is_pending(&coll, "peer", &Arc::new(never_pushed_tombstone)));
    }
}
