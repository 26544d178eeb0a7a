//! Replication wire protocol.
//!
//! Messages are JSON objects `{"id": n, "body": {"type": ..}}`, one request
//! gets exactly one response with the same `id`. Revision bodies travel as
//! base64 of their fleece encoding, so they are stored on the other side
//! byte for byte. The same codec runs over a websocket and in process for
//! local endpoints.

use crate::{
    blob::{blob_digest, collect_blob_digests},
    collection::CollectionSpec,
    database::DbInner,
    document::{DocRecord, MAX_REV_TREE_DEPTH},
    error::{CblError, CblErrorCode, Error, ErrorDomain, Result},
    logging::{cbl_log, LogDomain},
    storage::{ByteBuf, LogOp, StoredDoc},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::trace;
use serde::{Deserialize, Serialize};
use serde_fleece::FlSliceResult;
use std::{collections::HashSet, sync::Arc};

/// Max number of changes asked at once
pub(crate) const CHANGES_BATCH: u32 = 200;
/// Protocol violation, reported as websocket close code
pub(crate) const PROTOCOL_ERROR: i32 = 1002;

const PEER_CHECKPOINT_PREFIX: &str = "peer-checkpoint/";
const CHANNELS_KEY: &str = "channels";

/// Replication progress of one collection against one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    /// Last local sequence pushed
    pub local: u64,
    /// Last remote sequence pulled
    pub remote: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RevisionMsg {
    pub id: String,
    pub rev_id: String,
    /// `rev_id` first, then ancestors
    pub history: Vec<String>,
    pub deleted: bool,
    /// base64 of fleece encoded body, empty for deletions
    pub body: String,
}

impl RevisionMsg {
    pub(crate) fn from_record(rec: &DocRecord) -> Self {
        Self::with_body(rec, if rec.deleted { None } else { Some(&rec.body) })
    }

    pub(crate) fn with_body(rec: &DocRecord, body: Option<&FlSliceResult>) -> Self {
        Self {
            id: rec.id.clone(),
            rev_id: rec.rev_id.clone(),
            history: rec.history.clone(),
            deleted: rec.deleted,
            body: body.map(|x| BASE64.encode(x.as_bytes())).unwrap_or_default(),
        }
    }

    /// Decoded body, `None` for deletions
    pub(crate) fn decode_body(&self) -> Result<Option<FlSliceResult>> {
        if self.deleted || self.body.is_empty() {
            return Ok(None);
        }
        let data = BASE64
            .decode(&self.body)
            .map_err(|_| Error::from(CblErrorCode::CorruptRevisionData))?;
        FlSliceResult::from_untrusted(data)
            .map(Some)
            .ok_or_else(|| CblErrorCode::CorruptRevisionData.into())
    }

    /// Stored form of revision for local collection, `base` is the local
    /// document this revision replaces
    pub(crate) fn to_stored(
        &self,
        body: Option<&FlSliceResult>,
        sequence: u64,
        base: Option<&DocRecord>,
    ) -> StoredDoc {
        let mut history = self.history.clone();
        if history.first() != Some(&self.rev_id) {
            history.insert(0, self.rev_id.clone());
        }
        history.truncate(MAX_REV_TREE_DEPTH);
        StoredDoc {
            id: self.id.clone(),
            rev_id: self.rev_id.clone(),
            sequence,
            deleted: self.deleted,
            body: ByteBuf(body.map(|x| x.as_bytes().to_vec()).unwrap_or_default()),
            history,
            expiration: base.and_then(|x| x.expiration),
            remote_revs: base.map(|x| x.remote_revs.clone()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ChangeMsg {
    pub seq: u64,
    pub id: String,
    pub rev_id: String,
    pub deleted: bool,
    /// Document left channels the puller asked for
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PutResult {
    pub id: String,
    /// HTTP like status of failure, `None` on success
    pub status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum Request {
    Hello {
        client: String,
    },
    GetCheckpoint {
        id: String,
    },
    SetCheckpoint {
        id: String,
        checkpoint: Checkpoint,
    },
    Changes {
        collection: CollectionSpec,
        since: u64,
        limit: u32,
        channels: Vec<String>,
        doc_ids: Vec<String>,
    },
    /// Which of `revs` (document id, revision id) peer does not have
    RevsDiff {
        collection: CollectionSpec,
        revs: Vec<(String, String)>,
    },
    GetRevs {
        collection: CollectionSpec,
        ids: Vec<String>,
    },
    PutRevs {
        collection: CollectionSpec,
        revs: Vec<RevisionMsg>,
    },
    HasBlobs {
        digests: Vec<String>,
    },
    GetBlob {
        digest: String,
    },
    PutBlob {
        digest: String,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum Response {
    Hello {
        peer_id: String,
        read_only: bool,
    },
    Checkpoint {
        checkpoint: Option<Checkpoint>,
    },
    Changes {
        changes: Vec<ChangeMsg>,
        last_seq: u64,
    },
    Missing {
        items: Vec<String>,
    },
    Revs {
        revs: Vec<RevisionMsg>,
    },
    PutRevs {
        results: Vec<PutResult>,
    },
    Blob {
        data: String,
    },
    Ok,
    Error {
        status: i32,
        message: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

/// HTTP like status describing `err` for the peer
pub(crate) fn error_status(err: &Error) -> i32 {
    let cbl = err.cbl_error();
    match cbl.domain {
        ErrorDomain::WebSocket => cbl.code,
        ErrorDomain::CouchbaseLite => match cbl.code {
            x if x == CblErrorCode::NotFound as i32 => 404,
            x if x == CblErrorCode::Conflict as i32 => 409,
            x if x == CblErrorCode::NotWriteable as i32 => 403,
            x if x == CblErrorCode::InvalidParameter as i32
                || x == CblErrorCode::BadDocId as i32
                || x == CblErrorCode::CorruptRevisionData as i32 =>
            {
                400
            }
            _ => 500,
        },
        _ => 500,
    }
}

pub(crate) fn unexpected(resp: &Response) -> Error {
    cbl_log!(
        LogDomain::Replicator,
        Error,
        "unexpected response from peer: {:?}",
        resp
    );
    Error::Cbl(CblError::websocket(PROTOCOL_ERROR))
}

fn doc_in_channels(rec: &DocRecord, channels: &HashSet<&str>) -> bool {
    let Some(doc_channels) = rec
        .body
        .root_dict()
        .and_then(|x| x.get(CHANNELS_KEY))
        .and_then(|x| x.as_array())
    else {
        return false;
    };
    doc_channels
        .iter()
        .filter_map(|x| x.as_str())
        .any(|x| channels.contains(x))
}

/// Passive side of replication: answers requests of active replicator
/// with content of database
#[derive(Clone)]
pub(crate) struct PassivePeer {
    db: Arc<DbInner>,
    read_only: bool,
}

impl PassivePeer {
    pub(crate) fn new(db: Arc<DbInner>, read_only: bool) -> Self {
        Self { db, read_only }
    }

    /// Decode request, handle it and encode response
    pub(crate) fn handle_message(&self, msg: &str) -> String {
        let (id, body) = match serde_json::from_str::<Envelope<Request>>(msg) {
            Ok(env) => (env.id, self.handle(env.body)),
            Err(err) => (
                0,
                Response::Error {
                    status: 400,
                    message: err.to_string(),
                },
            ),
        };
        serde_json::to_string(&Envelope { id, body }).unwrap_or_else(|err| {
            format!(
                r#"{{"id":{},"body":{{"type":"error","status":500,"message":"{}"}}}}"#,
                id,
                err.to_string().replace(['"', '\\'], "'")
            )
        })
    }

    pub(crate) fn handle(&self, req: Request) -> Response {
        trace!("{}: passive peer got {:?}", self.db.name, req);
        self.try_handle(req).unwrap_or_else(|err| {
            cbl_log!(
                LogDomain::Replicator,
                Info,
                "{}: request failed: {}",
                self.db.name,
                err
            );
            Response::Error {
                status: error_status(&err),
                message: err.to_string(),
            }
        })
    }

    fn check_writeable(&self) -> Result<()> {
        if self.read_only {
            Err(CblError::websocket(403).into())
        } else {
            Ok(())
        }
    }

    fn try_handle(&self, req: Request) -> Result<Response> {
        match req {
            Request::Hello { client } => {
                cbl_log!(
                    LogDomain::Replicator,
                    Info,
                    "{}: replication client {} connected",
                    self.db.name,
                    client
                );
                Ok(Response::Hello {
                    peer_id: self.db.public_uuid().hyphenated().to_string(),
                    read_only: self.read_only,
                })
            }
            Request::GetCheckpoint { id } => {
                let checkpoint = match self.db.get_local(&format!("{PEER_CHECKPOINT_PREFIX}{id}")) {
                    Some(data) => Some(serde_json::from_slice(&data)?),
                    None => None,
                };
                Ok(Response::Checkpoint { checkpoint })
            }
            Request::SetCheckpoint { id, checkpoint } => {
                self.db.put_local(
                    &format!("{PEER_CHECKPOINT_PREFIX}{id}"),
                    Some(serde_json::to_vec(&checkpoint)?),
                )?;
                Ok(Response::Ok)
            }
            Request::Changes {
                collection,
                since,
                limit,
                channels,
                doc_ids,
            } => self.changes(&collection, since, limit, &channels, &doc_ids),
            Request::RevsDiff { collection, revs } => {
                let snap = self.db.current();
                let coll = snap.collection(&collection)?;
                let items = revs
                    .into_iter()
                    .filter(|(id, rev_id)| {
                        coll.docs
                            .get(id)
                            .map_or(true, |x| !x.has_revision(rev_id))
                    })
                    .map(|(id, _)| id)
                    .collect();
                Ok(Response::Missing { items })
            }
            Request::GetRevs { collection, ids } => {
                let snap = self.db.current();
                let coll = snap.collection(&collection)?;
                let revs = ids
                    .iter()
                    .filter_map(|id| coll.docs.get(id))
                    .map(|x| RevisionMsg::from_record(x))
                    .collect();
                Ok(Response::Revs { revs })
            }
            Request::PutRevs { collection, revs } => {
                self.check_writeable()?;
                self.put_revs(&collection, revs)
            }
            Request::HasBlobs { digests } => Ok(Response::Missing {
                items: digests
                    .into_iter()
                    .filter(|x| !self.db.blobs.contains(x))
                    .collect(),
            }),
            Request::GetBlob { digest } => {
                let data = self.db.blobs.read(&digest)?;
                Ok(Response::Blob {
                    data: BASE64.encode(data),
                })
            }
            Request::PutBlob { digest, data } => {
                self.check_writeable()?;
                let data = BASE64
                    .decode(data)
                    .map_err(|_| Error::from(CblErrorCode::CorruptRevisionData))?;
                if blob_digest(&data) != digest {
                    return Err(CblError::websocket(400).into());
                }
                self.db.blobs.install(&digest, &data)?;
                Ok(Response::Ok)
            }
        }
    }

    fn changes(
        &self,
        collection: &CollectionSpec,
        since: u64,
        limit: u32,
        channels: &[String],
        doc_ids: &[String],
    ) -> Result<Response> {
        let snap = self.db.current();
        let coll = snap.collection(collection)?;
        let channels: HashSet<&str> = channels.iter().map(String::as_str).collect();
        let doc_ids: HashSet<&str> = doc_ids.iter().map(String::as_str).collect();
        let mut last_seq = since;
        let mut changes = Vec::new();
        for (seq, id) in coll
            .by_sequence
            .range(since + 1..)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
        {
            last_seq = *seq;
            if !doc_ids.is_empty() && !doc_ids.contains(id.as_str()) {
                continue;
            }
            let Some(rec) = coll.docs.get(id) else {
                continue;
            };
            let removed =
                !rec.deleted && !channels.is_empty() && !doc_in_channels(rec, &channels);
            changes.push(ChangeMsg {
                seq: *seq,
                id: id.clone(),
                rev_id: rec.rev_id.clone(),
                deleted: rec.deleted,
                removed,
            });
        }
        Ok(Response::Changes { changes, last_seq })
    }

    fn put_revs(&self, collection: &CollectionSpec, revs: Vec<RevisionMsg>) -> Result<Response> {
        let mut decoded = Vec::with_capacity(revs.len());
        for rev in revs {
            let body = rev.decode_body()?;
            if let Some(body) = body.as_ref() {
                let mut digests = HashSet::new();
                collect_blob_digests(body.value(), &mut digests);
                if let Some(missing) = digests.iter().find(|x| !self.db.blobs.contains(x)) {
                    cbl_log!(
                        LogDomain::Replicator,
                        Warning,
                        "{}: revision {} of {} refers to missing blob {}",
                        self.db.name,
                        rev.rev_id,
                        rev.id,
                        missing
                    );
                    decoded.push((rev, FlSliceResult::default(), Some(400)));
                    continue;
                }
            }
            decoded.push((rev, body.unwrap_or_default(), None));
        }
        let results = self.db.in_write(|pending| {
            let mut results = Vec::with_capacity(decoded.len());
            for (rev, body, status) in &decoded {
                if status.is_some() {
                    results.push(PutResult {
                        id: rev.id.clone(),
                        status: *status,
                    });
                    continue;
                }
                let existing = pending.snapshot().get_doc(collection, &rev.id)?;
                let status = match existing.as_deref() {
                    Some(cur) if cur.has_revision(&rev.rev_id) => None,
                    Some(cur) if !rev.history.contains(&cur.rev_id) => Some(409),
                    base => {
                        let body = if rev.deleted { None } else { Some(body) };
                        let doc = rev.to_stored(body, pending.next_sequence(), base);
                        pending.apply(
                            LogOp::PutDoc {
                                scope: collection.scope.clone(),
                                collection: collection.name.clone(),
                                doc,
                            },
                            true,
                        )?;
                        None
                    }
                };
                results.push(PutResult {
                    id: rev.id.clone(),
                    status,
                });
            }
            Ok(results)
        })?;
        Ok(Response::PutRevs { results })
    }
}

enum Link {
    Local(PassivePeer),
    #[cfg(feature = "use-tokio-websocket")]
    WebSocket(crate::replicator::tokio_socket::WsClient),
}

/// Active side of protocol, counts bytes of every message
pub(crate) struct Connection {
    link: Link,
    next_id: u64,
    bytes_transferred: u64,
}

impl Connection {
    pub(crate) fn local(peer: PassivePeer) -> Self {
        Self::new(Link::Local(peer))
    }

    #[cfg(feature = "use-tokio-websocket")]
    pub(crate) fn websocket(client: crate::replicator::tokio_socket::WsClient) -> Self {
        Self::new(Link::WebSocket(client))
    }

    fn new(link: Link) -> Self {
        Self {
            link,
            next_id: 1,
            bytes_transferred: 0,
        }
    }

    #[inline]
    pub(crate) fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Send request and wait for its response, error responses become `Err`
    pub(crate) async fn call(&mut self, req: Request) -> Result<Response> {
        let id = self.next_id;
        self.next_id += 1;
        let msg = serde_json::to_string(&Envelope { id, body: req })?;
        self.bytes_transferred += msg.len() as u64;
        let reply = match &mut self.link {
            Link::Local(peer) => peer.handle_message(&msg),
            #[cfg(feature = "use-tokio-websocket")]
            Link::WebSocket(ws) => ws.round_trip(msg).await?,
        };
        self.bytes_transferred += reply.len() as u64;
        let env: Envelope<Response> = serde_json::from_str(&reply)?;
        if env.id != id && env.id != 0 {
            cbl_log!(
                LogDomain::Replicator,
                Error,
                "response id {} does not match request id {}",
                env.id,
                id
            );
            return Err(CblError::websocket(PROTOCOL_ERROR).into());
        }
        match env.body {
            Response::Error { status, message } => {
                cbl_log!(
                    LogDomain::Replicator,
                    Info,
                    "peer returned error {}: {}",
                    status,
                    message
                );
                Err(CblError::websocket(status).into())
            }
            resp => Ok(resp),
        }
    }

    /// Keep connection alive while there is nothing to replicate
    pub(crate) async fn heartbeat(&mut self) -> Result<()> {
        match &mut self.link {
            Link::Local(_) => Ok(()),
            #[cfg(feature = "use-tokio-websocket")]
            Link::WebSocket(ws) => ws.ping().await,
        }
    }

    pub(crate) async fn close(self) {
        match self.link {
            Link::Local(_) => {}
            #[cfg(feature = "use-tokio-websocket")]
            Link::WebSocket(ws) => ws.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DatabaseConfig, DatabaseFlags, MutableDocument};

    fn open_db(dir: &std::path::Path, name: &str) -> Database {
        Database::open(name, Some(DatabaseConfig::new(dir, DatabaseFlags::CREATE))).unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let msg = serde_json::to_string(&Envelope {
            id: 7,
            body: Request::GetCheckpoint { id: "abc".into() },
        })
        .unwrap();
        assert_eq!(r#"{"id":7,"body":{"type":"getCheckpoint","id":"abc"}}"#, msg);
        let env: Envelope<Request> = serde_json::from_str(&msg).unwrap();
        assert_eq!(Request::GetCheckpoint { id: "abc".into() }, env.body);
    }

    #[test]
    fn test_passive_peer_rejects_divergent_revision() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let db = open_db(tmp_dir.path(), "peer");
        let mut doc = MutableDocument::from_json("doc1", r#"{"n": 1}"#).unwrap();
        db.save_document(&mut doc).unwrap();
        let peer = PassivePeer::new(db.inner.clone(), false);
        let spec = CollectionSpec::default();

        let resp = peer.handle(Request::RevsDiff {
            collection: spec.clone(),
            revs: vec![
                ("doc1".into(), doc.revision_id().unwrap().into()),
                ("doc2".into(), "1-aa".into()),
            ],
        });
        assert_eq!(
            Response::Missing {
                items: vec!["doc2".into()]
            },
            resp
        );

        let resp = peer.handle(Request::PutRevs {
            collection: spec.clone(),
            revs: vec![RevisionMsg {
                id: "doc1".into(),
                rev_id: "2-bb".into(),
                history: vec!["2-bb".into(), "1-other".into()],
                deleted: true,
                body: String::new(),
            }],
        });
        assert_eq!(
            Response::PutRevs {
                results: vec![PutResult {
                    id: "doc1".into(),
                    status: Some(409)
                }]
            },
            resp
        );
        assert!(db.get_document("doc1").unwrap().is_some());
    }

    #[test]
    fn test_passive_peer_changes_and_channels() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let db = open_db(tmp_dir.path(), "peer");
        for (id, json) in [
            ("a", r#"{"channels": ["public"]}"#),
            ("b", r#"{"channels": ["private"]}"#),
        ] {
            let mut doc = MutableDocument::from_json(id, json).unwrap();
            db.save_document(&mut doc).unwrap();
        }
        let peer = PassivePeer::new(db.inner.clone(), true);
        let resp = peer.handle(Request::Changes {
            collection: CollectionSpec::default(),
            since: 0,
            limit: CHANGES_BATCH,
            channels: vec!["public".into()],
            doc_ids: vec![],
        });
        let Response::Changes { changes, last_seq } = resp else {
            panic!("unexpected response {:?}", resp);
        };
        assert_eq!(2, last_seq);
        let removed: Vec<(&str, bool)> = changes
            .iter()
            .map(|x| (x.id.as_str(), x.removed))
            .collect();
        assert_eq!(vec![("a", false), ("b", true)], removed);

        let resp = peer.handle(Request::PutBlob {
            digest: blob_digest(b"x"),
            data: BASE64.encode(b"x"),
        });
        assert!(matches!(resp, Response::Error { status: 403, .. }));
    }
}
