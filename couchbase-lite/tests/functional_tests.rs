use couchbase_lite::{
    fallible_streaming_iterator::FallibleStreamingIterator, Authenticator, Blob, CblError,
    CblErrorCode, ConcurrencyControl, Database, DatabaseConfig, DatabaseFlags,
    DocEnumeratorFlags, Encryptable, EncryptedValue, EncryptionKey, Endpoint,
    FullTextIndexConfiguration, ListenerToken, MaintenanceType, MutableDocument, NetworkErrorCode,
    QueryLanguage, ReplicatedDocument, ReplicationDirection, Replicator,
    ReplicatorActivityLevel, ReplicatorConfiguration, ReplicatorStatus, ReplicatorType,
    UrlEndpointListener, UrlEndpointListenerConfiguration, ValueIndexConfiguration,
};
use serde::Serialize;
use std::{
    sync::{mpsc, Mutex},
    thread,
    time::{Duration, Instant},
};
use tempfile::{tempdir, TempDir};

const TIMEOUT: Duration = Duration::from_secs(30);

fn open_db(tmp_dir: &TempDir, name: &str) -> Database {
    Database::open(
        name,
        Some(DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::CREATE)),
    )
    .expect("Can not open database")
}

fn save_json(db: &Database, id: &str, json: &str) {
    let mut doc = MutableDocument::from_json(id, json).unwrap();
    db.save_document(&mut doc).unwrap();
}

fn doc_json(db: &Database, id: &str) -> Option<String> {
    db.get_document(id).unwrap().map(|x| x.to_json())
}

fn wait_for(repl: &Replicator, level: ReplicatorActivityLevel) -> ReplicatorStatus {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let status = repl.status();
        if status.activity == level {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "replicator did not reach {:?}: {:?}",
            level,
            status
        );
        thread::sleep(Duration::from_millis(10));
    }
}

fn replicate_once(config: ReplicatorConfiguration) -> ReplicatorStatus {
    replicate_from_start(config, false)
}

fn replicate_from_start(config: ReplicatorConfiguration, reset: bool) -> ReplicatorStatus {
    let repl = Replicator::new(config).unwrap();
    repl.start(reset).unwrap();
    wait_for(&repl, ReplicatorActivityLevel::Stopped)
}

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter().map(|x| x ^ 0x2a).collect()
}

#[test]
fn test_write_read() {
    let _ = env_logger::try_init();
    let tmp_dir = tempdir().expect("Can not create tmp directory");
    println!("we create tempdir at {}", tmp_dir.path().display());
    let db_path = tmp_dir.path().join("a.cblite2");
    {
        let db = Database::open_with_flags(&db_path, DatabaseFlags::CREATE).unwrap();
        save_json(&db, "doc1", r#"{"name":"Alice","age":30}"#);
        assert_eq!(1, db.document_count());
        db.close().unwrap();
    }
    {
        let db = Database::open_with_flags(&db_path, DatabaseFlags::empty()).unwrap();
        let doc = db.get_existing("doc1").unwrap();
        assert_eq!(r#"{"age":30,"name":"Alice"}"#, doc.to_json());
        assert!(doc.revision_id().starts_with("1-"));
    }
    tmp_dir.close().expect("Can not close tmp_dir");
}

#[test]
fn test_purge_twice_is_ok() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "purge");
    save_json(&db, "doc1", r#"{"a":1}"#);
    let doc = db.get_existing("doc1").unwrap();
    db.purge_document(&doc).unwrap();
    db.purge_document(&doc).unwrap();
    assert!(db.get_document("doc1").unwrap().is_none());
    let err = db.purge_document_by_id("doc1").unwrap_err();
    assert!(err.is(CblErrorCode::NotFound));
}

#[test]
fn test_concurrency_control() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "concurrency");
    save_json(&db, "doc1", r#"{"n":0}"#);
    let mut first = db.get_mutable_document("doc1").unwrap().unwrap();
    let mut second = db.get_mutable_document("doc1").unwrap().unwrap();
    first.properties_mut().set_i64("n", 1);
    db.save_document(&mut first).unwrap();

    second.properties_mut().set_i64("n", 2);
    let err = db
        .save_document_with_concurrency_control(&mut second, ConcurrencyControl::FailOnConflict)
        .unwrap_err();
    assert!(err.is(CblErrorCode::Conflict));
    assert_eq!(Some(r#"{"n":1}"#.to_string()), doc_json(&db, "doc1"));

    let mut calls = 0;
    db.save_document_with_conflict_handler(&mut second, |doc, stored| {
        calls += 1;
        let stored_n = stored
            .and_then(|x| x.properties())
            .and_then(|x| x.get("n"))
            .map_or(0, |x| x.as_i64());
        doc.properties_mut().set_i64("n", stored_n + 10);
        true
    })
    .unwrap();
    assert_eq!(1, calls);
    assert_eq!(Some(r#"{"n":11}"#.to_string()), doc_json(&db, "doc1"));
    assert!(db
        .get_existing("doc1")
        .unwrap()
        .revision_id()
        .starts_with("3-"));
}

#[test]
fn test_transaction_rollback() {
    let tmp_dir = tempdir().unwrap();
    let mut db = open_db(&tmp_dir, "trans");
    {
        let mut trans = db.transaction().unwrap();
        let mut doc = MutableDocument::from_json("a", r#"{"x":1}"#).unwrap();
        trans.save(&mut doc).unwrap();
        trans.rollback().unwrap();
    }
    assert!(db.get_document("a").unwrap().is_none());
    {
        let mut trans = db.transaction().unwrap();
        let mut doc = MutableDocument::from_json("b", r#"{"x":2}"#).unwrap();
        trans.save(&mut doc).unwrap();
        trans.commit().unwrap();
    }
    assert_eq!(Some(r#"{"x":2}"#.to_string()), doc_json(&db, "b"));
}

#[test]
fn test_change_listener() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "listener");
    let (tx, rx) = mpsc::channel::<Vec<String>>();
    let token = db
        .add_change_listener(move |change| {
            let _ = tx.send(change.doc_ids().to_vec());
        })
        .unwrap();
    save_json(&db, "doc1", r#"{"a":1}"#);
    assert_eq!(vec!["doc1".to_string()], rx.recv_timeout(TIMEOUT).unwrap());
    token.remove();
    save_json(&db, "doc2", r#"{"a":2}"#);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_notifications_follow_commit_order() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "order");
    let (tx, rx) = mpsc::channel::<Vec<String>>();
    let _token = db
        .add_change_listener(move |change| {
            let _ = tx.send(change.doc_ids().to_vec());
        })
        .unwrap();
    let writers: Vec<_> = (0..2)
        .map(|w| {
            let dir = tmp_dir.path().to_path_buf();
            thread::spawn(move || {
                // same files, same engine as `db`
                let db = Database::open(
                    "order",
                    Some(DatabaseConfig::new(&dir, DatabaseFlags::CREATE)),
                )
                .unwrap();
                for i in 0..50 {
                    save_json(&db, &format!("w{w}-{i}"), r#"{"a":1}"#);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let mut ids = Vec::new();
    while ids.len() < 100 {
        ids.extend(rx.recv_timeout(TIMEOUT).unwrap());
    }
    let seqs: Vec<u64> = ids
        .iter()
        .map(|id| db.get_existing(id).unwrap().sequence())
        .collect();
    assert!(seqs.windows(2).all(|x| x[0] < x[1]), "{:?}", seqs);
}

#[test]
fn test_n1ql_query_with_parameters() {
    #[derive(Serialize)]
    struct Params {
        min: i64,
    }
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "query");
    save_json(&db, "a", r#"{"name":"Alice","age":30}"#);
    save_json(&db, "b", r#"{"name":"Bob","age":20}"#);
    save_json(&db, "c", r#"{"name":"Carol","age":40}"#);

    let query = db
        .n1ql_query("SELECT META().id, name FROM _ WHERE age > $min ORDER BY name")
        .unwrap();
    query.set_parameters(&Params { min: 25 }).unwrap();
    let mut rs = query.execute().unwrap();
    let mut names = Vec::new();
    while let Some(row) = rs.next().unwrap() {
        let id: String = row.get_checked(0).unwrap();
        let name: String = row.get_checked(1).unwrap();
        names.push(format!("{id}:{name}"));
    }
    assert_eq!(vec!["a:Alice", "c:Carol"], names);
}

#[test]
fn test_full_text_search() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "fts");
    db.create_full_text_index(
        "textIdx",
        &FullTextIndexConfiguration::new(QueryLanguage::N1ql, "text"),
    )
    .unwrap();
    save_json(&db, "1", r#"{"text":"The quick brown fox"}"#);
    save_json(&db, "2", r#"{"text":"Lazy dogs sleep"}"#);
    let query = db
        .n1ql_query("SELECT META().id FROM _ WHERE MATCH(textIdx, 'fox')")
        .unwrap();
    let mut rs = query.execute().unwrap();
    let mut ids = Vec::new();
    while let Some(row) = rs.next().unwrap() {
        ids.push(row.get_checked::<String>(0).unwrap());
    }
    assert_eq!(vec!["1"], ids);
}

#[test]
fn test_live_query() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "live");
    save_json(&db, "m1", r#"{"type":"msg"}"#);
    let query = db
        .n1ql_query("SELECT META().id FROM _ WHERE type = 'msg'")
        .unwrap();
    let (tx, rx) = mpsc::channel::<usize>();
    let _token = query
        .add_change_listener(move |change| {
            let rows = change.results().map_or(0, |x| x.row_count());
            let _ = tx.send(rows);
        })
        .unwrap();
    assert_eq!(1, rx.recv_timeout(TIMEOUT).unwrap());
    save_json(&db, "other", r#"{"type":"note"}"#);
    save_json(&db, "m2", r#"{"type":"msg"}"#);
    assert_eq!(2, rx.recv_timeout(TIMEOUT).unwrap());
}

#[test]
fn test_blob_in_document() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "blobs");
    let blob = Blob::new(Some("text/plain"), b"hello blob".to_vec());
    let mut doc = MutableDocument::new_with_id("with_blob");
    doc.set_blob("attachment", &blob).unwrap();
    db.save_document(&mut doc).unwrap();

    let doc = db.get_existing("with_blob").unwrap();
    let props = doc.properties().unwrap();
    let dict = props.get("attachment").and_then(|x| x.as_dict()).unwrap();
    assert!(Blob::is_blob(dict));
    let blob = db.get_blob(dict).unwrap();
    assert_eq!(Some("text/plain"), blob.content_type());
    assert_eq!(b"hello blob".to_vec(), blob.content().unwrap());
}

#[test]
fn test_local_replication_and_checkpoints() {
    let _ = env_logger::try_init();
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    for i in 0..20 {
        save_json(&db_a, &format!("doc{i}"), &format!(r#"{{"i":{i}}}"#));
    }
    save_json(&db_b, "from_b", r#"{"b":true}"#);

    let config = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b));
    let (tx, rx) = mpsc::channel::<(ReplicationDirection, Vec<ReplicatedDocument>)>();
    let repl = Replicator::new(config.clone()).unwrap();
    let _doc_token = repl.add_document_replication_listener(move |dir, docs| {
        let _ = tx.send((dir, docs.to_vec()));
    });
    repl.start(false).unwrap();
    let first = wait_for(&repl, ReplicatorActivityLevel::Stopped);
    assert!(first.error.is_none(), "{:?}", first.error);
    assert_eq!(21, first.progress.document_count);
    assert_eq!(1.0, first.progress.complete);
    assert_eq!(21, db_b.document_count());
    assert_eq!(Some(r#"{"i":7}"#.to_string()), doc_json(&db_b, "doc7"));
    assert_eq!(Some(r#"{"b":true}"#.to_string()), doc_json(&db_a, "from_b"));

    let mut pushed = 0;
    let mut pulled = 0;
    while let Ok((dir, docs)) = rx.try_recv() {
        assert!(docs.iter().all(|x| x.error.is_none()));
        match dir {
            ReplicationDirection::Push => pushed += docs.len(),
            ReplicationDirection::Pull => pulled += docs.len(),
        }
    }
    assert_eq!((20, 1), (pushed, pulled));
    assert!(repl
        .pending_document_ids(&Default::default())
        .unwrap()
        .is_empty());

    // same peer again, checkpoint says nothing is left to do
    let second = replicate_once(config.clone());
    assert!(second.error.is_none());
    assert_eq!(0, second.progress.document_count);
    assert!(second.progress.bytes_transferred < first.progress.bytes_transferred);

    let reset = replicate_from_start(config, true);
    assert!(reset.error.is_none());
    assert!(reset.progress.bytes_transferred > second.progress.bytes_transferred);
    assert_eq!(0, reset.progress.document_count);
}

#[test]
fn test_pending_documents_and_deletion() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    save_json(&db_a, "keep", r#"{"v":1}"#);
    save_json(&db_a, "gone", r#"{"v":2}"#);
    let config = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b))
        .with_replicator_type(ReplicatorType::Push);
    let repl = Replicator::new(config).unwrap();
    let spec = Default::default();
    let mut pending = repl.pending_document_ids(&spec).unwrap();
    pending.sort();
    assert_eq!(vec!["gone", "keep"], pending);
    assert!(repl.is_document_pending("keep", &spec).unwrap());

    repl.start(false).unwrap();
    assert!(wait_for(&repl, ReplicatorActivityLevel::Stopped).error.is_none());
    assert!(!repl.is_document_pending("keep", &spec).unwrap());

    let doc = db_a.get_existing("gone").unwrap();
    db_a.delete_document(&doc).unwrap();
    assert_eq!(vec!["gone"], repl.pending_document_ids(&spec).unwrap());
    repl.start(false).unwrap();
    assert!(wait_for(&repl, ReplicatorActivityLevel::Stopped).error.is_none());
    assert!(db_b.get_document("gone").unwrap().is_none());
    assert!(db_b.get_document("keep").unwrap().is_some());

    let pull_only = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b))
        .with_replicator_type(ReplicatorType::Pull);
    let err = Replicator::new(pull_only)
        .unwrap()
        .pending_document_ids(&spec)
        .unwrap_err();
    assert!(err.is(CblErrorCode::Unsupported));
}

#[test]
fn test_pull_conflict_resolution() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    save_json(&db_a, "doc", r#"{"who":"base"}"#);
    save_json(&db_a, "other", r#"{"who":"base"}"#);
    let base = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b));
    assert!(replicate_once(base.clone()).error.is_none());

    for id in ["doc", "other"] {
        let mut local = db_a.get_mutable_document(id).unwrap().unwrap();
        local.set_json(r#"{"who":"local"}"#).unwrap();
        db_a.save_document(&mut local).unwrap();
        let mut remote = db_b.get_mutable_document(id).unwrap().unwrap();
        remote.set_json(r#"{"who":"remote"}"#).unwrap();
        db_b.save_document(&mut remote).unwrap();
    }

    // default resolver keeps local revision, it wins on both sides
    let status = replicate_once(base.clone().with_document_ids(vec!["doc".into()]));
    assert!(status.error.is_none(), "{:?}", status.error);
    assert_eq!(Some(r#"{"who":"local"}"#.to_string()), doc_json(&db_a, "doc"));
    assert_eq!(Some(r#"{"who":"local"}"#.to_string()), doc_json(&db_b, "doc"));
    assert!(db_a
        .get_existing("doc")
        .unwrap()
        .revision_id()
        .starts_with("3-"));

    // checkpoint already passed "other", so start over
    let status = replicate_from_start(
        base.with_document_ids(vec!["other".into()])
            .with_conflict_resolver(|_id, _local, remote| remote.map(|x| x.mutable_copy())),
        true,
    );
    assert!(status.error.is_none(), "{:?}", status.error);
    assert_eq!(Some(r#"{"who":"remote"}"#.to_string()), doc_json(&db_a, "other"));
    assert_eq!(Some(r#"{"who":"remote"}"#.to_string()), doc_json(&db_b, "other"));
}

fn make_conflict(db_a: &Database, db_b: &Database, id: &str) {
    let mut local = db_a.get_mutable_document(id).unwrap().unwrap();
    local.set_json(r#"{"who":"local"}"#).unwrap();
    db_a.save_document(&mut local).unwrap();
    let mut remote = db_b.get_mutable_document(id).unwrap().unwrap();
    remote.set_json(r#"{"who":"remote"}"#).unwrap();
    db_b.save_document(&mut remote).unwrap();
}

#[test]
fn test_failed_conflict_resolution_is_retried() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    save_json(&db_a, "doc", r#"{"who":"base"}"#);
    let base = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b));
    assert!(replicate_once(base.clone()).error.is_none());
    make_conflict(&db_a, &db_b, "doc");

    let pull = base.with_replicator_type(ReplicatorType::Pull);
    let (tx, rx) = mpsc::channel::<ReplicatedDocument>();
    let repl = Replicator::new(
        pull.clone()
            .with_conflict_resolver(|id, _local, _remote| panic!("can not resolve {id}")),
    )
    .unwrap();
    let _token = repl.add_document_replication_listener(move |_, docs| {
        for doc in docs {
            let _ = tx.send(doc.clone());
        }
    });
    repl.start(false).unwrap();
    let status = wait_for(&repl, ReplicatorActivityLevel::Stopped);
    assert!(status.error.is_none(), "{:?}", status.error);
    let failed: Vec<ReplicatedDocument> = rx.try_iter().filter(|x| x.error.is_some()).collect();
    assert_eq!(1, failed.len());
    assert_eq!("doc", failed[0].id);
    assert_eq!(Some(r#"{"who":"local"}"#.to_string()), doc_json(&db_a, "doc"));
    assert!(db_a
        .get_existing("doc")
        .unwrap()
        .revision_id()
        .starts_with("2-"));

    // checkpoint stayed before "doc", no reset needed
    let status = replicate_once(pull);
    assert!(status.error.is_none(), "{:?}", status.error);
    assert_eq!(Some(r#"{"who":"local"}"#.to_string()), doc_json(&db_a, "doc"));
    assert!(db_a
        .get_existing("doc")
        .unwrap()
        .revision_id()
        .starts_with("3-"));
}

#[test]
fn test_slow_conflict_resolver_does_not_block_other_documents() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    save_json(&db_a, "doc", r#"{"who":"base"}"#);
    let base = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b));
    assert!(replicate_once(base.clone()).error.is_none());
    make_conflict(&db_a, &db_b, "doc");
    save_json(&db_a, "fresh", r#"{"new":true}"#);

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let repl = Replicator::new(base.with_conflict_resolver(move |_id, local, _remote| {
        let _ = release_rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        local.map(|x| x.mutable_copy())
    }))
    .unwrap();
    repl.start(false).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while db_b.get_document("fresh").unwrap().is_none() {
        assert!(Instant::now() < deadline, "fresh was not pushed during resolution");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(ReplicatorActivityLevel::Busy, repl.status().activity);
    assert_eq!(Some(r#"{"who":"remote"}"#.to_string()), doc_json(&db_b, "doc"));

    release_tx.send(()).unwrap();
    let status = wait_for(&repl, ReplicatorActivityLevel::Stopped);
    assert!(status.error.is_none(), "{:?}", status.error);
    assert_eq!(Some(r#"{"who":"local"}"#.to_string()), doc_json(&db_a, "doc"));
    assert_eq!(Some(r#"{"who":"local"}"#.to_string()), doc_json(&db_b, "doc"));
}

#[test]
fn test_pull_filter_and_channels() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    save_json(&db_b, "red", r#"{"channels":["red"]}"#);
    save_json(&db_b, "blue", r#"{"channels":["blue"]}"#);
    save_json(&db_b, "secret", r#"{"channels":["red"],"private":true}"#);

    let (tx, rx) = mpsc::channel::<ReplicatedDocument>();
    let config = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b))
        .with_replicator_type(ReplicatorType::Pull)
        .with_channels(vec!["red".into()])
        .with_pull_filter(|doc, _flags| {
            doc.properties()
                .and_then(|x| x.get("private"))
                .is_none()
        });
    let repl = Replicator::new(config).unwrap();
    let _token = repl.add_document_replication_listener(move |_, docs| {
        for doc in docs {
            let _ = tx.send(doc.clone());
        }
    });
    repl.start(false).unwrap();
    assert!(wait_for(&repl, ReplicatorActivityLevel::Stopped).error.is_none());
    assert!(db_a.get_document("red").unwrap().is_some());
    assert!(db_a.get_document("blue").unwrap().is_none());
    assert!(db_a.get_document("secret").unwrap().is_none());
    let rejected: Vec<ReplicatedDocument> = rx.try_iter().filter(|x| x.error.is_some()).collect();
    assert_eq!(1, rejected.len());
    assert_eq!("secret", rejected[0].id);
    assert_eq!(
        Some(CblError::websocket(403)),
        rejected[0].error.as_ref().map(|x| x.cbl_error())
    );
}

#[test]
fn test_property_encryption() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    let db_c = open_db(&tmp_dir, "c");
    let mut doc = MutableDocument::new_with_id("person");
    doc.properties_mut().set_string("name", "bob");
    doc.properties_mut()
        .set("ssn", Encryptable::new(&"123-45-6789").unwrap().properties().unwrap());
    db_a.save_document(&mut doc).unwrap();

    let push = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b))
        .with_replicator_type(ReplicatorType::Push)
        .with_property_encryptor(|_ctx, plain| {
            Ok(EncryptedValue {
                ciphertext: xor(plain),
                algorithm: None,
                key_id: Some("k1".into()),
            })
        });
    assert!(replicate_once(push).error.is_none());
    let stored = doc_json(&db_b, "person").unwrap();
    assert!(stored.contains("encrypted$ssn"), "{}", stored);
    assert!(!stored.contains("123-45-6789"));

    let pull = ReplicatorConfiguration::new(&db_c, Endpoint::with_local_db(&db_b))
        .with_replicator_type(ReplicatorType::Pull)
        .with_property_decryptor(|_ctx, data, _alg, kid| {
            assert_eq!(Some("k1"), kid);
            Ok(xor(data))
        });
    assert!(replicate_once(pull).error.is_none());
    let doc = db_c.get_existing("person").unwrap();
    let props = doc.properties().unwrap();
    let ssn = Encryptable::from_dict(props.get("ssn").and_then(|x| x.as_dict()).unwrap()).unwrap();
    assert_eq!(Some("123-45-6789"), ssn.value().as_str());
}

/// Status listener that records activity changes, repeats collapsed
fn record_activity(repl: &Replicator) -> (ListenerToken, mpsc::Receiver<ReplicatorActivityLevel>) {
    let (tx, rx) = mpsc::channel();
    let token = repl.add_change_listener(move |status| {
        let _ = tx.send(status.activity);
    });
    (token, rx)
}

fn collapse_repeats(levels: impl Iterator<Item = ReplicatorActivityLevel>) -> Vec<ReplicatorActivityLevel> {
    let mut ret: Vec<ReplicatorActivityLevel> = Vec::new();
    for level in levels {
        if ret.last() != Some(&level) {
            ret.push(level);
        }
    }
    ret
}

#[test]
fn test_failed_push_is_retried_by_next_run() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    let mut doc = MutableDocument::new_with_id("person");
    doc.properties_mut().set_string("name", "bob");
    doc.properties_mut()
        .set("ssn", Encryptable::new(&"123-45-6789").unwrap().properties().unwrap());
    db_a.save_document(&mut doc).unwrap();
    let spec = Default::default();

    // nothing to encrypt with
    let push = ReplicatorConfiguration::new(&db_a, Endpoint::with_local_db(&db_b))
        .with_replicator_type(ReplicatorType::Push);
    let (tx, rx) = mpsc::channel::<ReplicatedDocument>();
    let repl = Replicator::new(push.clone()).unwrap();
    let _token = repl.add_document_replication_listener(move |_, docs| {
        for doc in docs {
            let _ = tx.send(doc.clone());
        }
    });
    repl.start(false).unwrap();
    let status = wait_for(&repl, ReplicatorActivityLevel::Stopped);
    assert!(status.error.is_none(), "{:?}", status.error);
    let failed: Vec<ReplicatedDocument> = rx.try_iter().filter(|x| x.error.is_some()).collect();
    assert_eq!(1, failed.len());
    assert!(failed[0].error.as_ref().unwrap().is(CblErrorCode::Crypto));
    assert_eq!(vec!["person"], repl.pending_document_ids(&spec).unwrap());
    assert!(db_b.get_document("person").unwrap().is_none());

    let repl = Replicator::new(push.with_property_encryptor(|_ctx, plain| {
        Ok(EncryptedValue {
            ciphertext: xor(plain),
            algorithm: None,
            key_id: None,
        })
    }))
    .unwrap();
    repl.start(false).unwrap();
    let status = wait_for(&repl, ReplicatorActivityLevel::Stopped);
    assert!(status.error.is_none(), "{:?}", status.error);
    assert!(repl.pending_document_ids(&spec).unwrap().is_empty());
    assert!(db_b.get_document("person").unwrap().is_some());
}

#[test]
fn test_push_to_unreachable_peer_stops() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "lonely");
    save_json(&db, "doc", r#"{"a":1}"#);
    let config = ReplicatorConfiguration::new(&db, Endpoint::with_url("ws://127.0.0.1:1/db").unwrap())
        .with_replicator_type(ReplicatorType::Push)
        .with_max_attempts(1);
    let repl = Replicator::new(config).unwrap();
    let (_token, rx) = record_activity(&repl);
    let started = Instant::now();
    repl.start(false).unwrap();
    let status = wait_for(&repl, ReplicatorActivityLevel::Stopped);
    // no retry, so no backoff wait
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    let err = status.error.expect("error expected");
    assert_eq!(
        CblError::network(NetworkErrorCode::ConnectionRefused),
        err.cbl_error()
    );
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        vec![ReplicatorActivityLevel::Connecting, ReplicatorActivityLevel::Stopped],
        collapse_repeats(rx.try_iter())
    );
}

#[test]
fn test_restart_right_after_finish() {
    let tmp_dir = tempdir().unwrap();
    let db_a = open_db(&tmp_dir, "a");
    let db_b = open_db(&tmp_dir, "b");
    for i in 0..5 {
        save_json(&db_a, &format!("doc{i}"), &format!(r#"{{"i":{i}}}"#));
    }
    let repl = Replicator::new(ReplicatorConfiguration::new(
        &db_a,
        Endpoint::with_local_db(&db_b),
    ))
    .unwrap();
    let (_token, rx) = record_activity(&repl);
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        repl.start(false).unwrap();
    }
    assert!(wait_for(&repl, ReplicatorActivityLevel::Stopped).error.is_none());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(ReplicatorActivityLevel::Stopped, repl.status().activity);

    let levels = collapse_repeats(rx.try_iter());
    assert!(levels.len() >= 2, "{:?}", levels);
    let mut prev = ReplicatorActivityLevel::Stopped;
    for level in &levels {
        if *level == ReplicatorActivityLevel::Connecting {
            assert_eq!(ReplicatorActivityLevel::Stopped, prev, "{:?}", levels);
        }
        prev = *level;
    }
    assert_eq!(Some(&ReplicatorActivityLevel::Stopped), levels.last());
    assert_eq!(5, db_b.document_count());
}

#[test]
fn test_replication_over_websocket() {
    let _ = env_logger::try_init();
    let tmp_dir = tempdir().unwrap();
    let server_db = open_db(&tmp_dir, "server");
    let client_db = open_db(&tmp_dir, "client");
    save_json(&server_db, "s1", r#"{"from":"server"}"#);
    save_json(&client_db, "c1", r#"{"from":"client"}"#);

    let listener = UrlEndpointListener::new(
        UrlEndpointListenerConfiguration::new(&server_db)
            .with_network_interface("127.0.0.1")
            .with_password_authenticator(|user, password| user == "bob" && password == "secret"),
    );
    listener.start().unwrap();
    let url = listener.urls().remove(0);
    assert!(url.starts_with("ws://127.0.0.1:"));

    let config = ReplicatorConfiguration::new(&client_db, Endpoint::with_url(&url).unwrap())
        .with_authenticator(Authenticator::basic("bob", "secret"));
    let status = replicate_once(config);
    assert!(status.error.is_none(), "{:?}", status.error);
    assert_eq!(Some(r#"{"from":"server"}"#.to_string()), doc_json(&client_db, "s1"));
    assert_eq!(Some(r#"{"from":"client"}"#.to_string()), doc_json(&server_db, "c1"));
    assert!(listener.connection_status().connection_count >= 1);

    let wrong = ReplicatorConfiguration::new(&client_db, Endpoint::with_url(&url).unwrap())
        .with_authenticator(Authenticator::basic("bob", "wrong"));
    let err = replicate_once(wrong).error.expect("auth error expected");
    assert_eq!(CblError::websocket(401), err.cbl_error());
    listener.stop();
    assert_eq!(None, listener.port());
}

#[test]
fn test_continuous_replication_over_read_only_listener() {
    let tmp_dir = tempdir().unwrap();
    let server_db = open_db(&tmp_dir, "server");
    let client_db = open_db(&tmp_dir, "client");
    let listener = UrlEndpointListener::new(
        UrlEndpointListenerConfiguration::new(&server_db)
            .with_network_interface("127.0.0.1")
            .with_read_only(true),
    );
    listener.start().unwrap();
    let url = listener.urls().remove(0);

    let config = ReplicatorConfiguration::new(&client_db, Endpoint::with_url(&url).unwrap())
        .with_replicator_type(ReplicatorType::Pull)
        .with_continuous(true);
    let repl = Replicator::new(config).unwrap();
    repl.start(false).unwrap();
    wait_for(&repl, ReplicatorActivityLevel::Idle);

    save_json(&server_db, "late", r#"{"n":1}"#);
    let deadline = Instant::now() + TIMEOUT;
    while client_db.get_document("late").unwrap().is_none() {
        assert!(Instant::now() < deadline, "document was not pulled");
        thread::sleep(Duration::from_millis(20));
    }

    repl.set_suspended(true);
    wait_for(&repl, ReplicatorActivityLevel::Offline);
    repl.set_suspended(false);
    wait_for(&repl, ReplicatorActivityLevel::Idle);
    repl.stop();
    let status = wait_for(&repl, ReplicatorActivityLevel::Stopped);
    assert!(status.error.is_none(), "{:?}", status.error);

    save_json(&client_db, "local", r#"{"n":2}"#);
    let push = ReplicatorConfiguration::new(&client_db, Endpoint::with_url(&url).unwrap())
        .with_replicator_type(ReplicatorType::Push)
        .with_document_ids(vec!["local".into()]);
    let err = replicate_once(push).error.expect("read only listener rejects push");
    assert_eq!(CblError::websocket(403), err.cbl_error());
    assert!(server_db.get_document("local").unwrap().is_none());
}

#[test]
fn test_doc1_lifecycle() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "lifecycle");
    let mut doc = MutableDocument::new_with_id("doc1");
    doc.properties_mut().set_string("name", "tester");
    db.save_document(&mut doc).unwrap();

    let doc = db.get_existing("doc1").unwrap();
    assert_eq!(1, doc.sequence());
    let name = doc
        .properties()
        .and_then(|x| x.get("name"))
        .and_then(|x| x.as_str())
        .map(str::to_string);
    assert_eq!(Some("tester".to_string()), name);

    db.delete_document_with_concurrency_control(&doc, ConcurrencyControl::FailOnConflict)
        .unwrap();
    assert!(db.get_document("doc1").unwrap().is_none());
    db.purge_document(&doc).unwrap();
    assert!(db.get_document("doc1").unwrap().is_none());
    assert_eq!(0, db.document_count());
}

#[test]
fn test_collections_and_scopes() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "colls");
    let people = db.create_collection("people", "app").unwrap();
    assert_eq!("app", people.scope_name());
    let mut doc = MutableDocument::from_json("p1", r#"{"name":"Ann"}"#).unwrap();
    people.save_document(&mut doc).unwrap();
    assert_eq!(1, people.count().unwrap());
    assert_eq!(0, db.document_count());
    assert!(db.scope_names().contains(&"app".to_string()));
    assert_eq!(vec!["people"], db.collection_names("app"));

    let query = db.n1ql_query("SELECT name FROM app.people").unwrap();
    let mut rs = query.execute().unwrap();
    let row = rs.next().unwrap().expect("one row");
    assert_eq!("Ann", row.get_checked::<&str>(0).unwrap());

    assert!(db.delete_collection("_default", "_default").is_err());
    db.delete_collection("people", "app").unwrap();
    assert!(db.collection("people", "app").unwrap().is_none());
}

#[test]
fn test_document_expiration() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "expire");
    save_json(&db, "short", r#"{"a":1}"#);
    save_json(&db, "long", r#"{"a":2}"#);
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    db.set_document_expiration("short", Some(now_ms + 100)).unwrap();
    db.set_document_expiration("long", Some(now_ms + 3_600_000))
        .unwrap();
    assert_eq!(Some(now_ms + 100), db.get_document_expiration("short").unwrap());
    assert!(db.set_document_expiration("missing", None).is_err());

    let deadline = Instant::now() + TIMEOUT;
    while db.get_document("short").unwrap().is_some() {
        assert!(Instant::now() < deadline, "expired document was not purged");
        thread::sleep(Duration::from_millis(20));
    }
    assert!(db.get_document("long").unwrap().is_some());
}

#[test]
fn test_enumerate_all_docs() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "enumerate");
    for id in ["b", "a", "c"] {
        save_json(&db, id, r#"{}"#);
    }
    let doc = db.get_existing("c").unwrap();
    db.delete_document(&doc).unwrap();

    let mut ids = Vec::new();
    let mut it = db.enumerate_all_docs(DocEnumeratorFlags::default()).unwrap();
    while let Some(item) = it.next().unwrap() {
        ids.push(item.get_doc().unwrap().id().to_string());
    }
    assert_eq!(vec!["a", "b"], ids);

    let mut ids = Vec::new();
    let mut it = db
        .enumerate_all_docs(DocEnumeratorFlags::DESCENDING | DocEnumeratorFlags::INCLUDE_DELETED)
        .unwrap();
    while let Some(item) = it.next().unwrap() {
        let info = item.get_doc_info().unwrap().unwrap();
        ids.push(info.doc_id().to_string());
    }
    assert_eq!(vec!["c", "b", "a"], ids);
}

#[test]
fn test_observer_and_document_listener() {
    let tmp_dir = tempdir().unwrap();
    let mut db = open_db(&tmp_dir, "observer");
    let (tx, rx) = mpsc::channel::<()>();
    db.register_observer(move || {
        let _ = tx.send(());
    })
    .unwrap();
    let (doc_tx, doc_rx) = mpsc::channel::<String>();
    let _token = db
        .add_document_change_listener("watched", move |change| {
            let _ = doc_tx.send(change.doc_id().to_string());
        })
        .unwrap();

    save_json(&db, "other", r#"{"n":1}"#);
    save_json(&db, "watched", r#"{"n":2}"#);
    assert_eq!("watched", doc_rx.recv_timeout(TIMEOUT).unwrap());
    rx.recv_timeout(TIMEOUT).unwrap();

    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    while seen.len() < 2 {
        assert!(Instant::now() < deadline, "observer saw only {:?}", seen);
        for change in db.observed_changes() {
            assert!(!change.external());
            seen.push(change.doc_id().to_string());
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(vec!["other", "watched"], seen);
    db.clear_observers();
}

#[test]
fn test_encryption_and_maintenance() {
    let tmp_dir = tempdir().unwrap();
    let key = EncryptionKey::from_password("secret");
    let config = DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::CREATE)
        .with_encryption_key(key.clone());
    {
        let db = Database::open("enc", Some(config.clone())).unwrap();
        save_json(&db, "doc", r#"{"v":"hidden"}"#);
        db.save_blob(&Blob::new(None, b"blob data".to_vec())).unwrap();
        db.perform_maintenance(MaintenanceType::Compact).unwrap();
        db.perform_maintenance(MaintenanceType::IntegrityCheck).unwrap();
    }
    let wrong = DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::empty())
        .with_encryption_key(EncryptionKey::from_password("other"));
    let err = Database::open("enc", Some(wrong)).unwrap_err();
    assert!(err.is(CblErrorCode::NotADatabaseFile));
    {
        let mut db = Database::open("enc", Some(config)).unwrap();
        assert_eq!(Some(r#"{"v":"hidden"}"#.to_string()), doc_json(&db, "doc"));
        db.change_encryption_key(None).unwrap();
    }
    let db = Database::open(
        "enc",
        Some(DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::empty())),
    )
    .unwrap();
    assert_eq!(Some(r#"{"v":"hidden"}"#.to_string()), doc_json(&db, "doc"));
    db.perform_maintenance(MaintenanceType::IntegrityCheck).unwrap();

    Database::copy_database(
        db.path(),
        "enc_copy",
        Some(DatabaseConfig::new(tmp_dir.path(), DatabaseFlags::empty())),
    )
    .unwrap();
    let copy = open_db(&tmp_dir, "enc_copy");
    assert_eq!(Some(r#"{"v":"hidden"}"#.to_string()), doc_json(&copy, "doc"));
    assert_ne!(db.uuids().unwrap(), copy.uuids().unwrap());
    copy.delete().unwrap();
    assert!(!Database::exists("enc_copy", tmp_dir.path()));
}

#[test]
fn test_query_explain_uses_index() {
    let tmp_dir = tempdir().unwrap();
    let db = open_db(&tmp_dir, "explain");
    db.create_value_index(
        "ageIdx",
        &ValueIndexConfiguration::new(QueryLanguage::N1ql, "age"),
    )
    .unwrap();
    save_json(&db, "a", r#"{"name":"Alice","age":30}"#);
    save_json(&db, "b", r#"{"name":"Bob","age":20}"#);
    assert_eq!(vec!["ageIdx"], db.index_names().unwrap());

    let query = db
        .query(r#"{"WHAT": [[".name"]], "WHERE": ["=", [".age"], 20]}"#)
        .unwrap();
    assert!(query.explain().unwrap().contains("ageIdx"));
    assert_eq!(1, query.column_count());
    assert_eq!(Some("name"), query.column_name(0));
    let mut rs = query.execute().unwrap();
    let row = rs.next().unwrap().expect("one row");
    assert_eq!("Bob", row.get_checked::<&str>(0).unwrap());
    assert!(rs.next().unwrap().is_none());

    let err = db.n1ql_query("SELECT FROM WHERE").unwrap_err();
    assert!(err.is(CblErrorCode::InvalidQuery));
}
