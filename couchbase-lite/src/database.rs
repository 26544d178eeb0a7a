use crate::{
    blob::{attachments_dir, Blob, BlobStore, BlobWriter},
    collection::{check_name, now_ms, Collection, CollectionSpec, ConcurrencyControl, DEFAULT_NAME},
    doc_enumerator::{DocEnumerator, DocEnumeratorFlags},
    document::{Document, MutableDocument},
    error::{CblError, CblErrorCode, Error, Result},
    index::{FullTextIndexConfiguration, IndexInfo, IndexOptions, IndexType, ValueIndexConfiguration},
    lock,
    logging::{cbl_log, LogDomain},
    observer::{
        ChangeEvent, CommitHook, DatabaseObserver, DocumentChange, Listener, ListenerToken,
        Notifier, ObserverdChangesIter,
    },
    query::{Query, QueryLanguage},
    read_lock,
    storage::{ByteBuf, Cipher, CommitLog, CommitRecord, HeaderRecord, LogOp, LogRecord, FORMAT_VERSION, LOG_FILE_NAME},
    store::{apply_op, PendingCommit, Snapshot},
    transaction::Transaction,
    write_lock,
};
use bitflags::bitflags;
use fallible_streaming_iterator::FallibleStreamingIterator;
use log::{debug, trace};
use serde_fleece::{Dict, Encoder, FlEncoderSession};
use sha2::{Digest, Sha256};
use std::{
    cell::Cell,
    collections::{HashMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex, OnceLock, RwLock, Weak,
    },
    thread,
    time::Duration,
};
use uuid::Uuid;

pub const DB_EXTENSION: &str = ".cblite2";
/// Sweeper wakes up at least this often, even without known expirations
const SWEEP_INTERVAL_MS: i64 = 60_000;
const EEXIST: i32 = 17;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatabaseFlags: u32 {
        /// Create the file if it doesn't exist
        const CREATE = 0x01;
        /// Open file read-only
        const READ_ONLY = 0x02;
        /// Disable upgrading an older-version database
        const NO_UPGRADE = 0x200;
        /// Disable database/collection observers, for slightly faster writes
        const NON_OBSERVABLE = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    None,
    Aes256,
}

/// Key used to encrypt database file and blobs
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub algorithm: EncryptionAlgorithm,
    pub bytes: [u8; 32],
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey({:?})", self.algorithm)
    }
}

impl EncryptionKey {
    pub fn new_aes256(bytes: [u8; 32]) -> Self {
        Self {
            algorithm: EncryptionAlgorithm::Aes256,
            bytes,
        }
    }
    /// Derive AES-256 key from password
    pub fn from_password(password: &str) -> Self {
        Self::new_aes256(Sha256::digest(password.as_bytes()).into())
    }
    pub(crate) fn cipher(&self) -> Option<Cipher> {
        match self.algorithm {
            EncryptionAlgorithm::None => None,
            EncryptionAlgorithm::Aes256 => Some(Cipher::new(&self.bytes)),
        }
    }
}

fn cipher_of(key: Option<&EncryptionKey>) -> Option<Cipher> {
    key.and_then(EncryptionKey::cipher)
}

/// Database configuration, used during open
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Parent directory of database
    pub directory: PathBuf,
    pub flags: DatabaseFlags,
    pub encryption_key: Option<EncryptionKey>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            flags: DatabaseFlags::CREATE,
            encryption_key: None,
        }
    }
}

impl DatabaseConfig {
    pub fn new(parent_directory: &Path, flags: DatabaseFlags) -> Self {
        Self {
            directory: parent_directory.into(),
            flags,
            encryption_key: None,
        }
    }
    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceType {
    /// Rewrite log as one snapshot record and remove unused blobs
    Compact,
    /// Rebuild contents of all indexes
    Reindex,
    /// Check every record and every blob
    IntegrityCheck,
    Optimize,
    FullOptimize,
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// Non-zero identifier of current thread, owner of writer lock
fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| {
        if t.get() == 0 {
            t.set(NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed));
        }
        t.get()
    })
}

struct WriterState {
    owner: u64,
    pending: Option<PendingCommit>,
    log: CommitLog,
}

#[derive(Default)]
struct SweeperSignal {
    kicked: Mutex<bool>,
    cv: Condvar,
    shutdown: AtomicBool,
}

/// Shared state of one open database file, all `Database` handles
/// for the same path share it
pub(crate) struct DbInner {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) config: DatabaseConfig,
    state: RwLock<Arc<Snapshot>>,
    writer: Mutex<WriterState>,
    writer_cv: Condvar,
    writer_owner: AtomicU64,
    pub(crate) blobs: Arc<BlobStore>,
    pub(crate) notifier: Notifier,
    uuids: RwLock<(Uuid, Uuid)>,
    key: RwLock<Option<EncryptionKey>>,
    sweeper: Arc<SweeperSignal>,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        trace!("release db {}", self.path.display());
        self.sweeper.shutdown.store(true, Ordering::Release);
        self.sweeper.cv.notify_all();
    }
}

type Registry = Mutex<HashMap<PathBuf, Weak<DbInner>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::default)
}

fn db_path(name: &str, directory: &Path) -> PathBuf {
    directory.join(format!("{}{}", name, DB_EXTENSION))
}

fn is_open(path: &Path) -> bool {
    lock(registry())
        .get(path)
        .map_or(false, |x| x.strong_count() > 0)
}

/// Replay log records into snapshot
fn replay(records: Vec<LogRecord>) -> Result<(Snapshot, HeaderRecord)> {
    let mut snap = Snapshot::default();
    let mut header = None;
    for rec in records {
        match rec {
            LogRecord::Header(h) => header = Some(h),
            LogRecord::Commit(commit) => {
                for op in &commit.ops {
                    apply_op(&mut snap, op, false)?;
                }
                snap.last_sequence = snap.last_sequence.max(commit.last_sequence);
            }
        }
    }
    let header = header.ok_or_else(|| Error::from(CblErrorCode::NotADatabaseFile))?;
    if header.version > FORMAT_VERSION {
        return Err(CblErrorCode::DatabaseTooNew.into());
    }
    Ok((snap, header))
}

fn parse_uuids(header: &HeaderRecord) -> Result<(Uuid, Uuid)> {
    let parse = |s: &str| Uuid::parse_str(s).map_err(|_| Error::from(CblErrorCode::Corrupt));
    Ok((parse(&header.public_uuid)?, parse(&header.private_uuid)?))
}

fn new_header() -> HeaderRecord {
    HeaderRecord {
        version: FORMAT_VERSION,
        public_uuid: Uuid::new_v4().to_string(),
        private_uuid: Uuid::new_v4().to_string(),
    }
}

/// Write log that recreates `snap` in one commit
fn write_compacted(
    path: &Path,
    cipher: Option<Cipher>,
    header: HeaderRecord,
    snap: &Snapshot,
) -> Result<CommitLog> {
    let records = [
        LogRecord::Header(header),
        LogRecord::Commit(CommitRecord {
            last_sequence: snap.last_sequence,
            ops: snap.to_ops(),
        }),
    ];
    CommitLog::create(path, cipher, &records)
}

fn used_blobs(snap: &Snapshot) -> HashSet<String> {
    let mut used = HashSet::new();
    for coll in snap.collections.values() {
        for doc in coll.docs.values() {
            crate::blob::collect_blob_digests(doc.body.value(), &mut used);
        }
    }
    used
}

impl DbInner {
    fn open(name: &str, config: DatabaseConfig) -> Result<Arc<Self>> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(CblErrorCode::InvalidParameter.into());
        }
        let path = db_path(name, &config.directory);
        let mut registry = lock(registry());
        registry.retain(|_, x| x.strong_count() > 0);
        if let Some(inner) = registry.get(&path).and_then(Weak::upgrade) {
            if *read_lock(&inner.key) != config.encryption_key {
                return Err(CblErrorCode::NotADatabaseFile.into());
            }
            debug!("reuse already opened database {}", path.display());
            return Ok(inner);
        }

        let read_only = config.flags.contains(DatabaseFlags::READ_ONLY);
        let cipher = cipher_of(config.encryption_key.as_ref());
        let log_path = path.join(LOG_FILE_NAME);
        let (log, snapshot, header) = if log_path.exists() {
            let (log, records) = CommitLog::open(&log_path, cipher.clone(), !read_only)?;
            let (snapshot, header) = replay(records)?;
            (log, snapshot, header)
        } else {
            if !config.flags.contains(DatabaseFlags::CREATE) || read_only {
                return Err(Error::not_found());
            }
            fs::create_dir_all(&path)?;
            let header = new_header();
            let log = CommitLog::create(&log_path, cipher.clone(), &[LogRecord::Header(header.clone())])?;
            cbl_log!(LogDomain::Database, Info, "created database {}", path.display());
            (log, Snapshot::default(), header)
        };
        let blobs = Arc::new(BlobStore::open(attachments_dir(&path), cipher)?);
        let inner = Arc::new(DbInner {
            name: name.into(),
            path: path.clone(),
            uuids: RwLock::new(parse_uuids(&header)?),
            key: RwLock::new(config.encryption_key.clone()),
            config,
            state: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(WriterState {
                owner: 0,
                pending: None,
                log,
            }),
            writer_cv: Condvar::new(),
            writer_owner: AtomicU64::new(0),
            blobs,
            notifier: Notifier::start(name)?,
            sweeper: Arc::new(SweeperSignal::default()),
        });
        if !read_only {
            let weak = Arc::downgrade(&inner);
            let signal = inner.sweeper.clone();
            thread::Builder::new()
                .name(format!("cbl-expire-{}", name))
                .spawn(move || sweeper_loop(weak, signal))?;
        }
        registry.insert(path, Arc::downgrade(&inner));
        cbl_log!(
            LogDomain::Database,
            Info,
            "opened database {}",
            inner.path.display()
        );
        Ok(inner)
    }

    #[inline]
    fn read_only(&self) -> bool {
        self.config.flags.contains(DatabaseFlags::READ_ONLY)
    }

    pub(crate) fn check_observable(&self) -> Result<()> {
        if self.config.flags.contains(DatabaseFlags::NON_OBSERVABLE) {
            Err(CblErrorCode::Unsupported.into())
        } else {
            Ok(())
        }
    }

    /// Last committed snapshot
    #[inline]
    pub(crate) fn current(&self) -> Arc<Snapshot> {
        read_lock(&self.state).clone()
    }

    /// Snapshot to read from: transaction's working copy on the
    /// thread that owns writer lock, otherwise last committed one
    pub(crate) fn read_snapshot(&self) -> Arc<Snapshot> {
        let me = thread_token();
        if self.writer_owner.load(Ordering::Acquire) == me {
            let w = lock(&self.writer);
            if let Some(pending) = w.pending.as_ref().filter(|_| w.owner == me) {
                return pending.working.clone();
            }
        }
        self.current()
    }

    #[inline]
    pub(crate) fn in_transaction(&self) -> bool {
        self.writer_owner.load(Ordering::Acquire) == thread_token()
    }

    pub(crate) fn begin(&self) -> Result<()> {
        if self.read_only() {
            return Err(CblErrorCode::NotWriteable.into());
        }
        let me = thread_token();
        let mut w = lock(&self.writer);
        if w.owner == me {
            return Err(CblErrorCode::TransactionNotClosed.into());
        }
        while w.owner != 0 {
            w = match self.writer_cv.wait(w) {
                Ok(x) => x,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        w.owner = me;
        w.pending = Some(PendingCommit::new(self.current()));
        self.writer_owner.store(me, Ordering::Release);
        Ok(())
    }

    pub(crate) fn end(&self, commit: bool) -> Result<()> {
        let me = thread_token();
        let (ready, expirations_changed) = {
            let mut w = lock(&self.writer);
            if w.owner != me {
                return Err(CblErrorCode::NotInTransaction.into());
            }
            let pending = w.pending.take();
            w.owner = 0;
            self.writer_owner.store(0, Ordering::Release);
            self.writer_cv.notify_all();
            let Some(pending) = pending.filter(|x| commit && !x.is_empty()) else {
                return Ok(());
            };
            let PendingCommit {
                working,
                ops,
                changes,
                expirations_changed,
            } = pending;
            let n_ops = ops.len();
            w.log.append(&LogRecord::Commit(CommitRecord {
                last_sequence: working.last_sequence,
                ops,
            }))?;
            *write_lock(&self.state) = working;
            trace!("{}: committed {} operations", self.name, n_ops);
            (self.notifier.queue_commit(changes), expirations_changed)
        };
        Notifier::fire_ready(ready);
        if expirations_changed {
            self.kick_sweeper();
        }
        Ok(())
    }

    /// Run `f` over changes of transaction owned by current thread
    pub(crate) fn with_pending<R>(
        &self,
        f: impl FnOnce(&mut PendingCommit) -> Result<R>,
    ) -> Result<R> {
        let me = thread_token();
        let mut w = lock(&self.writer);
        if w.owner != me {
            return Err(CblErrorCode::NotInTransaction.into());
        }
        let pending = w
            .pending
            .as_mut()
            .ok_or_else(|| Error::from(CblErrorCode::NotInTransaction))?;
        f(pending)
    }

    /// Join transaction of current thread, or run `f` in its own one
    pub(crate) fn in_write<R>(&self, f: impl FnOnce(&mut PendingCommit) -> Result<R>) -> Result<R> {
        if self.in_transaction() {
            return self.with_pending(f);
        }
        self.begin()?;
        match self.with_pending(f) {
            Ok(ret) => {
                self.end(true)?;
                Ok(ret)
            }
            Err(err) => {
                if let Err(err2) = self.end(false) {
                    cbl_log!(LogDomain::Database, Error, "rollback failed: {}", err2);
                }
                Err(err)
            }
        }
    }

    pub(crate) fn add_commit_hook(&self, hook: CommitHook) -> Result<ListenerToken> {
        self.check_observable()?;
        Ok(self.notifier.add_listener(Listener::Commit(hook)))
    }

    fn kick_sweeper(&self) {
        *lock(&self.sweeper.kicked) = true;
        self.sweeper.cv.notify_all();
    }

    /// Purge documents with expiration in the past, returns how many were purged
    fn purge_expired(&self) -> Result<usize> {
        let now = now_ms();
        let snap = self.current();
        let expired: Vec<(CollectionSpec, String)> = snap
            .collections
            .iter()
            .flat_map(|(spec, coll)| {
                coll.expirations
                    .iter()
                    .take_while(|(ts, _)| *ts <= now)
                    .map(|(_, id)| (spec.clone(), id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        self.in_write(|pending| {
            let mut n = 0;
            for (spec, id) in &expired {
                let still_expired = pending
                    .snapshot()
                    .get_doc(spec, id)
                    .ok()
                    .flatten()
                    .and_then(|x| x.expiration)
                    .map_or(false, |ts| ts <= now);
                if still_expired {
                    pending.apply(
                        LogOp::PurgeDoc {
                            scope: spec.scope.clone(),
                            collection: spec.name.clone(),
                            id: id.clone(),
                        },
                        false,
                    )?;
                    n += 1;
                }
            }
            Ok(n)
        })
    }

    pub(crate) fn get_local(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.read_snapshot().local_docs.get(key).cloned()
    }

    pub(crate) fn put_local(&self, key: &str, value: Option<Vec<u8>>) -> Result<()> {
        self.in_write(|pending| {
            pending.apply(
                LogOp::PutLocal {
                    key: key.into(),
                    value: value.map(ByteBuf),
                },
                false,
            )
        })
    }

    #[inline]
    pub(crate) fn public_uuid(&self) -> Uuid {
        read_lock(&self.uuids).0
    }

    #[inline]
    pub(crate) fn private_uuid(&self) -> Uuid {
        read_lock(&self.uuids).1
    }

    /// Take writer lock for maintenance, `f` gets exclusive access to log
    fn exclusive<R>(&self, f: impl FnOnce(&mut CommitLog, &Snapshot) -> Result<R>) -> Result<R> {
        self.begin()?;
        let ret = {
            let mut w = lock(&self.writer);
            let snap = self.current();
            f(&mut w.log, &snap)
        };
        self.end(false)?;
        ret
    }

    #[inline]
    fn cipher(&self) -> Option<Cipher> {
        cipher_of(read_lock(&self.key).as_ref())
    }

    fn compact(&self) -> Result<()> {
        let cipher = self.cipher();
        let (public, private) = *read_lock(&self.uuids);
        let removed = self.exclusive(|log, snap| {
            let header = HeaderRecord {
                version: FORMAT_VERSION,
                public_uuid: public.to_string(),
                private_uuid: private.to_string(),
            };
            let path = log.path().to_path_buf();
            let before = log.len();
            *log = write_compacted(&path, cipher, header, snap)?;
            debug!(
                "{}: compacted log {} -> {} bytes",
                self.name,
                before,
                log.len()
            );
            self.blobs.delete_unreferenced(&used_blobs(snap))
        })?;
        cbl_log!(
            LogDomain::Database,
            Info,
            "{}: compaction removed {} blobs",
            self.name,
            removed
        );
        Ok(())
    }

    fn reindex(&self) -> Result<()> {
        self.begin()?;
        let ret = self.with_pending(|pending| {
            let snap = Arc::make_mut(&mut pending.working);
            for coll in snap.collections.values_mut() {
                Arc::make_mut(coll).rebuild_indexes()?;
            }
            // index contents are not persisted, publish them without log record
            *write_lock(&self.state) = pending.working.clone();
            Ok(())
        });
        self.end(false)?;
        ret
    }

    fn integrity_check(&self) -> Result<()> {
        let cipher = self.cipher();
        let log_path = self.path.join(LOG_FILE_NAME);
        self.exclusive(|_, snap| {
            let (_, records) = CommitLog::open(&log_path, cipher, false)?;
            let (replayed, _) = replay(records)?;
            for (spec, coll) in &snap.collections {
                let other = replayed.collection(spec)?;
                if other.docs.len() != coll.docs.len() {
                    cbl_log!(
                        LogDomain::Database,
                        Error,
                        "{}: collection {} does not match log",
                        self.name,
                        spec
                    );
                    return Err(CblErrorCode::Corrupt.into());
                }
                for doc in coll.docs.values() {
                    if !doc.deleted && doc.body.root_dict().is_none() {
                        return Err(CblErrorCode::CorruptRevisionData.into());
                    }
                }
            }
            self.blobs.verify()
        })
    }

    fn rekey(&self, new_key: Option<EncryptionKey>) -> Result<()> {
        let new_cipher = cipher_of(new_key.as_ref());
        let (public, private) = *read_lock(&self.uuids);
        self.exclusive(|log, snap| {
            let header = HeaderRecord {
                version: FORMAT_VERSION,
                public_uuid: public.to_string(),
                private_uuid: private.to_string(),
            };
            let path = log.path().to_path_buf();
            self.blobs.rekey(new_cipher.clone())?;
            *log = write_compacted(&path, new_cipher, header, snap)?;
            Ok(())
        })?;
        *write_lock(&self.key) = new_key;
        Ok(())
    }
}

fn sweeper_loop(db: Weak<DbInner>, signal: Arc<SweeperSignal>) {
    loop {
        let next = match db.upgrade() {
            Some(db) => {
                match db.purge_expired() {
                    Ok(0) => {}
                    Ok(n) => cbl_log!(
                        LogDomain::Database,
                        Info,
                        "{}: purged {} expired documents",
                        db.name,
                        n
                    ),
                    Err(err) => cbl_log!(
                        LogDomain::Database,
                        Warning,
                        "{}: purge of expired documents failed: {}",
                        db.name,
                        err
                    ),
                }
                db.current().next_expiration()
            }
            None => return,
        };
        let wait_ms = next.map_or(SWEEP_INTERVAL_MS, |ts| {
            (ts - now_ms()).clamp(0, SWEEP_INTERVAL_MS)
        });
        let mut kicked = lock(&signal.kicked);
        if !*kicked && !signal.shutdown.load(Ordering::Acquire) && wait_ms > 0 {
            // u64 conversion can not fail after clamp
            let timeout = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0));
            kicked = match signal.cv.wait_timeout(kicked, timeout) {
                Ok((x, _)) => x,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *kicked = false;
        if signal.shutdown.load(Ordering::Acquire) {
            return;
        }
    }
}

/// A connection to a couchbase-lite database.
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
    encoder: Encoder,
    pub(crate) db_observers: Vec<DatabaseObserver>,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::from_inner(self.inner.clone())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Database({})", self.inner.path.display())
    }
}

impl Drop for Database {
    #[inline]
    fn drop(&mut self) {
        self.db_observers.clear();
    }
}

impl Database {
    pub(crate) fn from_inner(inner: Arc<DbInner>) -> Self {
        Self {
            inner,
            encoder: Encoder::new(),
            db_observers: Vec::new(),
        }
    }

    /// Open database `name` in `config.directory`, `None` means default configuration
    pub fn open(name: &str, config: Option<DatabaseConfig>) -> Result<Self> {
        DbInner::open(name, config.unwrap_or_default()).map(Self::from_inner)
    }

    pub fn open_with_flags(path: &Path, flags: DatabaseFlags) -> Result<Self> {
        let parent_path = path.parent().ok_or_else(|| {
            Error::LogicError(format!("path {path:?} has no parent diretory"))
        })?;
        let cfg = DatabaseConfig::new(parent_path, flags);
        let db_name = path
            .file_name()
            .ok_or_else(|| Error::LogicError(format!("path {path:?} has no last part")))?
            .to_str()
            .ok_or(Error::InvalidUtf8)?
            .strip_suffix(DB_EXTENSION)
            .ok_or_else(|| {
                Error::LogicError(format!(
                    "path {path:?} should have last part with .cblite2 suffix"
                ))
            })?;
        Database::open(db_name, Some(cfg))
    }

    /// Is there database `name` in `directory`
    pub fn exists(name: &str, directory: &Path) -> bool {
        db_path(name, directory).join(LOG_FILE_NAME).is_file()
    }

    /// Delete database files, returns `false` if there was nothing to delete.
    /// Fails with `Busy` if the database is open.
    pub fn delete_database(name: &str, directory: &Path) -> Result<bool> {
        let path = db_path(name, directory);
        if is_open(&path) {
            return Err(CblErrorCode::Busy.into());
        }
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&path)?;
        cbl_log!(LogDomain::Database, Info, "deleted database {}", path.display());
        Ok(true)
    }

    /// Copy database at `from_path` to `to_name` in `config.directory`.
    /// The copy gets new UUIDs, so replicators treat it as new database.
    pub fn copy_database(from_path: &Path, to_name: &str, config: Option<DatabaseConfig>) -> Result<()> {
        let config = config.unwrap_or_default();
        let to_path = db_path(to_name, &config.directory);
        if to_path.exists() {
            return Err(CblError::posix(EEXIST).into());
        }
        let cipher = cipher_of(config.encryption_key.as_ref());
        let (_, records) = CommitLog::open(&from_path.join(LOG_FILE_NAME), cipher.clone(), false)?;
        let (snap, _) = replay(records)?;
        fs::create_dir_all(&to_path)?;
        let ret = (|| {
            write_compacted(&to_path.join(LOG_FILE_NAME), cipher, new_header(), &snap)?;
            let from_blobs = attachments_dir(from_path);
            let to_blobs = attachments_dir(&to_path);
            fs::create_dir_all(&to_blobs)?;
            if from_blobs.is_dir() {
                for entry in fs::read_dir(&from_blobs)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        fs::copy(entry.path(), to_blobs.join(entry.file_name()))?;
                    }
                }
            }
            Ok(())
        })();
        if ret.is_err() {
            let _ = fs::remove_dir_all(&to_path);
        }
        ret
    }

    /// Close this handle. Database files are closed when the last handle goes away.
    pub fn close(self) -> Result<()> {
        if self.inner.in_transaction() {
            return Err(CblErrorCode::TransactionNotClosed.into());
        }
        Ok(())
    }

    /// Close and delete database, fails with `Busy` if there are other open handles
    pub fn delete(mut self) -> Result<()> {
        if self.inner.in_transaction() {
            return Err(CblErrorCode::TransactionNotClosed.into());
        }
        self.db_observers.clear();
        if Arc::strong_count(&self.inner) > 1 {
            cbl_log!(
                LogDomain::Database,
                Warning,
                "can not delete {}: still in use",
                self.inner.path.display()
            );
            return Err(CblErrorCode::Busy.into());
        }
        let path = self.inner.path.clone();
        let name = self.inner.name.clone();
        let directory = self.inner.config.directory.clone();
        drop(self);
        lock(registry()).remove(&path);
        Database::delete_database(&name, &directory).map(|_| ())
    }

    /// Begin a new transaction, the transaction defaults to rolling back
    /// when it is dropped. If you want the transaction to commit,
    /// you must call `Transaction::commit`
    #[inline]
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Transaction::new(self)
    }

    /// Manual form of `transaction`, must be paired with `end_transaction`
    /// on the same thread
    #[inline]
    pub fn begin_transaction(&self) -> Result<()> {
        self.inner.begin()
    }

    #[inline]
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        self.inner.end(commit)
    }

    /// Returns the name of the database, this is the directory
    /// name _without_ the ".cblite2" extension.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }
    #[inline]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
    #[inline]
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Returns the number of (undeleted) documents in the default collection
    #[inline]
    pub fn count(&self) -> u64 {
        self.default_collection()
            .and_then(|c| c.count())
            .unwrap_or(0)
    }

    #[inline]
    pub fn document_count(&self) -> u64 {
        self.count()
    }

    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.inner.read_snapshot().last_sequence
    }

    /// Returns the database's public and private UUIDs
    #[inline]
    pub fn uuids(&self) -> Result<(Uuid, Uuid)> {
        Ok(*read_lock(&self.inner.uuids))
    }

    pub fn perform_maintenance(&self, kind: MaintenanceType) -> Result<()> {
        cbl_log!(
            LogDomain::Database,
            Info,
            "{}: maintenance {:?}",
            self.inner.name,
            kind
        );
        match kind {
            MaintenanceType::Compact => self.inner.compact(),
            MaintenanceType::Reindex | MaintenanceType::Optimize | MaintenanceType::FullOptimize => {
                self.inner.reindex()
            }
            MaintenanceType::IntegrityCheck => self.inner.integrity_check(),
        }
    }

    /// Encrypt, decrypt or re-encrypt database with new key.
    /// Other handles of this database keep working, but it should be
    /// reopened with the new key next time.
    pub fn change_encryption_key(&mut self, new_key: Option<EncryptionKey>) -> Result<()> {
        let new_key = new_key.filter(|x| x.algorithm != EncryptionAlgorithm::None);
        self.inner.rekey(new_key)?;
        cbl_log!(
            LogDomain::Database,
            Info,
            "{}: encryption key changed",
            self.inner.name
        );
        Ok(())
    }

    pub fn default_collection(&self) -> Result<Collection> {
        Ok(Collection::new(self.inner.clone(), CollectionSpec::default()))
    }

    pub fn default_scope(&self) -> Scope {
        Scope {
            db: self.inner.clone(),
            name: DEFAULT_NAME.into(),
        }
    }

    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read_snapshot()
            .collections
            .keys()
            .map(|x| x.scope.clone())
            .collect();
        names.dedup();
        names
    }

    pub fn scope(&self, scope_name: &str) -> Option<Scope> {
        self.scope_names()
            .into_iter()
            .find(|x| x == scope_name)
            .map(|name| Scope {
                db: self.inner.clone(),
                name,
            })
    }

    pub fn collection_names(&self, scope_name: &str) -> Vec<String> {
        self.inner
            .read_snapshot()
            .collections
            .keys()
            .filter(|x| x.scope == scope_name)
            .map(|x| x.name.clone())
            .collect()
    }

    /// Returns existing collection, or `None`
    pub fn collection(&self, name: &str, scope_name: &str) -> Result<Option<Collection>> {
        check_name(name)?;
        check_name(scope_name)?;
        let spec = CollectionSpec::new(name, scope_name);
        if self.inner.read_snapshot().collections.contains_key(&spec) {
            Ok(Some(Collection::new(self.inner.clone(), spec)))
        } else {
            Ok(None)
        }
    }

    /// Create collection, or return existing one
    pub fn create_collection(&self, name: &str, scope_name: &str) -> Result<Collection> {
        check_name(name)?;
        check_name(scope_name)?;
        let spec = CollectionSpec::new(name, scope_name);
        self.inner.in_write(|pending| {
            if pending.snapshot().collections.contains_key(&spec) {
                return Ok(());
            }
            cbl_log!(LogDomain::Database, Info, "create collection {}", spec);
            pending.apply(
                LogOp::CreateCollection {
                    scope: spec.scope.clone(),
                    name: spec.name.clone(),
                },
                false,
            )
        })?;
        Ok(Collection::new(self.inner.clone(), spec))
    }

    /// Delete collection with all its documents and indexes
    pub fn delete_collection(&self, name: &str, scope_name: &str) -> Result<()> {
        check_name(name)?;
        check_name(scope_name)?;
        let spec = CollectionSpec::new(name, scope_name);
        if spec.is_default() {
            return Err(CblErrorCode::InvalidParameter.into());
        }
        self.inner.in_write(|pending| {
            if !pending.snapshot().collections.contains_key(&spec) {
                return Ok(());
            }
            pending.apply(
                LogOp::DeleteCollection {
                    scope: spec.scope.clone(),
                    name: spec.name.clone(),
                },
                false,
            )
        })
    }

    /// Return document from default collection, `None` if there is no such
    /// document or it is deleted
    #[inline]
    pub fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        self.default_collection()?.get_document(doc_id)
    }

    /// Return existing document from database
    pub fn get_existing(&self, doc_id: &str) -> Result<Document> {
        self.get_document(doc_id)?.ok_or_else(Error::not_found)
    }

    #[inline]
    pub fn get_mutable_document(&self, doc_id: &str) -> Result<Option<MutableDocument>> {
        self.default_collection()?.get_mutable_document(doc_id)
    }

    #[inline]
    pub fn save_document(&self, doc: &mut MutableDocument) -> Result<()> {
        self.default_collection()?.save_document(doc)
    }

    #[inline]
    pub fn save_document_with_concurrency_control(
        &self,
        doc: &mut MutableDocument,
        cc: ConcurrencyControl,
    ) -> Result<()> {
        self.default_collection()?
            .save_document_with_concurrency_control(doc, cc)
    }

    #[inline]
    pub fn save_document_with_conflict_handler<F>(
        &self,
        doc: &mut MutableDocument,
        conflict_handler: F,
    ) -> Result<()>
    where
        F: FnMut(&mut MutableDocument, Option<&Document>) -> bool,
    {
        self.default_collection()?
            .save_document_with_conflict_handler(doc, conflict_handler)
    }

    #[inline]
    pub fn delete_document(&self, doc: &Document) -> Result<()> {
        self.default_collection()?.delete_document(doc)
    }

    #[inline]
    pub fn delete_document_with_concurrency_control(
        &self,
        doc: &Document,
        cc: ConcurrencyControl,
    ) -> Result<()> {
        self.default_collection()?
            .delete_document_with_concurrency_control(doc, cc)
    }

    #[inline]
    pub fn purge_document(&self, doc: &Document) -> Result<()> {
        self.default_collection()?.purge_document(doc)
    }

    #[inline]
    pub fn purge_document_by_id(&self, doc_id: &str) -> Result<()> {
        self.default_collection()?.purge_document_by_id(doc_id)
    }

    #[inline]
    pub fn get_document_expiration(&self, doc_id: &str) -> Result<Option<i64>> {
        self.default_collection()?.get_document_expiration(doc_id)
    }

    #[inline]
    pub fn set_document_expiration(&self, doc_id: &str, expiration: Option<i64>) -> Result<()> {
        self.default_collection()?
            .set_document_expiration(doc_id, expiration)
    }

    /// Compiles a query from an expression given as JSON.
    /// The expression is a predicate that describes which documents should be returned.
    /// A separate, optional sort expression describes the ordering of the results.
    #[inline]
    pub fn query(&self, query_json: &str) -> Result<Query<'_>> {
        Query::new(self, QueryLanguage::Json, query_json)
    }

    /// Compiles a query from an expression given as N1QL.
    #[inline]
    pub fn n1ql_query(&self, query: &str) -> Result<Query<'_>> {
        Query::new(self, QueryLanguage::N1ql, query)
    }

    #[inline]
    pub fn create_query(&self, language: QueryLanguage, source: &str) -> Result<Query<'_>> {
        Query::new(self, language, source)
    }

    /// Creates an enumerator ordered by docID.
    #[inline]
    pub fn enumerate_all_docs(&self, flags: DocEnumeratorFlags) -> Result<DocEnumerator> {
        self.default_collection()?.enumerate_all_docs(flags)
    }

    /// Listener for changes of default collection
    pub fn add_change_listener<F>(&self, listener: F) -> Result<ListenerToken>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.default_collection()?.add_change_listener(listener)
    }

    pub fn add_document_change_listener<F>(&self, doc_id: &str, listener: F) -> Result<ListenerToken>
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.default_collection()?
            .add_document_change_listener(doc_id, listener)
    }

    /// Switch notifications to buffered mode: instead of delivering on
    /// internal thread they are queued, `ready_callback` is called when the
    /// queue becomes non-empty, `send_notifications` delivers the queue
    pub fn buffer_notifications<F>(&self, ready_callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.notifier.buffer_notifications(Arc::new(ready_callback));
    }

    /// Deliver queued notifications on the calling thread
    #[inline]
    pub fn send_notifications(&self) {
        self.inner.notifier.send_notifications();
    }

    pub(crate) fn add_commit_hook(&self, hook: CommitHook) -> Result<ListenerToken> {
        self.inner.add_commit_hook(hook)
    }

    /// Register a database observer, with a callback that will be invoked after the database
    /// changes. The callback will be called _once_, after the first change. After that it won't
    /// be called again until all of the changes have been read by calling `Database::observed_changes`.
    pub fn register_observer<F>(&mut self, callback_f: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let obs = DatabaseObserver::new(self, callback_f)?;
        self.db_observers.push(obs);
        Ok(())
    }

    /// Remove all database observers
    #[inline]
    pub fn clear_observers(&mut self) {
        self.db_observers.clear();
    }

    /// Get observed changes for this database
    #[inline]
    pub fn observed_changes(&mut self) -> ObserverdChangesIter<'_> {
        ObserverdChangesIter {
            db: self,
            obs_idx: 0,
        }
    }

    /// Use runtime of `handle` for websocket connections of replicators,
    /// by default every replicator has its own runtime
    #[cfg(feature = "use-tokio-websocket")]
    #[inline]
    pub fn init_socket_impl(handle: tokio::runtime::Handle) {
        crate::replicator::init_tokio_socket_impl(handle);
    }

    /// Get shared "fleece" encoder, `&mut self` to make possible
    /// exists only one session
    pub fn shared_encoder_session(&mut self) -> Result<FlEncoderSession> {
        Ok(self.encoder.session())
    }

    /// Returns information about all indexes of default collection
    pub fn get_indexes(
        &self,
    ) -> Result<impl FallibleStreamingIterator<Item = IndexInfo, Error = Error>> {
        self.default_collection()?.get_indexes()
    }

    /// Creates index in default collection, see `Collection::create_index`
    pub fn create_index(
        &self,
        index_name: &str,
        expression_json: &str,
        index_type: IndexType,
        index_options: Option<IndexOptions>,
    ) -> Result<()> {
        self.default_collection()?
            .create_index(index_name, expression_json, index_type, index_options)
    }

    #[inline]
    pub fn create_value_index(&self, name: &str, config: &ValueIndexConfiguration) -> Result<()> {
        self.default_collection()?.create_value_index(name, config)
    }

    #[inline]
    pub fn create_full_text_index(
        &self,
        name: &str,
        config: &FullTextIndexConfiguration,
    ) -> Result<()> {
        self.default_collection()?
            .create_full_text_index(name, config)
    }

    #[inline]
    pub fn delete_index(&self, name: &str) -> Result<()> {
        self.default_collection()?.delete_index(name)
    }

    #[inline]
    pub fn index_names(&self) -> Result<Vec<String>> {
        self.default_collection()?.index_names()
    }

    /// Stream for writing big blobs without keeping them in memory
    pub fn blob_writer(&self) -> Result<BlobWriter> {
        self.inner.blobs.writer()
    }

    /// Blob referenced by properties `dict` of document
    pub fn get_blob(&self, dict: Dict<'_>) -> Result<Blob> {
        Blob::from_properties(dict, &self.inner.blobs)
    }

    /// Write content of blob created with `Blob::new` to database,
    /// without saving document referencing it
    pub fn save_blob(&self, blob: &Blob) -> Result<()> {
        if self.inner.blobs.contains(blob.digest()) {
            return Ok(());
        }
        let content = blob
            .pending_content()
            .ok_or_else(Error::not_found)?;
        self.inner.blobs.install(blob.digest(), content)
    }
}

/// Group of collections
#[derive(Clone)]
pub struct Scope {
    db: Arc<DbInner>,
    name: String,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self.name)
    }
}

impl Scope {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn collection_names(&self) -> Vec<String> {
        Database::from_inner(self.db.clone()).collection_names(&self.name)
    }
    pub fn collection(&self, name: &str) -> Result<Option<Collection>> {
        Database::from_inner(self.db.clone()).collection(name, &self.name)
    }
}
