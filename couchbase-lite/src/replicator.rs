//! Replicator keeps local database in sync with a peer: another local database
//! or a remote one reachable through websocket.
//!
//! Each running replicator owns a worker thread with its own tokio runtime
//! (or uses the runtime passed to `Database::init_socket_impl`). Listener
//! callbacks are called from that thread.

mod session;
#[cfg(feature = "use-tokio-websocket")]
pub(crate) mod tokio_socket;

use crate::{
    collection::{Collection, CollectionSpec},
    conflict_resolver::{default_conflict_resolver, ConflictResolver},
    database::DbInner,
    document::{Document, MutableDocument},
    encryptable::{PropertyDecryptor, PropertyEncryptor},
    error::{CblError, CblErrorCode, Error, NetworkErrorCode, Result},
    lock,
    logging::{cbl_log, LogDomain},
    observer::ListenerToken,
    Database,
};
use bitflags::bitflags;
use log::{error, info, trace};
use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};
use tokio::sync::Notify;

#[cfg(feature = "use-tokio-websocket")]
pub use self::tokio_socket::{
    ConnectionStatus, ListenerPasswordAuthenticator, UrlEndpointListener,
    UrlEndpointListenerConfiguration,
};

const DEFAULT_MAX_ATTEMPTS_ONE_SHOT: u32 = 10;
const DEFAULT_MAX_ATTEMPT_WAIT_TIME: Duration = Duration::from_secs(300);
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(300);
pub(crate) const SESSION_COOKIE_NAME: &str = "SyncGatewaySession";

#[cfg(feature = "use-tokio-websocket")]
static SOCKET_RUNTIME: std::sync::OnceLock<tokio::runtime::Handle> = std::sync::OnceLock::new();

/// Drive replicators' network I/O by runtime of `handle`, it should be
/// multi thread runtime
#[cfg(feature = "use-tokio-websocket")]
pub(crate) fn init_tokio_socket_impl(handle: tokio::runtime::Handle) {
    if SOCKET_RUNTIME.set(handle).is_err() {
        cbl_log!(
            LogDomain::Network,
            Warning,
            "socket runtime already initialized, ignoring"
        );
    }
}

/// Parsed `ws://` or `wss://` URL of remote database
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EndpointUrl {
    pub url: String,
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl EndpointUrl {
    fn parse(url: &str) -> Result<Self> {
        let invalid = || Error::from(CblError::network(NetworkErrorCode::InvalidUrl));
        let (tls, rest) = if let Some(rest) = url.strip_prefix("ws://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("wss://") {
            (true, rest)
        } else {
            return Err(invalid());
        };
        let (authority, path) = rest.split_once('/').ok_or_else(invalid)?;
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Err(invalid());
        }
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(invalid)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() || host.contains(['@', ' ', '/']) {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None if tls => 443,
            None => 80,
        };
        Ok(Self {
            url: url.into(),
            tls,
            host: host.into(),
            port,
            path: path.into(),
        })
    }
}

#[derive(Clone)]
enum EndpointKind {
    Url(EndpointUrl),
    LocalDb(Arc<DbInner>),
}

/// Peer of replication
#[derive(Clone)]
pub struct Endpoint {
    kind: EndpointKind,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EndpointKind::Url(url) => write!(f, "Endpoint({})", url.url),
            EndpointKind::LocalDb(db) => write!(f, "Endpoint(local {})", db.path.display()),
        }
    }
}

impl Endpoint {
    /// For example: url "ws://192.168.1.132:4984/demo/"
    pub fn with_url(url: &str) -> Result<Self> {
        Ok(Self {
            kind: EndpointKind::Url(EndpointUrl::parse(url)?),
        })
    }
    /// Replicate with another database opened in this process
    pub fn with_local_db(db: &Database) -> Self {
        Self {
            kind: EndpointKind::LocalDb(db.inner.clone()),
        }
    }
    pub fn url(&self) -> Option<&str> {
        match &self.kind {
            EndpointKind::Url(url) => Some(&url.url),
            EndpointKind::LocalDb(_) => None,
        }
    }
    /// Identity of peer, part of checkpoint id
    fn remote_key(&self) -> String {
        match &self.kind {
            EndpointKind::Url(url) => url.url.clone(),
            EndpointKind::LocalDb(db) => format!("local:{}", db.path.display()),
        }
    }
}

/// Credentials sent to peer
#[derive(Clone, PartialEq, Eq)]
pub enum Authenticator {
    Basic {
        username: String,
        password: String,
    },
    /// Session cookie, `cookie_name` is `SyncGatewaySession` if not set
    Session {
        session_id: String,
        cookie_name: Option<String>,
    },
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            Authenticator::Session { cookie_name, .. } => write!(
                f,
                "Session({}=***)",
                cookie_name.as_deref().unwrap_or(SESSION_COOKIE_NAME)
            ),
        }
    }
}

impl Authenticator {
    pub fn basic(username: &str, password: &str) -> Self {
        Authenticator::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
    pub fn session(session_id: &str, cookie_name: Option<&str>) -> Self {
        Authenticator::Session {
            session_id: session_id.into(),
            cookie_name: cookie_name.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Https,
}

/// HTTP proxy, connection is tunneled through `CONNECT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub proxy_type: ProxyType,
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorType {
    PushAndPull,
    Push,
    Pull,
}

impl ReplicatorType {
    #[inline]
    fn push(self) -> bool {
        self != ReplicatorType::Pull
    }
    #[inline]
    fn pull(self) -> bool {
        self != ReplicatorType::Push
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplicatedDocumentFlags: u32 {
        /// The document has been deleted
        const DELETED = 0x01;
        /// Lost access to the document on the server
        const ACCESS_REMOVED = 0x02;
    }
}

/// Should document be replicated
pub type ReplicationFilter = Arc<dyn Fn(&Document, ReplicatedDocumentFlags) -> bool + Send + Sync>;

/// Per collection replication settings
#[derive(Clone)]
pub struct ReplicationCollection {
    pub(crate) spec: CollectionSpec,
    pub(crate) channels: Vec<String>,
    pub(crate) document_ids: Vec<String>,
    pub(crate) push_filter: Option<ReplicationFilter>,
    pub(crate) pull_filter: Option<ReplicationFilter>,
    pub(crate) conflict_resolver: Option<ConflictResolver>,
}

impl fmt::Debug for ReplicationCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationCollection")
            .field("spec", &self.spec)
            .field("channels", &self.channels)
            .field("document_ids", &self.document_ids)
            .field("push_filter", &self.push_filter.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("conflict_resolver", &self.conflict_resolver.is_some())
            .finish()
    }
}

impl ReplicationCollection {
    pub fn new(collection: &Collection) -> Self {
        Self::with_spec(collection.spec().clone())
    }
    fn with_spec(spec: CollectionSpec) -> Self {
        Self {
            spec,
            channels: Vec::new(),
            document_ids: Vec::new(),
            push_filter: None,
            pull_filter: None,
            conflict_resolver: None,
        }
    }
    /// Pull only documents from these channels
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }
    pub fn with_document_ids(mut self, document_ids: Vec<String>) -> Self {
        self.document_ids = document_ids;
        self
    }
    pub fn with_push_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, ReplicatedDocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.push_filter = Some(Arc::new(filter));
        self
    }
    pub fn with_pull_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, ReplicatedDocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.pull_filter = Some(Arc::new(filter));
        self
    }
    pub fn with_conflict_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, Option<&Document>, Option<&Document>) -> Option<MutableDocument>
            + Send
            + Sync
            + 'static,
    {
        self.conflict_resolver = Some(Arc::new(resolver));
        self
    }
    #[inline]
    pub fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    /// Own settings, or settings of `defaults` where they are not set
    fn or(&self, defaults: &ReplicationCollection) -> Self {
        let pick = |own: &Vec<String>, other: &Vec<String>| {
            if own.is_empty() {
                other.clone()
            } else {
                own.clone()
            }
        };
        Self {
            spec: self.spec.clone(),
            channels: pick(&self.channels, &defaults.channels),
            document_ids: pick(&self.document_ids, &defaults.document_ids),
            push_filter: self.push_filter.clone().or_else(|| defaults.push_filter.clone()),
            pull_filter: self.pull_filter.clone().or_else(|| defaults.pull_filter.clone()),
            conflict_resolver: self
                .conflict_resolver
                .clone()
                .or_else(|| defaults.conflict_resolver.clone()),
        }
    }

    pub(crate) fn resolver(&self) -> ConflictResolver {
        self.conflict_resolver
            .clone()
            .unwrap_or_else(|| Arc::new(default_conflict_resolver))
    }

    pub(crate) fn accepts_id(&self, doc_id: &str) -> bool {
        self.document_ids.is_empty() || self.document_ids.iter().any(|x| x == doc_id)
    }
}

/// Run user filter, panic means rejection
pub(crate) fn call_filter(
    filter: &ReplicationFilter,
    doc: &Document,
    flags: ReplicatedDocumentFlags,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| filter(doc, flags))).unwrap_or_else(|_| {
        cbl_log!(
            LogDomain::Replicator,
            Error,
            "replication filter panicked on {}, document skipped",
            doc.id()
        );
        false
    })
}

/// Parameters of replicator, built with `with_*` methods
#[derive(Clone)]
pub struct ReplicatorConfiguration {
    pub(crate) db: Arc<DbInner>,
    pub(crate) endpoint: Endpoint,
    pub(crate) replicator_type: ReplicatorType,
    pub(crate) continuous: bool,
    pub(crate) disable_auto_purge: bool,
    pub(crate) max_attempts: u32,
    pub(crate) max_attempt_wait_time: Duration,
    pub(crate) heartbeat: Duration,
    pub(crate) authenticator: Option<Authenticator>,
    pub(crate) proxy: Option<ProxySettings>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) pinned_server_certificate: Option<Vec<u8>>,
    pub(crate) trusted_root_certificates: Vec<Vec<u8>>,
    defaults: ReplicationCollection,
    collections: Vec<ReplicationCollection>,
    pub(crate) property_encryptor: Option<PropertyEncryptor>,
    pub(crate) property_decryptor: Option<PropertyDecryptor>,
}

impl fmt::Debug for ReplicatorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfiguration")
            .field("db", &self.db.name)
            .field("endpoint", &self.endpoint)
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("max_attempts", &self.max_attempts)
            .field("authenticator", &self.authenticator)
            .field("proxy", &self.proxy)
            .field("collections", &self.collections())
            .finish()
    }
}

impl ReplicatorConfiguration {
    pub fn new(db: &Database, endpoint: Endpoint) -> Self {
        Self {
            db: db.inner.clone(),
            endpoint,
            replicator_type: ReplicatorType::PushAndPull,
            continuous: false,
            disable_auto_purge: false,
            max_attempts: 0,
            max_attempt_wait_time: DEFAULT_MAX_ATTEMPT_WAIT_TIME,
            heartbeat: DEFAULT_HEARTBEAT,
            authenticator: None,
            proxy: None,
            headers: Vec::new(),
            pinned_server_certificate: None,
            trusted_root_certificates: Vec::new(),
            defaults: ReplicationCollection::with_spec(CollectionSpec::default()),
            collections: Vec::new(),
            property_encryptor: None,
            property_decryptor: None,
        }
    }
    pub fn with_replicator_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }
    /// Do not purge documents that lost access on server
    pub fn with_disable_auto_purge(mut self, disable: bool) -> Self {
        self.disable_auto_purge = disable;
        self
    }
    /// 0 means default: 10 for one-shot and unlimited for continuous,
    /// 1 means no retry
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
    pub fn with_max_attempt_wait_time(mut self, wait: Duration) -> Self {
        self.max_attempt_wait_time = wait;
        self
    }
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
    pub fn with_authenticator(mut self, auth: Authenticator) -> Self {
        self.authenticator = Some(auth);
        self
    }
    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }
    /// Extra HTTP header of websocket handshake
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
    /// Server certificate (DER or PEM), the only one accepted
    pub fn with_pinned_server_certificate(mut self, cert: Vec<u8>) -> Self {
        self.pinned_server_certificate = Some(cert);
        self
    }
    /// Additional trusted root certificate (DER or PEM)
    pub fn with_trusted_root_certificate(mut self, cert: Vec<u8>) -> Self {
        self.trusted_root_certificates.push(cert);
        self
    }
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.defaults.channels = channels;
        self
    }
    pub fn with_document_ids(mut self, document_ids: Vec<String>) -> Self {
        self.defaults.document_ids = document_ids;
        self
    }
    pub fn with_push_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, ReplicatedDocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.defaults.push_filter = Some(Arc::new(filter));
        self
    }
    pub fn with_pull_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, ReplicatedDocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.defaults.pull_filter = Some(Arc::new(filter));
        self
    }
    pub fn with_conflict_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, Option<&Document>, Option<&Document>) -> Option<MutableDocument>
            + Send
            + Sync
            + 'static,
    {
        self.defaults.conflict_resolver = Some(Arc::new(resolver));
        self
    }
    /// Replicate this collection, without any collections only default
    /// collection is replicated
    pub fn with_collection(mut self, collection: ReplicationCollection) -> Self {
        self.collections.retain(|x| x.spec != collection.spec);
        self.collections.push(collection);
        self
    }
    pub fn with_property_encryptor<F>(mut self, encryptor: F) -> Self
    where
        F: Fn(
                &crate::encryptable::PropertyCryptoContext<'_>,
                &[u8],
            ) -> Result<crate::encryptable::EncryptedValue>
            + Send
            + Sync
            + 'static,
    {
        self.property_encryptor = Some(Arc::new(encryptor));
        self
    }
    pub fn with_property_decryptor<F>(mut self, decryptor: F) -> Self
    where
        F: Fn(&crate::encryptable::PropertyCryptoContext<'_>, &[u8], &str, Option<&str>) -> Result<Vec<u8>>
            + Send
            + Sync
            + 'static,
    {
        self.property_decryptor = Some(Arc::new(decryptor));
        self
    }
    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
    #[inline]
    pub fn replicator_type(&self) -> ReplicatorType {
        self.replicator_type
    }

    /// Replicated collections with all settings resolved
    pub(crate) fn collections(&self) -> Vec<ReplicationCollection> {
        if self.collections.is_empty() {
            vec![self.defaults.clone()]
        } else {
            self.collections
                .iter()
                .map(|x| x.or(&self.defaults))
                .collect()
        }
    }

    fn effective_max_attempts(&self) -> u32 {
        match self.max_attempts {
            0 if self.continuous => u32::MAX,
            0 => DEFAULT_MAX_ATTEMPTS_ONE_SHOT,
            n => n,
        }
    }
}

/// The possible states of a replicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorActivityLevel {
    /// Finished, or got a fatal error.
    Stopped,
    /// Offline, replication doesn't not work
    Offline,
    /// Connection is in progress.
    Connecting,
    /// Continuous replicator has caught up and is waiting for changes.
    Idle,
    /// Connected and actively working.
    Busy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReplicatorProgress {
    /// Very approximate fraction of work done, 0.0 ..= 1.0
    pub complete: f32,
    /// Number of documents transferred so far
    pub document_count: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    pub activity: ReplicatorActivityLevel,
    pub progress: ReplicatorProgress,
    pub error: Option<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationDirection {
    Push,
    Pull,
}

/// Outcome of replication of one document
#[derive(Debug, Clone)]
pub struct ReplicatedDocument {
    pub collection: CollectionSpec,
    pub id: String,
    pub flags: ReplicatedDocumentFlags,
    pub error: Option<Error>,
}

type StatusListener = Arc<dyn Fn(&ReplicatorStatus) + Send + Sync>;
type DocumentListener = Arc<dyn Fn(ReplicationDirection, &[ReplicatedDocument]) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    status: BTreeMap<u64, StatusListener>,
    documents: BTreeMap<u64, DocumentListener>,
}

/// State shared by replicator handle and its worker thread
pub(crate) struct Shared {
    pub(crate) config: ReplicatorConfiguration,
    pub(crate) remote_key: Arc<str>,
    status: Mutex<ReplicatorStatus>,
    listeners: Mutex<Listeners>,
    running: AtomicBool,
    stop: AtomicBool,
    suspended: AtomicBool,
    reachable: AtomicBool,
    reset_checkpoint: AtomicBool,
    /// Wakes worker on stop, suspend and reachability changes
    pub(crate) wake: Notify,
}

impl Shared {
    #[inline]
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn online(&self) -> bool {
        !self.suspended.load(Ordering::Acquire) && self.reachable.load(Ordering::Acquire)
    }
    #[inline]
    pub(crate) fn take_reset_checkpoint(&self) -> bool {
        self.reset_checkpoint.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn activity(&self) -> ReplicatorActivityLevel {
        lock(&self.status).activity
    }

    pub(crate) fn progress(&self) -> ReplicatorProgress {
        lock(&self.status).progress
    }

    /// Change activity, listeners are called if something changed
    pub(crate) fn set_activity(&self, activity: ReplicatorActivityLevel, error: Option<Error>) {
        self.update_status(|status| {
            let changed = status.activity != activity || error.is_some();
            status.activity = activity;
            if error.is_some() || activity == ReplicatorActivityLevel::Connecting {
                status.error = error;
            }
            changed
        });
    }

    pub(crate) fn set_progress(&self, progress: ReplicatorProgress) {
        self.update_status(|status| {
            let changed = status.progress != progress;
            status.progress = progress;
            changed
        });
    }

    fn update_status(&self, f: impl FnOnce(&mut ReplicatorStatus) -> bool) {
        let status = {
            let mut status = lock(&self.status);
            if !f(&mut status) {
                return;
            }
            status.clone()
        };
        trace!(
            "{}: replicator status {:?}",
            self.config.db.name,
            status.activity
        );
        let listeners: Vec<StatusListener> =
            lock(&self.listeners).status.values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&status))).is_err() {
                error!("replicator status listener panicked");
            }
        }
    }

    pub(crate) fn report_documents(&self, direction: ReplicationDirection, docs: &[ReplicatedDocument]) {
        if docs.is_empty() {
            return;
        }
        let listeners: Vec<DocumentListener> =
            lock(&self.listeners).documents.values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(direction, docs))).is_err() {
                error!("document replication listener panicked");
            }
        }
    }
}

/// Wait between attempts: `2^attempt` seconds, but not more than `max`
fn retry_delay(attempt: u32, max: Duration) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max)
}

async fn wait_for_wake(shared: &Shared, timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(timeout) => {}
            }
        }
        None => shared.wake.notified().await,
    }
}

/// Connect, replicate, retry transient errors. Returns error that stopped
/// replication, `None` if it finished or was stopped
async fn run(shared: Arc<Shared>) -> Option<Error> {
    let max_attempts = shared.config.effective_max_attempts();
    let mut attempt = 0u32;
    loop {
        if shared.stop_requested() {
            return None;
        }
        if !shared.online() {
            shared.set_activity(ReplicatorActivityLevel::Offline, None);
            wait_for_wake(&shared, None).await;
            continue;
        }
        shared.set_activity(ReplicatorActivityLevel::Connecting, None);
        let result = match session::connect(&shared.config).await {
            Ok(conn) => session::Session::new(shared.clone(), conn).run(&mut attempt).await,
            Err(err) => Err(err),
        };
        let err = match result {
            Ok(session::SessionEnd::Finished) => return None,
            Ok(session::SessionEnd::Interrupted) => continue,
            Err(err) => err,
        };
        attempt = attempt.saturating_add(1);
        if !err.cbl_error().is_transient() || attempt >= max_attempts {
            cbl_log!(
                LogDomain::Replicator,
                Error,
                "{}: replication stopped after {} attempt(s): {}",
                shared.config.db.name,
                attempt,
                err
            );
            return Some(err);
        }
        let delay = retry_delay(attempt, shared.config.max_attempt_wait_time);
        cbl_log!(
            LogDomain::Replicator,
            Warning,
            "{}: replication failed: {}, retry in {:?}",
            shared.config.db.name,
            err,
            delay
        );
        shared.set_activity(ReplicatorActivityLevel::Offline, Some(err));
        wait_for_wake(&shared, Some(delay)).await;
    }
}

fn worker_main(shared: Arc<Shared>) {
    let fut = run(shared.clone());
    #[cfg(feature = "use-tokio-websocket")]
    let shared_runtime = SOCKET_RUNTIME.get().cloned();
    #[cfg(not(feature = "use-tokio-websocket"))]
    let shared_runtime: Option<tokio::runtime::Handle> = None;
    let error = match shared_runtime {
        Some(handle) => handle.block_on(fut),
        None => match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt.block_on(fut),
            Err(err) => Some(Error::from(err)),
        },
    };
    shared.running.store(false, Ordering::Release);
    shared.set_activity(ReplicatorActivityLevel::Stopped, error);
    info!("{}: replicator stopped", shared.config.db.name);
}

/// Replicator of database, created stopped
pub struct Replicator {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Replicator({:?}, {:?})",
            self.shared.config.endpoint,
            self.shared.activity()
        )
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Replicator {
    pub fn new(config: ReplicatorConfiguration) -> Result<Self> {
        let snap = config.db.current();
        for coll in config.collections() {
            if snap.collection(&coll.spec).is_err() {
                cbl_log!(
                    LogDomain::Replicator,
                    Error,
                    "collection {} does not exist in {}",
                    coll.spec,
                    config.db.name
                );
                return Err(CblErrorCode::InvalidParameter.into());
            }
        }
        if let EndpointKind::LocalDb(other) = &config.endpoint.kind {
            if Arc::ptr_eq(other, &config.db) {
                return Err(Error::LogicError(
                    "can not replicate database with itself".into(),
                ));
            }
        }
        let remote_key: Arc<str> = Arc::from(config.endpoint.remote_key());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                remote_key,
                status: Mutex::new(ReplicatorStatus {
                    activity: ReplicatorActivityLevel::Stopped,
                    progress: ReplicatorProgress::default(),
                    error: None,
                }),
                listeners: Mutex::new(Listeners::default()),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                reachable: AtomicBool::new(true),
                reset_checkpoint: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    #[inline]
    pub fn config(&self) -> &ReplicatorConfiguration {
        &self.shared.config
    }

    /// Start replication, no-op if it is already running. `reset_checkpoint`
    /// starts from the beginning, as if it never ran before.
    pub fn start(&self, reset_checkpoint: bool) -> Result<()> {
        let mut worker = lock(&self.worker);
        if self.shared.running.load(Ordering::Acquire) && !self.shared.stop_requested() {
            trace!("replicator already running");
            return Ok(());
        }
        // previous worker may still be publishing its final `Stopped`
        if let Some(prev) = worker.take() {
            if prev.thread().id() == thread::current().id() {
                // called from listener of previous run
                if self.shared.running.load(Ordering::Acquire) {
                    *worker = Some(prev);
                    return Err(CblErrorCode::Busy.into());
                }
            } else if prev.join().is_err() {
                error!("replicator worker panicked");
            }
        }
        self.shared.stop.store(false, Ordering::Release);
        self.shared.update_status(|status| {
            status.activity = ReplicatorActivityLevel::Connecting;
            status.progress = ReplicatorProgress::default();
            status.error = None;
            true
        });
        self.shared
            .reset_checkpoint
            .store(reset_checkpoint, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("cbl-repl-{}", self.shared.config.db.name))
            .spawn(move || worker_main(shared))
            .inspect_err(|_| self.shared.running.store(false, Ordering::Release))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Ask replicator to stop, `Stopped` activity is reported through
    /// change listener when it is done
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Suspended replicator goes `Offline` until resumed
    pub fn set_suspended(&self, suspended: bool) {
        self.shared.suspended.store(suspended, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Hint about network reachability of peer, unreachable peer is
    /// not contacted and replicator stays `Offline`
    pub fn set_host_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn status(&self) -> ReplicatorStatus {
        lock(&self.shared.status).clone()
    }

    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        let id = {
            let mut listeners = lock(&self.shared.listeners);
            listeners.next_id += 1;
            let id = listeners.next_id;
            listeners.status.insert(id, Arc::new(listener));
            id
        };
        let shared = Arc::downgrade(&self.shared);
        ListenerToken::new(move || {
            if let Some(shared) = Weak::upgrade(&shared) {
                lock(&shared.listeners).status.remove(&id);
            }
        })
    }

    pub fn add_document_replication_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(ReplicationDirection, &[ReplicatedDocument]) + Send + Sync + 'static,
    {
        let id = {
            let mut listeners = lock(&self.shared.listeners);
            listeners.next_id += 1;
            let id = listeners.next_id;
            listeners.documents.insert(id, Arc::new(listener));
            id
        };
        let shared = Arc::downgrade(&self.shared);
        ListenerToken::new(move || {
            if let Some(shared) = Weak::upgrade(&shared) {
                lock(&shared.listeners).documents.remove(&id);
            }
        })
    }

    /// IDs of documents in `collection` with local changes not yet pushed
    pub fn pending_document_ids(&self, collection: &CollectionSpec) -> Result<Vec<String>> {
        let (coll, snap) = self.pending_context(collection)?;
        let data = snap.collection(collection)?;
        Ok(data
            .docs
            .values()
            .filter(|rec| session::is_pending(&coll, &self.shared.remote_key, rec))
            .map(|rec| rec.id.clone())
            .collect())
    }

    pub fn is_document_pending(&self, doc_id: &str, collection: &CollectionSpec) -> Result<bool> {
        let (coll, snap) = self.pending_context(collection)?;
        Ok(snap
            .get_doc(collection, doc_id)?
            .map_or(false, |rec| session::is_pending(&coll, &self.shared.remote_key, &rec)))
    }

    fn pending_context(
        &self,
        collection: &CollectionSpec,
    ) -> Result<(ReplicationCollection, Arc<crate::store::Snapshot>)> {
        let config = &self.shared.config;
        if !config.replicator_type.push() {
            return Err(CblErrorCode::Unsupported.into());
        }
        let coll = config
            .collections()
            .into_iter()
            .find(|x| &x.spec == collection)
            .ok_or_else(|| Error::from(CblErrorCode::InvalidParameter))?;
        Ok((coll, config.db.current()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_parsing() {
        let url = EndpointUrl::parse("ws://192.168.1.132:4984/demo/").unwrap();
        assert_eq!(
            ("192.168.1.132", 4984, "demo", false),
            (url.host.as_str(), url.port, url.path.as_str(), url.tls)
        );
        let url = EndpointUrl::parse("wss://example.com/db").unwrap();
        assert_eq!((443, true), (url.port, url.tls));
        let url = EndpointUrl::parse("ws://[::1]:4984/db").unwrap();
        assert_eq!(("::1", 4984), (url.host.as_str(), url.port));
        for bad in [
            "http://example.com/db",
            "ws://example.com",
            "ws://example.com/",
            "ws://:4984/db",
            "ws://host:port/db",
        ] {
            let err = EndpointUrl::parse(bad).unwrap_err();
            assert_eq!(
                CblError::network(NetworkErrorCode::InvalidUrl),
                err.cbl_error(),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_retry_delay() {
        let max = Duration::from_secs(300);
        assert_eq!(Duration::from_secs(2), retry_delay(1, max));
        assert_eq!(Duration::from_secs(16), retry_delay(4, max));
        assert_eq!(max, retry_delay(9, max));
        assert_eq!(max, retry_delay(200, max));
    }

    #[test]
    fn test_default_max_attempts() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            "repl_cfg",
            Some(crate::DatabaseConfig::new(
                tmp_dir.path(),
                crate::DatabaseFlags::CREATE,
            )),
        )
        .unwrap();
        let endpoint = Endpoint::with_url("ws://localhost:4984/db").unwrap();
        let config = ReplicatorConfiguration::new(&db, endpoint);
        assert_eq!(10, config.effective_max_attempts());
        let config = config.with_continuous(true);
        assert_eq!(u32::MAX, config.effective_max_attempts());
        let config = config.with_max_attempts(1);
        assert_eq!(1, config.effective_max_attempts());
    }
}
