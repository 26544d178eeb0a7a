use crate::{
    collection::CollectionSpec,
    error::Result,
    lock,
    logging::{cbl_log, LogDomain},
    Database,
};
use bitflags::bitflags;
use std::{
    any::Any,
    collections::{BTreeMap, VecDeque},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    thread,
};
use tokio::sync::Notify;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RevisionFlags: u8 {
        /// Is this revision a deletion/tombstone?
        const DELETED = 0x01;
        /// Does this revision's body contain attachments?
        const HAS_ATTACHMENTS = 0x04;
        /// Revision was received from peer during replication
        const EXTERNAL = 0x40;
    }
}

/// One changed document inside committed transaction
#[derive(Debug, Clone)]
pub(crate) struct ChangeEntry {
    pub collection: CollectionSpec,
    pub doc_id: String,
    pub rev_id: String,
    pub sequence: u64,
    pub body_size: u32,
    pub flags: RevisionFlags,
}

impl ChangeEntry {
    #[inline]
    pub(crate) fn external(&self) -> bool {
        self.flags.contains(RevisionFlags::EXTERNAL)
    }
}

/// Changes of one collection in one transaction
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    collection: CollectionSpec,
    doc_ids: Vec<String>,
}

impl ChangeEvent {
    #[inline]
    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }
    #[inline]
    pub fn doc_ids(&self) -> &[String] {
        &self.doc_ids
    }
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    collection: CollectionSpec,
    doc_id: String,
}

impl DocumentChange {
    #[inline]
    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }
    #[inline]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }
}

pub(crate) type CommitHook = Arc<dyn Fn(&[ChangeEntry]) + Send + Sync>;
pub(crate) type Job = Box<dyn FnOnce() + Send>;
pub(crate) type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Listener {
    Collection(CollectionSpec, Arc<dyn Fn(&ChangeEvent) + Send + Sync>),
    Document(
        CollectionSpec,
        String,
        Arc<dyn Fn(&DocumentChange) + Send + Sync>,
    ),
    Commit(CommitHook),
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    ready_callback: Option<ReadyCallback>,
    held: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
    queue: Mutex<Queue>,
    cv: Condvar,
    commit_waiters: Mutex<Vec<Weak<Notify>>>,
}

/// Delivers change notifications of one database on private thread
pub(crate) struct Notifier {
    shared: Arc<Shared>,
}

impl Drop for Notifier {
    fn drop(&mut self) {
        lock(&self.shared.queue).shutdown = true;
        self.shared.cv.notify_all();
    }
}

impl Notifier {
    pub(crate) fn start(db_name: &str) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();
        thread::Builder::new()
            .name(format!("cbl-notify-{}", db_name))
            .spawn(move || notifier_loop(thread_shared))?;
        Ok(Self { shared })
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> ListenerToken {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.listeners).insert(id, listener);
        let shared = Arc::downgrade(&self.shared);
        ListenerToken::new(move || {
            if let Some(shared) = shared.upgrade() {
                lock(&shared.listeners).remove(&id);
            }
        })
    }

    /// Wake `waiter` after every commit with local changes
    pub(crate) fn add_commit_waiter(&self, waiter: Weak<Notify>) {
        let mut waiters = lock(&self.shared.commit_waiters);
        waiters.retain(|x| x.strong_count() > 0);
        waiters.push(waiter);
    }

    /// Queue notifications about a commit. Called under the writer lock so
    /// jobs keep commit order; returned ready callback must be fired with
    /// [`Notifier::fire_ready`] after the lock is released.
    pub(crate) fn queue_commit(&self, changes: Vec<ChangeEntry>) -> Option<ReadyCallback> {
        if changes.is_empty() {
            return None;
        }
        if changes.iter().any(|x| !x.external()) {
            let waiters: Vec<Arc<Notify>> = lock(&self.shared.commit_waiters)
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for w in waiters {
                w.notify_one();
            }
        }
        if lock(&self.shared.listeners).is_empty() {
            return None;
        }
        let shared = Arc::downgrade(&self.shared);
        self.enqueue(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                dispatch(&shared, &changes);
            }
        }))
    }

    #[cfg(test)]
    pub(crate) fn post_commit(&self, changes: Vec<ChangeEntry>) {
        Self::fire_ready(self.queue_commit(changes));
    }

    pub(crate) fn post_job(&self, job: Job) {
        Self::fire_ready(self.enqueue(job));
    }

    fn enqueue(&self, job: Job) -> Option<ReadyCallback> {
        let mut queue = lock(&self.shared.queue);
        match queue.ready_callback.clone() {
            Some(cb) => {
                let was_empty = queue.held.is_empty();
                queue.held.push_back(job);
                if was_empty {
                    Some(cb)
                } else {
                    None
                }
            }
            None => {
                queue.jobs.push_back(job);
                self.shared.cv.notify_one();
                None
            }
        }
    }

    pub(crate) fn fire_ready(ready: Option<ReadyCallback>) {
        if let Some(cb) = ready {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                cbl_log!(
                    LogDomain::Database,
                    Error,
                    "notification ready callback panicked"
                );
            }
        }
    }

    pub(crate) fn buffer_notifications(&self, ready_callback: ReadyCallback) {
        lock(&self.shared.queue).ready_callback = Some(ready_callback);
    }

    /// Deliver buffered notifications on caller's thread
    pub(crate) fn send_notifications(&self) {
        let jobs: Vec<Job> = lock(&self.shared.queue).held.drain(..).collect();
        for job in jobs {
            job();
        }
    }
}

fn notifier_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = match shared.cv.wait(queue) {
                    Ok(x) => x,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };
        job();
    }
}

fn call_guarded<F: FnOnce()>(what: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        cbl_log!(LogDomain::Database, Error, "{} listener panicked", what);
    }
}

fn dispatch(shared: &Shared, changes: &[ChangeEntry]) {
    let listeners: Vec<Listener> = lock(&shared.listeners).values().cloned().collect();
    let mut by_collection = BTreeMap::<&CollectionSpec, Vec<String>>::new();
    for change in changes {
        by_collection
            .entry(&change.collection)
            .or_default()
            .push(change.doc_id.clone());
    }
    for listener in listeners {
        match listener {
            Listener::Collection(spec, f) => {
                if let Some(doc_ids) = by_collection.get(&spec) {
                    let event = ChangeEvent {
                        collection: spec.clone(),
                        doc_ids: doc_ids.clone(),
                    };
                    call_guarded("collection change", || f(&event));
                }
            }
            Listener::Document(spec, doc_id, f) => {
                if changes
                    .iter()
                    .any(|x| x.collection == spec && x.doc_id == doc_id)
                {
                    let change = DocumentChange {
                        collection: spec,
                        doc_id,
                    };
                    call_guarded("document change", || f(&change));
                }
            }
            Listener::Commit(f) => call_guarded("commit", || f(changes)),
        }
    }
}

/// Registration of listener, listener is removed with `remove` or on drop
pub struct ListenerToken {
    remover: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) state: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ListenerToken")
    }
}

impl ListenerToken {
    pub(crate) fn new<F: FnOnce() + Send + 'static>(remover: F) -> Self {
        Self {
            remover: Some(Box::new(remover)),
            state: None,
        }
    }
    pub(crate) fn with_state(mut self, state: Arc<dyn Any + Send + Sync>) -> Self {
        self.state = Some(state);
        self
    }
    #[inline]
    pub fn remove(self) {}
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

/// Change reported to observer registered with `Database::register_observer`
#[derive(Debug, Clone)]
pub struct DbChange {
    doc_id: String,
    revision_id: String,
    sequence: u64,
    body_size: u32,
    flags: RevisionFlags,
}

impl DbChange {
    /// was this change made by replicator
    #[inline]
    pub fn external(&self) -> bool {
        self.flags.contains(RevisionFlags::EXTERNAL)
    }
    #[inline]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }
    #[inline]
    pub fn revision_id(&self) -> &str {
        &self.revision_id
    }
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
    #[inline]
    pub fn body_size(&self) -> u32 {
        self.body_size
    }
    #[inline]
    pub fn revision_flags(&self) -> RevisionFlags {
        self.flags
    }
}

#[derive(Default)]
struct ObserverState {
    changes: VecDeque<DbChange>,
    notified: bool,
}

pub(crate) struct DatabaseObserver {
    state: Arc<Mutex<ObserverState>>,
    _token: ListenerToken,
}

impl DatabaseObserver {
    pub(crate) fn new<F>(db: &Database, callback_f: F) -> Result<DatabaseObserver>
    where
        F: FnMut() + Send + 'static,
    {
        let state = Arc::new(Mutex::new(ObserverState::default()));
        let callback_f = Mutex::new(callback_f);
        let hook_state = state.clone();
        let spec = CollectionSpec::default();
        let token = db.add_commit_hook(Arc::new(move |changes: &[ChangeEntry]| {
            let need_call = {
                let mut st = lock(&hook_state);
                let n = st.changes.len();
                st.changes.extend(changes.iter().filter(|x| x.collection == spec).map(|x| {
                    DbChange {
                        doc_id: x.doc_id.clone(),
                        revision_id: x.rev_id.clone(),
                        sequence: x.sequence,
                        body_size: x.body_size,
                        flags: x.flags,
                    }
                }));
                let need_call = st.changes.len() > n && !st.notified;
                if need_call {
                    st.notified = true;
                }
                need_call
            };
            if need_call {
                let mut f = lock(&callback_f);
                (*f)();
            }
        }))?;
        Ok(Self {
            state,
            _token: token,
        })
    }

    fn pop(&self) -> Option<DbChange> {
        let mut st = lock(&self.state);
        let ret = st.changes.pop_front();
        if ret.is_none() {
            st.notified = false;
        }
        ret
    }
}

pub struct ObserverdChangesIter<'db> {
    pub(crate) db: &'db Database,
    pub(crate) obs_idx: usize,
}

impl Iterator for ObserverdChangesIter<'_> {
    type Item = DbChange;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(obs) = self.db.db_observers.get(self.obs_idx) {
            if let Some(item) = obs.pop() {
                return Some(item);
            }
            self.obs_idx += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    fn change(doc_id: &str) -> ChangeEntry {
        ChangeEntry {
            collection: CollectionSpec::default(),
            doc_id: doc_id.into(),
            rev_id: "1-a".into(),
            sequence: 1,
            body_size: 0,
            flags: RevisionFlags::empty(),
        }
    }

    #[test]
    fn test_listener_removed_with_token() {
        let notifier = Notifier::start("test").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let token = notifier.add_listener(Listener::Collection(
            CollectionSpec::default(),
            Arc::new(move |ev: &ChangeEvent| {
                let _ = lock(&tx).send(ev.doc_ids().to_vec());
            }),
        ));
        notifier.post_commit(vec![change("a"), change("b")]);
        let ids = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        token.remove();
        notifier.post_commit(vec![change("c")]);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let notifier = Notifier::start("test").unwrap();
        let _bad = notifier.add_listener(Listener::Commit(Arc::new(|_: &[ChangeEntry]| {
            panic!("listener failure")
        })));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _good = notifier.add_listener(Listener::Document(
            CollectionSpec::default(),
            "x".into(),
            Arc::new(move |ch: &DocumentChange| {
                let _ = lock(&tx).send(ch.doc_id().to_string());
            }),
        ));
        notifier.post_commit(vec![change("y")]);
        notifier.post_commit(vec![change("x")]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "x");
    }

    #[test]
    fn test_buffered_notifications() {
        let notifier = Notifier::start("test").unwrap();
        let (ready_tx, ready_rx) = mpsc::channel();
        let ready_tx = Mutex::new(ready_tx);
        notifier.buffer_notifications(Arc::new(move || {
            let _ = lock(&ready_tx).send(());
        }));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _token = notifier.add_listener(Listener::Collection(
            CollectionSpec::default(),
            Arc::new(move |ev: &ChangeEvent| lock(&seen2).extend(ev.doc_ids().iter().cloned())),
        ));
        notifier.post_commit(vec![change("a")]);
        notifier.post_commit(vec![change("b")]);
        ready_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(ready_rx.try_recv().is_err());
        assert!(lock(&seen).is_empty());
        notifier.send_notifications();
        assert_eq!(*lock(&seen), vec!["a".to_string(), "b".to_string()]);
    }
}
