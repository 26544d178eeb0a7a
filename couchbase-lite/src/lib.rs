//! Embedded document database: JSON-like documents in fleece encoding,
//! grouped into scopes and collections, with N1QL and JSON queries,
//! full text search, blobs and replication with other devices.

mod blob;
mod collection;
mod conflict_resolver;
mod database;
mod doc_enumerator;
mod document;
mod encryptable;
mod error;
mod index;
pub mod logging;
mod observer;
mod query;
mod repl_transport;
mod replicator;
mod storage;
mod store;
mod transaction;
mod value;

pub use crate::{
    blob::{Blob, BlobReadStream, BlobWriter},
    collection::{
        Collection, CollectionSpec, ConcurrencyControl, DEFAULT_NAME as DEFAULT_COLLECTION_NAME,
    },
    conflict_resolver::{default_conflict_resolver, ConflictResolver},
    database::{
        Database, DatabaseConfig, DatabaseFlags, EncryptionAlgorithm, EncryptionKey,
        MaintenanceType, Scope, DB_EXTENSION,
    },
    doc_enumerator::{DocEnumerator, DocEnumeratorFlags, DocumentInfo},
    document::{Document, MutableDocument},
    encryptable::{
        EncryptedValue, Encryptable, PropertyCryptoContext, PropertyDecryptor, PropertyEncryptor,
    },
    error::{CblError, CblErrorCode, Error, ErrorDomain, NetworkErrorCode},
    index::{FullTextIndexConfiguration, IndexInfo, IndexOptions, IndexType, ValueIndexConfiguration},
    logging::{LogDomain, LogLevel},
    observer::{
        ChangeEvent, DbChange, DocumentChange, ListenerToken, ObserverdChangesIter, RevisionFlags,
    },
    query::{Enumerator, Query, QueryChange, QueryLanguage, ResultSet},
    replicator::{
        Authenticator, Endpoint, ProxySettings, ProxyType, ReplicatedDocument,
        ReplicatedDocumentFlags, ReplicationCollection, ReplicationDirection, ReplicationFilter,
        Replicator, ReplicatorActivityLevel, ReplicatorConfiguration, ReplicatorProgress,
        ReplicatorStatus, ReplicatorType,
    },
    transaction::Transaction,
    value::{FromValueRef, ValueRef},
};
#[cfg(feature = "use-tokio-websocket")]
pub use crate::replicator::{
    ConnectionStatus, ListenerPasswordAuthenticator, UrlEndpointListener,
    UrlEndpointListenerConfiguration,
};
pub use fallible_streaming_iterator;
pub use serde_fleece;

pub(crate) use crate::error::Result;

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Panic in user callback poisons mutex, but protected data stays consistent
#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|err| err.into_inner())
}

#[inline]
pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|err| err.into_inner())
}

#[inline]
pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|err| err.into_inner())
}
