//! On-disk commit log.
//!
//! A database directory holds `db.log`: an 8 byte magic, one byte with the
//! encryption algorithm, then a sequence of records, each one is
//! `u32 LE length + payload`. Payload is a fleece encoded `LogRecord`,
//! or `nonce + AES-256-GCM(record)` for encrypted databases.
//! The log is replayed on open, a torn record at the tail is cut off.

use crate::{
    error::{CblErrorCode, Error, Result},
    index::IndexSpec,
    logging::{cbl_log, LogDomain},
};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub(crate) const LOG_FILE_NAME: &str = "db.log";
const MAGIC: &[u8; 8] = b"CBLLOG\x00\x01";
const HEADER_LEN: usize = MAGIC.len() + 1;
const NONCE_LEN: usize = 12;
pub(crate) const FORMAT_VERSION: u32 = 1;

/// AES-256-GCM with a random nonce per sealed message
#[derive(Clone)]
pub(crate) struct Cipher(Aes256Gcm);

impl Cipher {
    pub(crate) fn new(key: &[u8; 32]) -> Self {
        Cipher(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
    }

    pub(crate) fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let sealed = self
            .0
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| Error::from(CblErrorCode::Crypto))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub(crate) fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(CblErrorCode::Crypto.into());
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.0
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CblErrorCode::Crypto.into())
    }
}

/// Binary blob inside a record, encoded as fleece data
#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct ByteBuf(pub Vec<u8>);

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteBuf({} bytes)", self.0.len())
    }
}

impl Serialize for ByteBuf {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for ByteBuf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct BytesVisitor;
        impl<'de> de::Visitor<'de> for BytesVisitor {
            type Value = ByteBuf;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("binary data")
            }
            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<ByteBuf, E> {
                Ok(ByteBuf(v.to_vec()))
            }
            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<ByteBuf, E> {
                Ok(ByteBuf(v))
            }
        }
        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HeaderRecord {
    pub version: u32,
    pub public_uuid: String,
    pub private_uuid: String,
}

/// Document revision as it is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredDoc {
    pub id: String,
    pub rev_id: String,
    pub sequence: u64,
    pub deleted: bool,
    pub body: ByteBuf,
    pub history: Vec<String>,
    pub expiration: Option<i64>,
    pub remote_revs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum LogOp {
    CreateCollection {
        scope: String,
        name: String,
    },
    DeleteCollection {
        scope: String,
        name: String,
    },
    PutDoc {
        scope: String,
        collection: String,
        doc: StoredDoc,
    },
    PurgeDoc {
        scope: String,
        collection: String,
        id: String,
    },
    PutIndex {
        scope: String,
        collection: String,
        spec: IndexSpec,
    },
    DeleteIndex {
        scope: String,
        collection: String,
        name: String,
    },
    PutLocal {
        key: String,
        value: Option<ByteBuf>,
    },
    SetExpiration {
        scope: String,
        collection: String,
        id: String,
        expiration: Option<i64>,
    },
    /// Remember revision the remote peer is known to have
    SetRemoteRev {
        scope: String,
        collection: String,
        id: String,
        remote: String,
        rev_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CommitRecord {
    pub last_sequence: u64,
    pub ops: Vec<LogOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum LogRecord {
    Header(HeaderRecord),
    Commit(CommitRecord),
}

pub(crate) struct CommitLog {
    file: File,
    path: PathBuf,
    cipher: Option<Cipher>,
    len: u64,
}

impl CommitLog {
    /// Write a fresh log with `records`, replacing whatever is at `path`
    pub(crate) fn create(path: &Path, cipher: Option<Cipher>, records: &[LogRecord]) -> Result<Self> {
        let tmp_path = path.with_extension("log.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut buf = Vec::with_capacity(4096);
            buf.extend_from_slice(MAGIC);
            buf.push(if cipher.is_some() { 1 } else { 0 });
            for rec in records {
                append_record(&mut buf, cipher.as_ref(), rec)?;
            }
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            path: path.into(),
            cipher,
            len,
        })
    }

    /// Open existing log and replay all records in it
    pub(crate) fn open(
        path: &Path,
        cipher: Option<Cipher>,
        writable: bool,
    ) -> Result<(Self, Vec<LogRecord>)> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.len() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
            return Err(CblErrorCode::NotADatabaseFile.into());
        }
        match (data[MAGIC.len()], cipher.is_some()) {
            (0, false) | (1, true) => {}
            (0 | 1, _) => return Err(CblErrorCode::NotADatabaseFile.into()),
            _ => return Err(CblErrorCode::UnsupportedEncryption.into()),
        }

        let mut records = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < data.len() {
            let Some(len_bytes) = data.get(pos..pos + 4) else {
                break;
            };
            let n = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                as usize;
            let end = pos + 4 + n;
            let Some(payload) = data.get(pos + 4..end) else {
                break;
            };
            let is_last = end == data.len();
            let plain = match cipher.as_ref() {
                Some(cipher) => match cipher.open(payload) {
                    Ok(plain) => plain,
                    Err(_) if records.is_empty() => {
                        return Err(CblErrorCode::NotADatabaseFile.into())
                    }
                    Err(_) if is_last => break,
                    Err(err) => return Err(err),
                },
                None => payload.to_vec(),
            };
            match serde_fleece::from_slice::<LogRecord>(&plain) {
                Ok(rec) => records.push(rec),
                Err(_) if is_last => break,
                Err(err) => {
                    cbl_log!(
                        LogDomain::Database,
                        Error,
                        "record at offset {} of {} is corrupted: {}",
                        pos,
                        path.display(),
                        err
                    );
                    return Err(CblErrorCode::Corrupt.into());
                }
            }
            pos = end;
        }
        if pos < data.len() {
            cbl_log!(
                LogDomain::Database,
                Warning,
                "{}: truncate torn tail, {} bytes",
                path.display(),
                data.len() - pos
            );
            if writable {
                file.set_len(pos as u64)?;
                file.sync_all()?;
            }
        }
        if !matches!(records.first(), Some(LogRecord::Header(_))) {
            return Err(CblErrorCode::NotADatabaseFile.into());
        }
        file.seek(SeekFrom::Start(pos as u64))?;
        Ok((
            Self {
                file,
                path: path.into(),
                cipher,
                len: pos as u64,
            },
            records,
        ))
    }

    /// Durably add one record to the end of the log
    pub(crate) fn append(&mut self, rec: &LogRecord) -> Result<()> {
        let mut buf = Vec::new();
        append_record(&mut buf, self.cipher.as_ref(), rec)?;
        if let Err(err) = self.file.write_all(&buf).and_then(|()| self.file.sync_data()) {
            // drop partial write, so next append starts at record boundary
            let _ = self.file.set_len(self.len);
            let _ = self.file.seek(SeekFrom::Start(self.len));
            return Err(err.into());
        }
        self.len += buf.len() as u64;
        Ok(())
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.len
    }
    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn append_record(out: &mut Vec<u8>, cipher: Option<&Cipher>, rec: &LogRecord) -> Result<()> {
    let encoded = serde_fleece::to_fl_slice_result(rec)?;
    let sealed;
    let payload: &[u8] = match cipher {
        Some(cipher) => {
            sealed = cipher.seal(encoded.as_bytes())?;
            &sealed
        }
        None => encoded.as_bytes(),
    };
    let n = u32::try_from(payload.len())
        .map_err(|_| Error::LogicError(format!("log record too big: {}", payload.len())))?;
    out.extend_from_slice(&n.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header() -> LogRecord {
        LogRecord::Header(HeaderRecord {
            version: FORMAT_VERSION,
            public_uuid: "pub".into(),
            private_uuid: "priv".into(),
        })
    }

    fn commit(seq: u64) -> LogRecord {
        LogRecord::Commit(CommitRecord {
            last_sequence: seq,
            ops: vec![LogOp::PutLocal {
                key: format!("k{}", seq),
                value: Some(ByteBuf(vec![1, 2, 3])),
            }],
        })
    }

    #[test]
    fn test_replay_and_torn_tail() {
        let tmp_dir = tempdir().expect("Can not create tmp directory");
        let path = tmp_dir.path().join(LOG_FILE_NAME);
        {
            let mut log = CommitLog::create(&path, None, &[header()]).unwrap();
            log.append(&commit(1)).unwrap();
            log.append(&commit(2)).unwrap();
        }
        let full_len = fs::metadata(&path).unwrap().len();
        {
            let f = OpenOptions::new().write(true).open(&path).unwrap();
            f.set_len(full_len - 3).unwrap();
        }
        let (log, records) = CommitLog::open(&path, None, true).unwrap();
        assert_eq!(records.len(), 2);
        match &records[1] {
            LogRecord::Commit(c) => {
                assert_eq!(c.last_sequence, 1);
                match &c.ops[0] {
                    LogOp::PutLocal { key, value } => {
                        assert_eq!(key, "k1");
                        assert_eq!(value.as_ref().map(|x| x.0.clone()), Some(vec![1, 2, 3]));
                    }
                    op => panic!("unexpected op {:?}", op),
                }
            }
            rec => panic!("unexpected record {:?}", rec),
        }
        assert!(log.len() < full_len);
        assert_eq!(fs::metadata(&path).unwrap().len(), log.len());
    }

    #[test]
    fn test_encrypted_log_needs_right_key() {
        let tmp_dir = tempdir().expect("Can not create tmp directory");
        let path = tmp_dir.path().join(LOG_FILE_NAME);
        let key = [7u8; 32];
        {
            let mut log = CommitLog::create(&path, Some(Cipher::new(&key)), &[header()]).unwrap();
            log.append(&commit(1)).unwrap();
        }
        let raw = fs::read(&path).unwrap();
        assert!(!raw.windows(4).any(|w| w == b"priv"));

        let (_, records) = CommitLog::open(&path, Some(Cipher::new(&key)), false).unwrap();
        assert_eq!(records.len(), 2);
        let err = CommitLog::open(&path, Some(Cipher::new(&[8u8; 32])), false)
            .err()
            .unwrap();
        assert!(err.is(CblErrorCode::NotADatabaseFile));
        let err = CommitLog::open(&path, None, false).err().unwrap();
        assert!(err.is(CblErrorCode::NotADatabaseFile));
    }
}
