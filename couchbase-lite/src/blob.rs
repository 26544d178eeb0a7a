//! Binary attachments.
//!
//! Blob content lives outside document body in `Attachments/` directory,
//! file name is hex of SHA-256 of content. Document refers to blob via dict
//! `{"@type": "blob", "digest": "sha256-<base64>", "length": n, "content_type": ..}`.

use crate::{
    error::{CblErrorCode, Error, Result},
    logging::{cbl_log, LogDomain},
    storage::Cipher,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_fleece::{Dict, MutableDict, Value, ValueType};
use sha2::{Digest, Sha256};
use std::{
    collections::HashSet,
    fmt, fs,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use uuid::Uuid;

pub(crate) const ATTACHMENTS_DIR: &str = "Attachments";
const BLOB_TYPE: &str = "blob";
const DIGEST_PREFIX: &str = "sha256-";
const BLOB_FILE_EXT: &str = "blob";
const TMP_FILE_EXT: &str = "tmp";

pub(crate) fn blob_digest(data: &[u8]) -> String {
    digest_to_string(&Sha256::digest(data))
}

fn digest_to_string(raw: &[u8]) -> String {
    format!("{}{}", DIGEST_PREFIX, BASE64.encode(raw))
}

/// Storage of blob files for one database
pub(crate) struct BlobStore {
    dir: PathBuf,
    cipher: RwLock<Option<Cipher>>,
}

impl BlobStore {
    pub(crate) fn open(dir: PathBuf, cipher: Option<Cipher>) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            cipher: RwLock::new(cipher),
        })
    }

    fn cipher(&self) -> Option<Cipher> {
        match self.cipher.read() {
            Ok(x) => x.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn file_path(&self, digest: &str) -> Result<PathBuf> {
        let raw = digest
            .strip_prefix(DIGEST_PREFIX)
            .and_then(|x| BASE64.decode(x).ok())
            .filter(|x| x.len() == 32)
            .ok_or_else(|| Error::LogicError(format!("invalid blob digest: {}", digest)))?;
        Ok(self
            .dir
            .join(hex::encode(raw))
            .with_extension(BLOB_FILE_EXT))
    }

    pub(crate) fn contains(&self, digest: &str) -> bool {
        self.file_path(digest).map(|p| p.exists()).unwrap_or(false)
    }

    /// Write content with known digest, existing file means content is already here
    pub(crate) fn install(&self, digest: &str, content: &[u8]) -> Result<()> {
        let path = self.file_path(digest)?;
        if path.exists() {
            return Ok(());
        }
        if blob_digest(content) != digest {
            return Err(Error::LogicError(format!(
                "blob content does not match digest {}",
                digest
            )));
        }
        let data = match self.cipher() {
            Some(cipher) => cipher.seal(content)?,
            None => content.to_vec(),
        };
        let tmp = self.tmp_path();
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub(crate) fn read(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.file_path(digest)?;
        let data = fs::read(&path)?;
        match self.cipher() {
            Some(cipher) => cipher.open(&data),
            None => Ok(data),
        }
    }

    fn open_stream(&self, digest: &str) -> Result<BlobReadStream> {
        if self.cipher().is_some() {
            return Ok(BlobReadStream::Memory(Cursor::new(self.read(digest)?)));
        }
        let file = fs::File::open(self.file_path(digest)?)?;
        Ok(BlobReadStream::File(file))
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir
            .join(Uuid::new_v4().simple().to_string())
            .with_extension(TMP_FILE_EXT)
    }

    fn blob_files(&self) -> Result<Vec<(PathBuf, Option<String>)>> {
        let mut ret = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let digest = path
                .file_stem()
                .and_then(|x| x.to_str())
                .and_then(|x| hex::decode(x).ok())
                .map(|raw| digest_to_string(&raw));
            ret.push((path, digest));
        }
        Ok(ret)
    }

    /// Remove blobs that nobody refers to, plus leftovers of interrupted writes
    pub(crate) fn delete_unreferenced(&self, used: &HashSet<String>) -> Result<usize> {
        let mut n = 0;
        for (path, digest) in self.blob_files()? {
            let keep = path.extension().map_or(false, |x| x == BLOB_FILE_EXT)
                && digest.map_or(false, |d| used.contains(&d));
            if !keep {
                fs::remove_file(&path)?;
                n += 1;
            }
        }
        Ok(n)
    }

    /// Check that every blob file has content matching its name
    pub(crate) fn verify(&self) -> Result<()> {
        for (path, digest) in self.blob_files()? {
            if path.extension().map_or(true, |x| x != BLOB_FILE_EXT) {
                continue;
            }
            let digest = digest.ok_or_else(|| Error::from(CblErrorCode::Corrupt))?;
            let content = self.read(&digest)?;
            if blob_digest(&content) != digest {
                cbl_log!(
                    LogDomain::Database,
                    Error,
                    "blob {} is corrupted",
                    path.display()
                );
                return Err(CblErrorCode::Corrupt.into());
            }
        }
        Ok(())
    }

    /// Encrypt all blob files with `new_cipher`
    pub(crate) fn rekey(&self, new_cipher: Option<Cipher>) -> Result<()> {
        for (path, digest) in self.blob_files()? {
            let Some(digest) = digest else { continue };
            let content = self.read(&digest)?;
            let data = match new_cipher.as_ref() {
                Some(cipher) => cipher.seal(&content)?,
                None => content,
            };
            let tmp = self.tmp_path();
            fs::write(&tmp, &data)?;
            fs::rename(&tmp, &path)?;
        }
        match self.cipher.write() {
            Ok(mut x) => *x = new_cipher,
            Err(poisoned) => *poisoned.into_inner() = new_cipher,
        }
        Ok(())
    }

    pub(crate) fn writer(self: &Arc<Self>) -> Result<BlobWriter> {
        let sink = if self.cipher().is_some() {
            WriterSink::Memory(Vec::new())
        } else {
            let path = self.tmp_path();
            WriterSink::File(fs::File::create(&path)?, path)
        };
        Ok(BlobWriter {
            store: self.clone(),
            sink,
            hasher: Sha256::new(),
            length: 0,
        })
    }
}

#[derive(Clone)]
enum BlobContent {
    Memory(Arc<[u8]>),
    Stored(Arc<BlobStore>),
    Unavailable,
}

/// Binary content, referenced from documents by digest
#[derive(Clone)]
pub struct Blob {
    content_type: Option<String>,
    digest: String,
    length: u64,
    content: BlobContent,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("content_type", &self.content_type)
            .field("digest", &self.digest)
            .field("length", &self.length)
            .finish()
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Blob {
    /// Blob with content in memory, it is written to database
    /// together with first document that refers to it
    pub fn new(content_type: Option<&str>, data: Vec<u8>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            digest: blob_digest(&data),
            length: data.len() as u64,
            content: BlobContent::Memory(data.into()),
        }
    }

    /// Finish streaming write, the content is put into database's blob store
    pub fn from_writer(content_type: Option<&str>, writer: BlobWriter) -> Result<Self> {
        let (digest, length, store) = writer.finish()?;
        Ok(Self {
            content_type: content_type.map(str::to_string),
            digest,
            length,
            content: BlobContent::Stored(store),
        })
    }

    /// Does dict look like blob's properties
    pub fn is_blob(dict: Dict<'_>) -> bool {
        dict.get("@type").and_then(|x| x.as_str()) == Some(BLOB_TYPE)
            && dict.get("digest").and_then(|x| x.as_str()).is_some()
    }

    pub(crate) fn from_properties(dict: Dict<'_>, store: &Arc<BlobStore>) -> Result<Self> {
        if !Self::is_blob(dict) {
            return Err(Error::LogicError(format!(
                "dict is not blob properties: {}",
                dict.to_json()
            )));
        }
        let digest = dict
            .get("digest")
            .and_then(|x| x.as_str())
            .unwrap_or_default()
            .to_string();
        let content = if store.contains(&digest) {
            BlobContent::Stored(store.clone())
        } else {
            BlobContent::Unavailable
        };
        Ok(Self {
            content_type: dict
                .get("content_type")
                .and_then(|x| x.as_str())
                .map(str::to_string),
            length: dict.get("length").map(|x| x.as_u64()).unwrap_or(0),
            digest,
            content,
        })
    }

    #[inline]
    pub fn digest(&self) -> &str {
        &self.digest
    }
    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }
    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Whole content of blob
    pub fn content(&self) -> Result<Vec<u8>> {
        match &self.content {
            BlobContent::Memory(data) => Ok(data.to_vec()),
            BlobContent::Stored(store) => store.read(&self.digest),
            BlobContent::Unavailable => Err(Error::not_found()),
        }
    }

    pub fn open_content_stream(&self) -> Result<BlobReadStream> {
        match &self.content {
            BlobContent::Memory(data) => Ok(BlobReadStream::Memory(Cursor::new(data.to_vec()))),
            BlobContent::Stored(store) => store.open_stream(&self.digest),
            BlobContent::Unavailable => Err(Error::not_found()),
        }
    }

    /// Dict that is stored inside document to refer to this blob
    pub fn properties(&self) -> Result<MutableDict> {
        self.properties_dict()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(self.properties_dict()?.to_json()?)
    }

    pub(crate) fn properties_dict(&self) -> Result<MutableDict> {
        let mut dict = MutableDict::new();
        dict.set_string("@type", BLOB_TYPE);
        dict.set_string("digest", &self.digest);
        dict.set_u64("length", self.length);
        if let Some(content_type) = self.content_type.as_deref() {
            dict.set_string("content_type", content_type);
        }
        Ok(dict)
    }

    /// Content that is not yet in blob store
    pub(crate) fn pending_content(&self) -> Option<&[u8]> {
        match &self.content {
            BlobContent::Memory(data) => Some(data),
            BlobContent::Stored(_) | BlobContent::Unavailable => None,
        }
    }
}

/// Digests of all blobs referenced from `value`
pub(crate) fn collect_blob_digests(value: Value<'_>, out: &mut HashSet<String>) {
    match value.value_type() {
        ValueType::Dict => {
            let Some(dict) = value.as_dict() else { return };
            if Blob::is_blob(dict) {
                if let Some(digest) = dict.get("digest").and_then(|x| x.as_str()) {
                    out.insert(digest.to_string());
                }
            } else {
                for (_, item) in dict.iter() {
                    collect_blob_digests(item, out);
                }
            }
        }
        ValueType::Array => {
            if let Some(arr) = value.as_array() {
                for item in arr.iter() {
                    collect_blob_digests(item, out);
                }
            }
        }
        _ => {}
    }
}

enum WriterSink {
    File(fs::File, PathBuf),
    Memory(Vec<u8>),
}

/// Streaming creation of blob, see `Blob::from_writer`
pub struct BlobWriter {
    store: Arc<BlobStore>,
    sink: WriterSink,
    hasher: Sha256,
    length: u64,
}

impl BlobWriter {
    fn finish(mut self) -> Result<(String, u64, Arc<BlobStore>)> {
        let digest = digest_to_string(&std::mem::take(&mut self.hasher).finalize());
        let path = self.store.file_path(&digest)?;
        match std::mem::replace(&mut self.sink, WriterSink::Memory(Vec::new())) {
            WriterSink::File(mut file, tmp_path) => {
                file.flush()?;
                file.sync_all()?;
                drop(file);
                if path.exists() {
                    fs::remove_file(&tmp_path)?;
                } else {
                    fs::rename(&tmp_path, &path)?;
                }
            }
            WriterSink::Memory(data) => self.store.install(&digest, &data)?,
        }
        Ok((digest, self.length, self.store.clone()))
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.sink {
            WriterSink::File(file, _) => file.write(buf)?,
            WriterSink::Memory(data) => {
                data.extend_from_slice(buf);
                buf.len()
            }
        };
        self.hasher.update(&buf[..n]);
        self.length += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            WriterSink::File(file, _) => file.flush(),
            WriterSink::Memory(_) => Ok(()),
        }
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if let WriterSink::File(_, path) = &self.sink {
            let _ = fs::remove_file(path);
        }
    }
}

/// Reader of blob content
pub enum BlobReadStream {
    File(fs::File),
    Memory(Cursor<Vec<u8>>),
}

impl Read for BlobReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlobReadStream::File(f) => f.read(buf),
            BlobReadStream::Memory(c) => c.read(buf),
        }
    }
}

impl Seek for BlobReadStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            BlobReadStream::File(f) => f.seek(pos),
            BlobReadStream::Memory(c) => c.seek(pos),
        }
    }
}

pub(crate) fn attachments_dir(db_path: &Path) -> PathBuf {
    db_path.join(ATTACHMENTS_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writer_and_stream() {
        let tmp_dir = tempdir().expect("Can not create tmp directory");
        let store = Arc::new(BlobStore::open(tmp_dir.path().join("a"), None).unwrap());
        let mut w = store.writer().unwrap();
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let blob = Blob::from_writer(Some("text/plain"), w).unwrap();
        assert_eq!(blob, Blob::new(None, b"hello world".to_vec()));
        assert_eq!(blob.length(), 11);
        assert!(blob.digest().starts_with("sha256-"));
        let mut s = blob.open_content_stream().unwrap();
        s.seek(SeekFrom::Start(6)).unwrap();
        let mut rest = String::new();
        s.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "world");

        let props = blob.properties().unwrap().encode().unwrap();
        let dict = props.root_dict().unwrap();
        assert!(Blob::is_blob(dict));
        let same = Blob::from_properties(dict, &store).unwrap();
        assert_eq!(same.content().unwrap(), b"hello world");
        assert_eq!(same.content_type(), Some("text/plain"));

        store.verify().unwrap();
        assert_eq!(store.delete_unreferenced(&HashSet::new()).unwrap(), 1);
        assert!(!store.contains(blob.digest()));
    }

    #[test]
    fn test_encrypted_blob_files() {
        let tmp_dir = tempdir().expect("Can not create tmp directory");
        let store = BlobStore::open(tmp_dir.path().into(), Some(Cipher::new(&[1; 32]))).unwrap();
        let blob = Blob::new(None, b"secret content".to_vec());
        store.install(blob.digest(), b"secret content").unwrap();
        let raw = fs::read(store.file_path(blob.digest()).unwrap()).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
        assert_eq!(store.read(blob.digest()).unwrap(), b"secret content");
        store.rekey(None).unwrap();
        let raw = fs::read(store.file_path(blob.digest()).unwrap()).unwrap();
        assert_eq!(raw, b"secret content");
    }
}
