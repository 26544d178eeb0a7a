//! Property level encryption of replicated documents.
//!
//! Value wrapped into `{"@type": "encryptable", "value": v}` is stored in
//! plain form locally. Push replaces it with
//! `"encrypted$<key>": {"alg": .., "kid": .., "ciphertext": <base64>}`
//! produced by `PropertyEncryptor`, pull converts it back with `PropertyDecryptor`.

use crate::{
    collection::CollectionSpec,
    error::{CblErrorCode, Error, Result},
    logging::{cbl_log, LogDomain},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use serde_fleece::{CopyFlags, Dict, FlSliceResult, MutableDict, Value, ValueType};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

const TYPE_KEY: &str = "@type";
const ENCRYPTABLE_TYPE: &str = "encryptable";
const VALUE_KEY: &str = "value";
const ENCRYPTED_PREFIX: &str = "encrypted$";
const DEFAULT_ALGORITHM: &str = "CB_MOBILE_CUSTOM";

/// Value that should be encrypted when the document is pushed
#[derive(Debug, Clone, PartialEq)]
pub struct Encryptable {
    value: JsonValue,
}

impl Encryptable {
    pub fn new<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            value: serde_json::to_value(value)?,
        })
    }
    #[inline]
    pub fn value(&self) -> &JsonValue {
        &self.value
    }
    pub fn is_encryptable(dict: Dict<'_>) -> bool {
        dict.get(TYPE_KEY).and_then(|x| x.as_str()) == Some(ENCRYPTABLE_TYPE)
    }
    /// Read encryptable from its dictionary form
    pub fn from_dict(dict: Dict<'_>) -> Option<Self> {
        if !Self::is_encryptable(dict) {
            return None;
        }
        let value = dict.get(VALUE_KEY)?;
        serde_json::from_str(&value.to_json())
            .ok()
            .map(|value| Self { value })
    }
    /// Dictionary form to put into document
    pub fn properties(&self) -> Result<MutableDict> {
        let data = serde_fleece::to_fl_slice_result(&self.wrapped())?;
        MutableDict::from_shared(&data.shared_root(), CopyFlags::Deep)
            .ok_or_else(|| Error::LogicError("encryptable should be dictionary".into()))
    }
    fn wrapped(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert(TYPE_KEY.into(), ENCRYPTABLE_TYPE.into());
        map.insert(VALUE_KEY.into(), self.value.clone());
        JsonValue::Object(map)
    }
}

/// Where the encrypted property lives
#[derive(Debug)]
pub struct PropertyCryptoContext<'a> {
    pub collection: &'a CollectionSpec,
    pub doc_id: &'a str,
    /// Dot separated path of property inside document
    pub key_path: &'a str,
}

/// Result of property encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    pub ciphertext: Vec<u8>,
    /// `CB_MOBILE_CUSTOM` if not set
    pub algorithm: Option<String>,
    pub key_id: Option<String>,
}

/// Encrypt JSON of encryptable value
pub type PropertyEncryptor =
    Arc<dyn Fn(&PropertyCryptoContext<'_>, &[u8]) -> Result<EncryptedValue> + Send + Sync>;
/// Decrypt ciphertext back to JSON, arguments: ciphertext, algorithm, key id
pub type PropertyDecryptor = Arc<
    dyn Fn(&PropertyCryptoContext<'_>, &[u8], &str, Option<&str>) -> Result<Vec<u8>>
        + Send
        + Sync,
>;

fn has_encryptable(value: Value<'_>) -> bool {
    match value.value_type() {
        ValueType::Dict => value.as_dict().map_or(false, |dict| {
            Encryptable::is_encryptable(dict) || dict.iter().any(|(_, v)| has_encryptable(v))
        }),
        _ => false,
    }
}

fn has_encrypted(value: Value<'_>) -> bool {
    match value.value_type() {
        ValueType::Dict => value.as_dict().map_or(false, |dict| {
            dict.iter()
                .any(|(k, v)| k.starts_with(ENCRYPTED_PREFIX) || has_encrypted(v))
        }),
        _ => false,
    }
}

fn to_json_object(body: &FlSliceResult) -> Result<Map<String, JsonValue>> {
    match serde_json::from_str(&body.value().to_json())? {
        JsonValue::Object(map) => Ok(map),
        _ => Err(CblErrorCode::CorruptRevisionData.into()),
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.into()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn crypto_error(ctx: &PropertyCryptoContext<'_>, what: &str) -> Error {
    cbl_log!(
        LogDomain::Replicator,
        Warning,
        "{} of property {} in document {} failed",
        what,
        ctx.key_path,
        ctx.doc_id
    );
    CblErrorCode::Crypto.into()
}

/// Body with encryptables replaced by encrypted form, `None` if there is nothing
/// to encrypt
pub(crate) fn encrypt_body(
    collection: &CollectionSpec,
    doc_id: &str,
    body: &FlSliceResult,
    encryptor: Option<&PropertyEncryptor>,
) -> Result<Option<FlSliceResult>> {
    if !has_encryptable(body.value()) {
        return Ok(None);
    }
    let mut map = to_json_object(body)?;
    encrypt_map(collection, doc_id, "", &mut map, encryptor)?;
    Ok(Some(serde_fleece::to_fl_slice_result(&map)?))
}

fn encrypt_map(
    collection: &CollectionSpec,
    doc_id: &str,
    path: &str,
    map: &mut Map<String, JsonValue>,
    encryptor: Option<&PropertyEncryptor>,
) -> Result<()> {
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        let key_path = join_path(path, &key);
        let Some(JsonValue::Object(child)) = map.get_mut(&key) else {
            continue;
        };
        if child.get(TYPE_KEY).and_then(JsonValue::as_str) != Some(ENCRYPTABLE_TYPE) {
            encrypt_map(collection, doc_id, &key_path, child, encryptor)?;
            continue;
        }
        let ctx = PropertyCryptoContext {
            collection,
            doc_id,
            key_path: &key_path,
        };
        let encryptor = encryptor.ok_or_else(|| crypto_error(&ctx, "encryption (no encryptor)"))?;
        let plain = serde_json::to_vec(child.get(VALUE_KEY).unwrap_or(&JsonValue::Null))?;
        let encrypted = encryptor(&ctx, &plain)?;
        let mut out = Map::new();
        out.insert(
            "alg".into(),
            encrypted
                .algorithm
                .unwrap_or_else(|| DEFAULT_ALGORITHM.into())
                .into(),
        );
        if let Some(kid) = encrypted.key_id {
            out.insert("kid".into(), kid.into());
        }
        out.insert(
            "ciphertext".into(),
            BASE64.encode(encrypted.ciphertext).into(),
        );
        map.remove(&key);
        map.insert(format!("{}{}", ENCRYPTED_PREFIX, key), JsonValue::Object(out));
    }
    Ok(())
}

/// Body with encrypted properties turned back into encryptables, `None`
/// if there is nothing to decrypt
pub(crate) fn decrypt_body(
    collection: &CollectionSpec,
    doc_id: &str,
    body: &FlSliceResult,
    decryptor: Option<&PropertyDecryptor>,
) -> Result<Option<FlSliceResult>> {
    if !has_encrypted(body.value()) {
        return Ok(None);
    }
    let mut map = to_json_object(body)?;
    decrypt_map(collection, doc_id, "", &mut map, decryptor)?;
    Ok(Some(serde_fleece::to_fl_slice_result(&map)?))
}

fn decrypt_map(
    collection: &CollectionSpec,
    doc_id: &str,
    path: &str,
    map: &mut Map<String, JsonValue>,
    decryptor: Option<&PropertyDecryptor>,
) -> Result<()> {
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        let Some(plain_key) = key.strip_prefix(ENCRYPTED_PREFIX) else {
            if let Some(JsonValue::Object(child)) = map.get_mut(&key) {
                decrypt_map(collection, doc_id, &join_path(path, &key), child, decryptor)?;
            }
            continue;
        };
        let key_path = join_path(path, plain_key);
        let ctx = PropertyCryptoContext {
            collection,
            doc_id,
            key_path: &key_path,
        };
        let Some(JsonValue::Object(encrypted)) = map.get(&key) else {
            return Err(crypto_error(&ctx, "decryption (malformed)"));
        };
        let ciphertext = encrypted
            .get("ciphertext")
            .and_then(JsonValue::as_str)
            .and_then(|x| BASE64.decode(x).ok())
            .ok_or_else(|| crypto_error(&ctx, "decryption (no ciphertext)"))?;
        let alg = encrypted
            .get("alg")
            .and_then(JsonValue::as_str)
            .unwrap_or(DEFAULT_ALGORITHM);
        let kid = encrypted.get("kid").and_then(JsonValue::as_str);
        let decryptor = decryptor.ok_or_else(|| crypto_error(&ctx, "decryption (no decryptor)"))?;
        let plain = decryptor(&ctx, &ciphertext, alg, kid)?;
        let value: JsonValue =
            serde_json::from_slice(&plain).map_err(|_| crypto_error(&ctx, "decryption"))?;
        let plain_key = plain_key.to_string();
        map.remove(&key);
        map.insert(plain_key, Encryptable { value }.wrapped());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|x| x ^ 0x5a).collect()
    }

    fn body(value: &JsonValue) -> FlSliceResult {
        serde_fleece::to_fl_slice_result(value).unwrap()
    }

    #[test]
    fn test_encrypt_and_decrypt_nested_property() {
        let ssn = Encryptable::new(&"123-45-6789").unwrap();
        let doc = json!({
            "name": "bob",
            "private": {"ssn": ssn.wrapped()},
        });
        let spec = CollectionSpec::default();
        let encryptor: PropertyEncryptor = Arc::new(|ctx: &PropertyCryptoContext<'_>, plain: &[u8]| {
            assert_eq!("private.ssn", ctx.key_path);
            Ok(EncryptedValue {
                ciphertext: xor(plain),
                algorithm: None,
                key_id: Some("k1".into()),
            })
        });
        let encrypted = encrypt_body(&spec, "doc1", &body(&doc), Some(&encryptor))
            .unwrap()
            .unwrap();
        let json: JsonValue = serde_json::from_str(&encrypted.value().to_json()).unwrap();
        assert_eq!("bob", json["name"]);
        assert_eq!("CB_MOBILE_CUSTOM", json["private"]["encrypted$ssn"]["alg"]);
        assert_eq!("k1", json["private"]["encrypted$ssn"]["kid"]);
        assert!(json["private"].get("ssn").is_none());

        let decryptor: PropertyDecryptor = Arc::new(
            |_: &PropertyCryptoContext<'_>, data: &[u8], alg: &str, kid: Option<&str>| {
                assert_eq!(("CB_MOBILE_CUSTOM", Some("k1")), (alg, kid));
                Ok(xor(data))
            },
        );
        let decrypted = decrypt_body(&spec, "doc1", &encrypted, Some(&decryptor))
            .unwrap()
            .unwrap();
        let json: JsonValue = serde_json::from_str(&decrypted.value().to_json()).unwrap();
        assert_eq!(doc, json);
    }

    #[test]
    fn test_missing_encryptor_is_crypto_error() {
        let doc = json!({"secret": Encryptable::new(&42).unwrap().wrapped()});
        let err = encrypt_body(&CollectionSpec::default(), "doc1", &body(&doc), None).unwrap_err();
        assert!(err.is(CblErrorCode::Crypto));
        let plain = json!({"n": 1});
        assert!(encrypt_body(&CollectionSpec::default(), "doc1", &body(&plain), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_encryptable_properties() {
        let enc = Encryptable::new(&vec![1, 2]).unwrap();
        let props = enc.properties().unwrap();
        let data = props.encode().unwrap();
        let dict = data.root_dict().unwrap();
        assert!(Encryptable::is_encryptable(dict));
        assert_eq!(Some(enc), Encryptable::from_dict(dict));
    }
}
