//! Content-addressed blob storage.
//!
//! A blob is identified by `sha256-<base64 digest>` of its content. Documents
//! reference blobs through a small JSON object:
//!
//! ```text
//! { "@type": "blob", "digest": "sha256-…", "length": 11, "content_type": "text/plain" }
//! ```
//!
//! On disk each blob is one file under `blobs/`, named by the hex form of the
//! digest so the base64 alphabet never reaches the file system.

use crate::error::{DbError, DbResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const DIGEST_PREFIX: &str = "sha256-";
const TYPE_KEY: &str = "@type";
const TYPE_BLOB: &str = "blob";
const DIGEST_KEY: &str = "digest";
const LENGTH_KEY: &str = "length";
const CONTENT_TYPE_KEY: &str = "content_type";

/// Binary content attached to documents or stored on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    content_type: Option<String>,
    digest: String,
    content: Vec<u8>,
}

impl Blob {
    /// Creates a blob, computing its digest.
    #[must_use]
    pub fn new(content_type: Option<&str>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            content_type: content_type.map(str::to_owned),
            digest: digest_of(&content),
            content,
        }
    }

    /// `sha256-` followed by the base64 SHA-256 of the content.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// MIME type given at creation, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Content length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.content.len() as u64
    }

    /// The content.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Reference object stored inside a document body.
    #[must_use]
    pub fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert(TYPE_KEY.into(), Value::from(TYPE_BLOB));
        props.insert(DIGEST_KEY.into(), Value::from(self.digest.clone()));
        props.insert(LENGTH_KEY.into(), Value::from(self.length()));
        if let Some(ct) = &self.content_type {
            props.insert(CONTENT_TYPE_KEY.into(), Value::from(ct.clone()));
        }
        props
    }

    /// Returns true if `props` looks like a blob reference.
    #[must_use]
    pub fn is_blob(props: &Map<String, Value>) -> bool {
        props.get(TYPE_KEY).and_then(Value::as_str) == Some(TYPE_BLOB)
            && props.get(DIGEST_KEY).is_some_and(Value::is_string)
    }

    /// Extracts the digest from a blob reference.
    pub(crate) fn digest_from_properties(props: &Map<String, Value>) -> DbResult<&str> {
        if props.get(TYPE_KEY).and_then(Value::as_str) != Some(TYPE_BLOB) {
            return Err(DbError::invalid_argument(
                "blob properties need \"@type\": \"blob\"",
            ));
        }
        props
            .get(DIGEST_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| DbError::invalid_argument("blob properties need a string \"digest\""))
    }

    pub(crate) fn from_stored(props: &Map<String, Value>, content: Vec<u8>) -> Self {
        Self {
            content_type: props
                .get(CONTENT_TYPE_KEY)
                .and_then(Value::as_str)
                .map(str::to_owned),
            digest: digest_of(&content),
            content,
        }
    }
}

fn digest_of(content: &[u8]) -> String {
    format!("{DIGEST_PREFIX}{}", STANDARD.encode(Sha256::digest(content)))
}

/// Hex file name for a digest, or `InvalidArgument` if it is not a SHA-256 digest.
fn file_name(digest: &str) -> DbResult<String> {
    let encoded = digest
        .strip_prefix(DIGEST_PREFIX)
        .ok_or_else(|| DbError::invalid_argument(format!("unsupported digest {digest:?}")))?;
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| DbError::invalid_argument(format!("malformed digest {digest:?}: {e}")))?;
    if raw.len() != 32 {
        return Err(DbError::invalid_argument(format!(
            "digest {digest:?} is not 32 bytes"
        )));
    }
    Ok(raw.iter().map(|b| format!("{b:02x}")).collect())
}

fn digest_from_file_name(name: &str) -> Option<String> {
    if name.len() != 64 {
        return None;
    }
    let raw = (0..32)
        .map(|i| u8::from_str_radix(name.get(i * 2..i * 2 + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    Some(format!("{DIGEST_PREFIX}{}", STANDARD.encode(raw)))
}

/// Collects every blob digest referenced anywhere inside `value`.
pub(crate) fn collect_digests(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            if Blob::is_blob(map) {
                if let Some(d) = map.get(DIGEST_KEY).and_then(Value::as_str) {
                    out.insert(d.to_owned());
                }
            }
            for v in map.values() {
                collect_digests(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_digests(v, out);
            }
        }
        _ => {}
    }
}

/// Where blob content lives.
#[derive(Debug)]
pub(crate) enum BlobStore {
    Memory(RwLock<HashMap<String, Vec<u8>>>),
    Directory(PathBuf),
}

impl BlobStore {
    pub(crate) fn in_memory() -> Self {
        Self::Memory(RwLock::new(HashMap::new()))
    }

    pub(crate) fn directory(path: PathBuf) -> DbResult<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self::Directory(path))
    }

    pub(crate) fn put(&self, blob: &Blob) -> DbResult<()> {
        match self {
            Self::Memory(map) => {
                map.write()
                    .entry(blob.digest.clone())
                    .or_insert_with(|| blob.content.clone());
            }
            Self::Directory(dir) => {
                let target = dir.join(file_name(&blob.digest)?);
                if target.exists() {
                    return Ok(());
                }
                let temp = target.with_extension("tmp");
                let mut file = fs::File::create(&temp)?;
                file.write_all(&blob.content)?;
                file.sync_all()?;
                drop(file);
                fs::rename(&temp, &target)?;
            }
        }
        Ok(())
    }

    /// Loads content for `digest`; `Ok(None)` if nothing is stored under it.
    pub(crate) fn get(&self, digest: &str) -> DbResult<Option<Vec<u8>>> {
        let content = match self {
            Self::Memory(map) => {
                file_name(digest)?;
                map.read().get(digest).cloned()
            }
            Self::Directory(dir) => match fs::read(dir.join(file_name(digest)?)) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
        };
        if let Some(bytes) = &content {
            if digest_of(bytes) != digest {
                return Err(DbError::corruption(format!(
                    "blob {digest} does not match its content"
                )));
            }
        }
        Ok(content)
    }

    pub(crate) fn digests(&self) -> DbResult<Vec<String>> {
        match self {
            Self::Memory(map) => Ok(map.read().keys().cloned().collect()),
            Self::Directory(dir) => {
                let mut out = Vec::new();
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if let Some(d) = entry.file_name().to_str().and_then(digest_from_file_name) {
                        out.push(d);
                    }
                }
                Ok(out)
            }
        }
    }

    pub(crate) fn remove(&self, digest: &str) -> DbResult<()> {
        match self {
            Self::Memory(map) => {
                map.write().remove(digest);
            }
            Self::Directory(dir) => match fs::remove_file(dir.join(file_name(digest)?)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_prefixed_base64_sha256() {
        let blob = Blob::new(Some("text/plain"), b"hello".to_vec());
        assert_eq!(
            blob.digest(),
            "sha256-LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ="
        );
        assert_eq!(blob.length(), 5);
    }

    #[test]
    fn properties_describe_blob() {
        let blob = Blob::new(Some("image/png"), vec![1, 2, 3]);
        let props = blob.properties();
        assert!(Blob::is_blob(&props));
        assert_eq!(props["length"], json!(3));
        assert_eq!(props["content_type"], json!("image/png"));
        assert_eq!(Blob::digest_from_properties(&props).unwrap(), blob.digest());
    }

    #[test]
    fn malformed_properties_are_rejected() {
        let no_type = json!({"digest": "sha256-x"});
        let no_digest = json!({"@type": "blob"});
        for props in [no_type, no_digest] {
            let map = props.as_object().unwrap();
            assert!(matches!(
                Blob::digest_from_properties(map),
                Err(DbError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn file_names_round_trip() {
        let blob = Blob::new(None, b"abc".to_vec());
        let name = file_name(blob.digest()).unwrap();
        assert_eq!(name.len(), 64);
        assert_eq!(digest_from_file_name(&name).unwrap(), blob.digest());
        assert!(file_name("md5-abc").is_err());
    }

    #[test]
    fn directory_store_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::directory(dir.path().join("blobs")).unwrap();
        let blob = Blob::new(None, b"payload".to_vec());

        store.put(&blob).unwrap();
        store.put(&blob).unwrap();
        assert_eq!(store.get(blob.digest()).unwrap().unwrap(), b"payload");
        assert_eq!(store.digests().unwrap(), vec![blob.digest().to_string()]);

        store.remove(blob.digest()).unwrap();
        assert!(store.get(blob.digest()).unwrap().is_none());
    }

    #[test]
    fn digests_are_found_in_nested_bodies() {
        let a = Blob::new(None, b"a".to_vec());
        let b = Blob::new(None, b"b".to_vec());
        let body = json!({
            "avatar": a.properties(),
            "gallery": [{"thumb": b.properties()}],
            "fake": {"digest": "sha256-zzz"}
        });
        let mut found = HashSet::new();
        collect_digests(&body, &mut found);
        assert_eq!(found.len(), 2);
        assert!(found.contains(a.digest()) && found.contains(b.digest()));
    }
}
