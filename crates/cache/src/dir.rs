use std::fs;
use std::path::{Path, PathBuf};

use super::Cache;

/// Filesystem cache backend storing one file per key under a root directory.
///
/// Keys are encoded into filenames so arbitrary key text stays line-safe on
/// every platform; the directory is created lazily on first write. Failed
/// reads and writes degrade to misses and logged no-ops, which keeps the
/// cache contract infallible for callers.
#[derive(Debug, Clone)]
pub struct DirCache {
    root: PathBuf,
}

const ENTRY_SUFFIX: &str = ".kv";

impl DirCache {
    /// Creates a cache rooted at `root`. The directory is not touched until
    /// the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{ENTRY_SUFFIX}", encode_key(key)))
    }
}

impl Cache for DirCache {
    fn get(&self, key: &str) -> Option<String> {
        match fs::read_to_string(self.entry_path(key)) {
            Ok(raw) => Some(raw),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                tracing::warn!(key, error = %error, "cache read failed; treating as missing");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(error) = fs::create_dir_all(&self.root) {
            tracing::warn!(
                root = %self.root.display(),
                error = %error,
                "cache root unavailable; dropping write"
            );
            return;
        }

        if let Err(error) = fs::write(self.entry_path(key), value) {
            tracing::warn!(key, error = %error, "cache write failed; dropping write");
        }
    }

    fn remove(&self, key: &str) {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(key, error = %error, "cache remove failed");
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(encoded) = name.strip_suffix(ENTRY_SUFFIX) else {
                continue;
            };
            if let Some(key) = decode_key(encoded) {
                keys.push(key);
            }
        }
        keys
    }
}

/// Encodes a key into a filename-safe form. Alphanumerics, `-`, `_` and `.`
/// pass through; every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                encoded.push(byte as char);
            }
            other => {
                encoded.push('%');
                encoded.push_str(&format!("{other:02X}"));
            }
        }
    }
    encoded
}

fn decode_key(encoded: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut chars = encoded.bytes();

    while let Some(byte) = chars.next() {
        if byte != b'%' {
            bytes.push(byte);
            continue;
        }

        let high = chars.next()?;
        let low = chars.next()?;
        let hex = [high, low];
        let hex = std::str::from_utf8(&hex).ok()?;
        bytes.push(u8::from_str_radix(hex, 16).ok()?);
    }

    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, DirCache) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cache = DirCache::new(dir.path().join("cache"));
        (dir, cache)
    }

    #[test]
    fn set_get_remove_round_trip() {
        let (_dir, cache) = temp_cache();
        assert_eq!(cache.get("chatList"), None);

        cache.set("chatList", "[]");
        assert_eq!(cache.get("chatList"), Some("[]".to_string()));

        cache.remove("chatList");
        assert_eq!(cache.get("chatList"), None);
    }

    #[test]
    fn keys_survive_encoding_of_unusual_characters() {
        let (_dir, cache) = temp_cache();
        let key = "ms_6f9a/41 bd:చ";
        cache.set(key, "payload");

        assert_eq!(cache.get(key), Some("payload".to_string()));
        assert_eq!(cache.keys(), vec![key.to_string()]);
    }

    #[test]
    fn keys_lists_only_cache_entries() {
        let (_dir, cache) = temp_cache();
        cache.set("a", "1");
        cache.set("ms_b", "2");
        std::fs::write(cache.root().join("stray.txt"), "x").expect("write stray file");

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "ms_b".to_string()]);
    }

    #[test]
    fn encode_decode_round_trips() {
        for key in ["plain", "ms_0d3f-42", "with space", "per%cent", "näme"] {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
    }
}
