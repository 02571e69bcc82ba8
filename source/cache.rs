//! MessageCache (§4.3): a disk-backed store mapping `(uid, part-spec)` to a byte stream.
//!
//! Grounded on `source/maildir.rs`'s `Builder`/commit-via-rename pattern (directory creation,
//! canonicalization, one file per entry) and `camel-imap-message-cache.c`'s part-spec addressing
//! and "fully cached" semantics. The teacher's weak-ref stream invalidation is re-expressed as a
//! stable handle table (DESIGN NOTES §9) instead of object weak references.

use crate::error::{ImapError, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// `""` (whole message) is stored under a marker that survives filesystems stripping trailing
/// dots, per §6.
const WHOLE_MESSAGE_MARKER: &str = ".~";

fn file_part_spec(part_spec: &str) -> &str {
  if part_spec.is_empty() {
    WHOLE_MESSAGE_MARKER
  } else {
    part_spec
  }
}

fn file_name(uid: &str, part_spec: &str) -> String {
  format!("{uid}.{}", file_part_spec(part_spec))
}

/// A cache entry handle. Dropping the last handle to a given `(uid, part-spec)` tombs it in the
/// cache's index (DESIGN NOTES §9's handle-table re-expression of the teacher's weak refs).
#[derive(Debug)]
pub struct Handle {
  path: PathBuf,
  live: Arc<()>,
}

impl Handle {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn reader(&self) -> Result<fs::File> {
    fs::File::open(&self.path).map_err(ImapError::Cache)
  }
}

#[derive(Debug, Default)]
struct Index {
  /// uid -> set of part-specs present on disk.
  by_uid: HashMap<String, HashSet<String>>,
  max_uid: u32,
  /// Weak liveness markers for outstanding handles, so `gc` can tell whether a tombed entry is
  /// still referenced.
  live: HashMap<(String, String), std::sync::Weak<()>>,
}

/// `§4.3`. All mutating operations hold `lock`; stream handles returned to callers outlive the
/// lock.
#[derive(Debug)]
pub struct MessageCache {
  directory: PathBuf,
  index: Mutex<Index>,
}

impl MessageCache {
  /// Scans `directory`, dropping any entry whose UID isn't in `known_uids` (§4.3).
  pub fn open(directory: &Path, known_uids: &HashSet<String>) -> Result<Self> {
    fs::create_dir_all(directory).map_err(ImapError::Cache)?;
    let directory = directory.canonicalize().map_err(ImapError::Cache)?;
    let mut index = Index::default();
    for entry in fs::read_dir(&directory).map_err(ImapError::Cache)? {
      let entry = entry.map_err(ImapError::Cache)?;
      let name = entry.file_name();
      let name = name.to_string_lossy();
      let Some((uid, part_spec)) = name.split_once('.') else {
        continue;
      };
      if !known_uids.contains(uid) {
        let _ = fs::remove_file(entry.path());
        continue;
      }
      let part_spec = if part_spec == WHOLE_MESSAGE_MARKER { "" } else { part_spec };
      index.by_uid.entry(uid.to_string()).or_default().insert(part_spec.to_string());
      if let Ok(n) = uid.parse::<u32>() {
        index.max_uid = index.max_uid.max(n);
      }
    }
    Ok(Self {
      directory,
      index: Mutex::new(index),
    })
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn get_filename(&self, uid: &str, part_spec: &str) -> PathBuf {
    self.directory.join(file_name(uid, part_spec))
  }

  fn track(&self, uid: &str, part_spec: &str) -> Handle {
    let mut index = self.index.lock().unwrap();
    index.by_uid.entry(uid.to_string()).or_default().insert(part_spec.to_string());
    if let Ok(n) = uid.parse::<u32>() {
      index.max_uid = index.max_uid.max(n);
    }
    let live = Arc::new(());
    index.live.insert((uid.to_string(), part_spec.to_string()), Arc::downgrade(&live));
    Handle {
      path: self.get_filename(uid, part_spec),
      live,
    }
  }

  /// Overwrites any existing entry for `(uid, part_spec)`, committing via a temp file so a crash
  /// mid-write never leaves a truncated entry visible (teacher's `Builder::tmp_named` pattern).
  pub fn insert(&self, uid: &str, part_spec: &str, bytes: &[u8]) -> Result<Handle> {
    let handle = self.track(uid, part_spec);
    let tmp = handle.path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(ImapError::Cache)?;
    file.write_all(bytes).map_err(ImapError::Cache)?;
    file.sync_all().map_err(ImapError::Cache)?;
    fs::rename(&tmp, &handle.path).map_err(ImapError::Cache)?;
    Ok(handle)
  }

  pub fn insert_stream<R: Read>(&self, uid: &str, part_spec: &str, mut src: R) -> Result<Handle> {
    let mut bytes = Vec::new();
    src.read_to_end(&mut bytes).map_err(ImapError::Cache)?;
    self.insert(uid, part_spec, &bytes)
  }

  pub fn get(&self, uid: &str, part_spec: &str) -> Option<Handle> {
    let index = self.index.lock().unwrap();
    if index.by_uid.get(uid).is_some_and(|parts| parts.contains(part_spec)) {
      drop(index);
      Some(self.track(uid, part_spec))
    } else {
      None
    }
  }

  pub fn has(&self, uid: &str, part_spec: &str) -> bool {
    self
      .index
      .lock()
      .unwrap()
      .by_uid
      .get(uid)
      .is_some_and(|parts| parts.contains(part_spec))
  }

  /// Removes every cached part for `uid`.
  pub fn remove(&self, uid: &str) -> Result<()> {
    let parts = {
      let mut index = self.index.lock().unwrap();
      index.by_uid.remove(uid).unwrap_or_default()
    };
    for part_spec in parts {
      let path = self.get_filename(uid, &part_spec);
      match fs::remove_file(path) {
        Ok(()) => (),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => (),
        Err(error) => return Err(ImapError::Cache(error)),
      }
    }
    Ok(())
  }

  /// Copies every existing part of `src_uid` in `self` into `dst_uid` in `dst`, preserving
  /// part-specs (§4.3, used by TRANSFER's COPY replay).
  pub fn copy(&self, src_uid: &str, dst: &MessageCache, dst_uid: &str) -> Result<()> {
    let parts = {
      let index = self.index.lock().unwrap();
      index.by_uid.get(src_uid).cloned().unwrap_or_default()
    };
    for part_spec in parts {
      let Some(handle) = self.get(src_uid, &part_spec) else {
        continue;
      };
      let bytes = fs::read(handle.path()).map_err(ImapError::Cache)?;
      dst.insert(dst_uid, &part_spec, &bytes)?;
    }
    Ok(())
  }

  pub fn clear(&self) -> Result<()> {
    let uids: Vec<String> = self.index.lock().unwrap().by_uid.keys().cloned().collect();
    for uid in uids {
      self.remove(&uid)?;
    }
    Ok(())
  }

  /// §4.3: a UID is "fully cached" iff a `""` entry exists; HEADER-only entries don't count.
  pub fn filter_cached<'a>(&self, uids: &'a [String]) -> Vec<&'a str> {
    let index = self.index.lock().unwrap();
    uids
      .iter()
      .map(String::as_str)
      .filter(|uid| !index.by_uid.get(*uid).is_some_and(|parts| parts.contains("")))
      .collect()
  }

  pub fn max_uid(&self) -> u32 {
    self.index.lock().unwrap().max_uid
  }

  /// Drops index bookkeeping for entries whose last outstanding handle was dropped. Callers may
  /// run this opportunistically; it never touches files still referenced by a live `Handle`.
  pub fn gc(&self) {
    let mut index = self.index.lock().unwrap();
    index.live.retain(|_, weak| weak.strong_count() > 0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn known(uids: &[&str]) -> HashSet<String> {
    uids.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn insert_and_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cache = MessageCache::open(dir.path(), &known(&[])).unwrap();
    cache.insert("17", "", b"hello").unwrap();
    let handle = cache.get("17", "").unwrap();
    let mut buf = Vec::new();
    handle.reader().unwrap().read_to_end(&mut buf).unwrap();
    assert_eq!(b"hello".to_vec(), buf);
  }

  #[test]
  fn open_prunes_unknown_uids() {
    let dir = tempfile::tempdir().unwrap();
    {
      let cache = MessageCache::open(dir.path(), &known(&[])).unwrap();
      cache.insert("17", "", b"a").unwrap();
      cache.insert("42", "HEADER", b"b").unwrap();
    }
    let cache = MessageCache::open(dir.path(), &known(&["17"])).unwrap();
    assert!(cache.has("17", ""));
    assert!(!cache.has("42", "HEADER"));
  }

  #[test]
  fn filter_cached_requires_whole_message_part() {
    let dir = tempfile::tempdir().unwrap();
    let cache = MessageCache::open(dir.path(), &known(&[])).unwrap();
    cache.insert("17", "HEADER", b"headers only").unwrap();
    cache.insert("42", "", b"whole message").unwrap();
    let uids = vec!["17".to_string(), "42".to_string()];
    assert_eq!(vec!["17"], cache.filter_cached(&uids));
  }

  #[test]
  fn copy_preserves_part_specs() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let src = MessageCache::open(src_dir.path(), &known(&[])).unwrap();
    let dst = MessageCache::open(dst_dir.path(), &known(&[])).unwrap();
    src.insert("17", "", b"whole").unwrap();
    src.insert("17", "1.MIME", b"mime").unwrap();
    src.copy("17", &dst, "83").unwrap();
    assert!(dst.has("83", ""));
    assert!(dst.has("83", "1.MIME"));
  }

  #[test]
  fn remove_deletes_all_parts_for_uid() {
    let dir = tempfile::tempdir().unwrap();
    let cache = MessageCache::open(dir.path(), &known(&[])).unwrap();
    cache.insert("17", "", b"a").unwrap();
    cache.insert("17", "HEADER", b"b").unwrap();
    cache.remove("17").unwrap();
    assert!(!cache.has("17", ""));
    assert!(!cache.has("17", "HEADER"));
  }

  #[test]
  fn max_uid_tracks_highest_inserted() {
    let dir = tempfile::tempdir().unwrap();
    let cache = MessageCache::open(dir.path(), &known(&[])).unwrap();
    cache.insert("17", "", b"a").unwrap();
    cache.insert("83", "", b"b").unwrap();
    assert_eq!(83, cache.max_uid());
  }
}
