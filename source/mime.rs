//! MimePartWrapper (§4.7): a lazy `DataWrapper` bound to one `(uid, part-spec)`, fetched from the
//! connection on first access and cached from then on.
//!
//! Grounded on §4.7 and the `MimePart`/`Stream` collaborator interfaces in `crate::session`
//! (§6); there's no teacher equivalent (the notmuch-backed `camel-imap-folder.c`'s lazy body
//! parts are the closest analogue, re-expressed here against `crate::cache::MessageCache` instead
//! of a `CamelDataWrapper` hierarchy).

use crate::cache::MessageCache;
use crate::connection::Connection;
use crate::error::{ImapError, Result};
use crate::wire::Arg;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// Bound to `(folder, uid, part-spec)` until the first successful read, after which it behaves
/// like a plain in-memory body (§4.7 step 4: "drop the engine ref and UID and flip to
/// hydrated").
pub struct MimePartWrapper<RW> {
  folder: String,
  uid: String,
  part_spec: String,
  cache: Arc<MessageCache>,
  connection: Arc<Mutex<Connection<RW>>>,
  /// When set, a cache miss fails with "not currently available" rather than reaching for the
  /// network (§4.7 step 2: offline mode with cache-miss-returns-empty semantics accepted).
  offline_only: bool,
  hydrated: Option<Vec<u8>>,
}

impl<RW> MimePartWrapper<RW>
where
  RW: Read + Write,
{
  pub fn new(
    folder: &str,
    uid: &str,
    part_spec: &str,
    cache: Arc<MessageCache>,
    connection: Arc<Mutex<Connection<RW>>>,
  ) -> Self {
    Self {
      folder: folder.to_string(),
      uid: uid.to_string(),
      part_spec: part_spec.to_string(),
      cache,
      connection,
      offline_only: false,
      hydrated: None,
    }
  }

  pub fn set_offline_only(&mut self, offline_only: bool) {
    self.offline_only = offline_only;
  }

  pub fn is_hydrated(&self) -> bool {
    self.hydrated.is_some()
  }

  /// §4.7: look up the cache first; fetch and populate it on miss; flip to hydrated either way.
  pub fn bytes(&mut self) -> Result<Vec<u8>> {
    if let Some(bytes) = &self.hydrated {
      return Ok(bytes.clone());
    }
    if let Some(handle) = self.cache.get(&self.uid, &self.part_spec) {
      let mut buf = Vec::new();
      handle.reader().map_err(ImapError::Cache)?.read_to_end(&mut buf).map_err(ImapError::Cache)?;
      self.hydrated = Some(buf.clone());
      return Ok(buf);
    }
    if self.offline_only {
      return Err(ImapError::Logical(format!(
        "part {} of message {} is not currently available",
        self.part_spec, self.uid
      )));
    }
    let bytes = self.fetch()?;
    self.cache.insert(&self.uid, &self.part_spec, &bytes)?;
    self.hydrated = Some(bytes.clone());
    Ok(bytes)
  }

  fn fetch(&mut self) -> Result<Vec<u8>> {
    let mut connection = self.connection.lock().unwrap();
    let mut response = connection.send_command(
      Some(&self.folder),
      "UID FETCH %s BODY.PEEK[%s]",
      &[Arg::Str(&self.uid), Arg::Str(&self.part_spec)],
    )?;
    response.ok()?;
    let section = format!("BODY[{}]", self.part_spec);
    let line = response
      .untagged
      .iter()
      .find(|line| contains_section(line, &section))
      .ok_or_else(|| ImapError::Protocol(format!("no {section} in FETCH response")))?;
    crate::engine::extract_body_literal(line, &section)
  }

  pub fn write_to_stream(&mut self, w: &mut dyn Write) -> Result<()> {
    let bytes = self.bytes()?;
    w.write_all(&bytes).map_err(ImapError::Cache)
  }
}

fn contains_section(line: &[u8], section: &str) -> bool {
  memchr::memmem::find(line, section.as_bytes()).is_some()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::io::Cursor;

  struct Loopback {
    inbound: Cursor<Vec<u8>>,
    outbound: Vec<u8>,
  }

  impl Read for Loopback {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
      self.inbound.read(buf)
    }
  }

  impl Write for Loopback {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.outbound.extend_from_slice(buf);
      Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn cache_hit_avoids_network_and_hydrates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MessageCache::open(dir.path(), &HashSet::new()).unwrap());
    cache.insert("17", "1", b"hello part").unwrap();
    let connection = Arc::new(Mutex::new(Connection::new(Loopback {
      inbound: Cursor::new(Vec::new()),
      outbound: Vec::new(),
    })));
    let mut wrapper = MimePartWrapper::new("INBOX", "17", "1", cache, connection);
    assert_eq!(b"hello part".to_vec(), wrapper.bytes().unwrap());
    assert!(wrapper.is_hydrated());
  }

  #[test]
  fn offline_only_cache_miss_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MessageCache::open(dir.path(), &HashSet::new()).unwrap());
    let connection = Arc::new(Mutex::new(Connection::new(Loopback {
      inbound: Cursor::new(Vec::new()),
      outbound: Vec::new(),
    })));
    let mut wrapper = MimePartWrapper::new("INBOX", "17", "1", cache, connection);
    wrapper.set_offline_only(true);
    assert!(wrapper.bytes().is_err());
  }

  #[test]
  fn cache_miss_fetches_and_populates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(MessageCache::open(dir.path(), &HashSet::new()).unwrap());
    let connection = Arc::new(Mutex::new(Connection::new(Loopback {
      inbound: Cursor::new(b"* 1 FETCH (BODY[1] {5}\r\nhello)\r\nA00000 OK done\r\n".to_vec()),
      outbound: Vec::new(),
    })));
    let mut wrapper = MimePartWrapper::new("INBOX", "17", "1", cache.clone(), connection);
    assert_eq!(b"hello".to_vec(), wrapper.bytes().unwrap());
    assert!(cache.has("17", "1"));
  }
}
