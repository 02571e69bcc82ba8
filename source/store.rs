//! Store (§4.4, §4.5.1): owns the one `Connection`, the store-level folder listing, and the set
//! of open `FolderEngine`s. Translates between the logical (`/`-separated) folder names the rest
//! of the crate speaks and the server's own namespace-prefixed, namespace-delimited names (§3.1's
//! Namespace table / Folder-name table), and bridges cross-folder TRANSFER replay by resolving a
//! journal's `destination` string back to an already-open (or freshly opened) `FolderEngine`.
//!
//! Grounded on `kevinboulain-sin/source/lib.rs`'s `inner_run` (greeting → authenticate → per-account
//! setup, all ahead of the per-folder work) re-expressed per DESIGN NOTES §9: the teacher never
//! tracks more than the one notmuch-backed mailbox it was pointed at, so the folder registry,
//! namespace translation and the `ReplayTarget` adapter are new, built the way `engine.rs` and
//! `journal.rs` already shape the pieces they hand off to.

use crate::config::{Config, Exiting};
use crate::connection::{Capabilities, Connection};
use crate::engine::FolderEngine;
use crate::error::{ImapError, Result};
use crate::journal::ReplayTarget;
use crate::session::SearchEngine;
use crate::uid::{Remap, Uid};
use crate::wire::{self, Arg};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// The server's personal namespace prefix and hierarchy delimiter (RFC 2342), used to translate
/// between logical folder paths (always `/`-separated) and the names the server expects on the
/// wire. Only the personal namespace is tracked: other-users/shared namespaces are out of scope
/// for a single-account client (§3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
  pub prefix: String,
  pub delimiter: Option<char>,
}

impl Default for Namespace {
  fn default() -> Self {
    Self {
      prefix: String::new(),
      delimiter: Some('/'),
    }
  }
}

/// One entry from a LIST/LSUB sweep (§4.4 folder discovery), translated to a logical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderListing {
  pub name: String,
  pub noselect: bool,
  pub has_children: bool,
  pub subscribed: bool,
}

/// `Store<RW>` (§2): one `Connection`, shared by every open `FolderEngine` under a single
/// recursive command lock; the store-level folder listing; and the registry of engines currently
/// open, keyed by logical folder name.
pub struct Store<RW> {
  connection: Arc<Mutex<Connection<RW>>>,
  state_root: PathBuf,
  config: Config,
  exiting: Exiting,
  namespace: Namespace,
  folders: HashMap<String, FolderEngine<RW>>,
  search_factory: Arc<dyn Fn() -> Box<dyn SearchEngine + Send> + Send + Sync>,
}

impl<RW> Store<RW>
where
  RW: Read + Write,
{
  /// Takes an already-greeted (and, if applicable, already-STARTTLS-upgraded) `Connection` and
  /// completes authentication and namespace discovery (§4.4). Transport setup (TCP/TLS dial,
  /// greeting, STARTTLS) is the caller's job, same division as the teacher's `TCP`/`TLS`/
  /// `inner_run` split in `lib.rs`.
  pub fn connect(
    mut connection: Connection<RW>,
    user: &str,
    pass: &str,
    state_root: PathBuf,
    config: Config,
    exiting: Exiting,
    search_factory: Arc<dyn Fn() -> Box<dyn SearchEngine + Send> + Send + Sync>,
  ) -> Result<Self> {
    connection.refresh_capabilities()?;
    if !connection.is_preauthed() {
      connection.authenticate(user, pass)?;
      connection.refresh_capabilities()?;
    }
    let namespace = if connection.capabilities().contains(Capabilities::NAMESPACE) {
      fetch_namespace(&mut connection)?
    } else {
      Namespace::default()
    };
    std::fs::create_dir_all(&state_root).map_err(ImapError::Cache)?;
    Ok(Self {
      connection: Arc::new(Mutex::new(connection)),
      state_root,
      config,
      exiting,
      namespace,
      folders: HashMap::new(),
      search_factory,
    })
  }

  pub fn namespace(&self) -> &Namespace {
    &self.namespace
  }

  /// Translates a logical, `/`-separated folder path to the server's own name (§3.1 Folder-name
  /// table). `INBOX` is never prefixed or delimiter-translated: every server treats it as a fixed
  /// case-insensitive special name regardless of namespace.
  pub fn to_server_name(&self, logical: &str) -> String {
    if logical.eq_ignore_ascii_case("INBOX") {
      return "INBOX".to_string();
    }
    let delimiter = self.namespace.delimiter.unwrap_or('/');
    let translated = if delimiter == '/' {
      logical.to_string()
    } else {
      logical.chars().map(|c| if c == '/' { delimiter } else { c }).collect()
    };
    format!("{}{}", self.namespace.prefix, translated)
  }

  /// The inverse of [`Self::to_server_name`].
  pub fn to_logical_name(&self, server_name: &str) -> String {
    if server_name.eq_ignore_ascii_case("INBOX") {
      return "INBOX".to_string();
    }
    let stripped = server_name.strip_prefix(self.namespace.prefix.as_str()).unwrap_or(server_name);
    let delimiter = self.namespace.delimiter.unwrap_or('/');
    if delimiter == '/' {
      stripped.to_string()
    } else {
      stripped.chars().map(|c| if c == delimiter { '/' } else { c }).collect()
    }
  }

  fn state_dir_for(&self, logical: &str) -> PathBuf {
    let mut dir = self.state_root.clone();
    for component in logical.split('/') {
      if component.is_empty() || component == "." || component == ".." {
        continue;
      }
      dir.push(component);
    }
    dir
  }

  /// LIST the whole hierarchy under the personal namespace, cross-referencing LSUB for
  /// subscription state (§4.4). Returns logical names.
  pub fn list_folders(&mut self) -> Result<Vec<FolderListing>> {
    let mut connection = self.connection.lock().unwrap();
    let mut list_response = connection.send_command(None, "LIST %S %S", &[Arg::String(""), Arg::String("*")])?;
    list_response.ok()?;
    let mut subscribed = std::collections::HashSet::new();
    let mut lsub_response = connection.send_command(None, "LSUB %S %S", &[Arg::String(""), Arg::String("*")])?;
    lsub_response.ok()?;
    for line in &lsub_response.untagged {
      if let Some(entry) = parse_list_line(line, "LSUB")? {
        subscribed.insert(entry.name);
      }
    }
    let mut out = Vec::new();
    for line in &list_response.untagged {
      if let Some(mut entry) = parse_list_line(line, "LIST")? {
        entry.subscribed = subscribed.contains(&entry.name);
        entry.name = self.to_logical_name(&entry.name);
        out.push(entry);
      }
    }
    Ok(out)
  }

  pub fn create_folder(&mut self, logical: &str) -> Result<()> {
    let server_name = self.to_server_name(logical);
    let mut connection = self.connection.lock().unwrap();
    connection.send_command(None, "CREATE %F", &[Arg::Folder(&server_name)])?.ok()
  }

  pub fn delete_folder(&mut self, logical: &str) -> Result<()> {
    self.folders.remove(logical);
    let server_name = self.to_server_name(logical);
    let mut connection = self.connection.lock().unwrap();
    connection.send_command(None, "DELETE %F", &[Arg::Folder(&server_name)])?.ok()
  }

  pub fn rename_folder(&mut self, old_logical: &str, new_logical: &str) -> Result<()> {
    self.folders.remove(old_logical);
    let old_name = self.to_server_name(old_logical);
    let new_name = self.to_server_name(new_logical);
    let mut connection = self.connection.lock().unwrap();
    connection
      .send_command(None, "RENAME %F %F", &[Arg::Folder(&old_name), Arg::Folder(&new_name)])?
      .ok()
  }

  pub fn subscribe_folder(&mut self, logical: &str) -> Result<()> {
    let server_name = self.to_server_name(logical);
    let mut connection = self.connection.lock().unwrap();
    connection.send_command(None, "SUBSCRIBE %F", &[Arg::Folder(&server_name)])?.ok()
  }

  pub fn unsubscribe_folder(&mut self, logical: &str) -> Result<()> {
    let server_name = self.to_server_name(logical);
    let mut connection = self.connection.lock().unwrap();
    connection.send_command(None, "UNSUBSCRIBE %F", &[Arg::Folder(&server_name)])?.ok()
  }

  /// Opens `logical` if it isn't already, and returns a handle to its `FolderEngine` (§4.5.1).
  pub fn open_folder(&mut self, logical: &str) -> Result<&mut FolderEngine<RW>> {
    self.ensure_open(logical)?;
    Ok(self.folders.get_mut(logical).expect("just opened"))
  }

  fn ensure_open(&mut self, logical: &str) -> Result<()> {
    if self.folders.contains_key(logical) {
      return Ok(());
    }
    let server_name = self.to_server_name(logical);
    let state_dir = self.state_dir_for(logical);
    let search = (self.search_factory)();
    let engine = FolderEngine::open(
      self.connection.clone(),
      &server_name,
      &state_dir,
      self.config.clone(),
      self.exiting.clone(),
      search,
    )?;
    self.folders.insert(logical.to_string(), engine);
    Ok(())
  }

  /// §6 Store-level interface `noop`: a bare keepalive, also the usual way a server delivers
  /// unsolicited EXISTS/EXPUNGE/FETCH updates for the currently selected folder outside of a
  /// command response.
  pub fn noop(&mut self) -> Result<()> {
    self.connection.lock().unwrap().send_command(None, "NOOP", &[])?.ok()
  }

  pub fn is_open(&self, logical: &str) -> bool {
    self.folders.contains_key(logical)
  }

  pub fn close_folder(&mut self, logical: &str) {
    self.folders.remove(logical);
  }

  pub fn open_folders(&self) -> impl Iterator<Item = &str> {
    self.folders.keys().map(String::as_str)
  }

  /// Replays `logical`'s journal against the server, resolving TRANSFER destinations through this
  /// `Store`'s own registry (§4.6). A no-op if the folder isn't open or its journal is empty.
  pub fn replay_folder(&mut self, logical: &str) -> Result<()> {
    let Some(mut engine) = self.folders.remove(logical) else {
      return Ok(());
    };
    if engine.journal().is_empty() {
      self.folders.insert(logical.to_string(), engine);
      return Ok(());
    }
    let mut journal = std::mem::replace(engine.journal_mut(), crate::journal::Journal::placeholder());
    let mut adapter = ReplayAdapter {
      store: self,
      engine: &mut engine,
    };
    let result = journal.replay(&mut adapter);
    *engine.journal_mut() = journal;
    self.folders.insert(logical.to_string(), engine);
    result
  }

  /// Replays every currently open folder with a pending journal (§4.6, invoked on reconnect).
  pub fn replay_all(&mut self) -> Result<()> {
    let pending: Vec<String> = self
      .folders
      .iter()
      .filter(|(_, engine)| !engine.journal().is_empty())
      .map(|(name, _)| name.clone())
      .collect();
    for logical in pending {
      self.replay_folder(&logical)?;
    }
    Ok(())
  }

  /// Moves or copies `uids` from the already-open `src` folder to the already-open `dst` folder
  /// (§6 Store-level interface: `transfer(src-uids, dst, delete-originals?)`). Both folders must
  /// already be open; `open_folder` each one first.
  pub fn transfer(&mut self, src: &str, dst: &str, uids: &[Uid], delete_originals: bool) -> Result<()> {
    self.with_two_engines_mut(src, dst, |src_engine, dst_engine| src_engine.transfer(dst_engine, uids, delete_originals))
  }

  fn with_two_engines_mut<F>(&mut self, a: &str, b: &str, f: F) -> Result<()>
  where
    F: FnOnce(&mut FolderEngine<RW>, &mut FolderEngine<RW>) -> Result<()>,
  {
    let mut engine_a = self.folders.remove(a).ok_or_else(|| ImapError::Logical(format!("folder {a} is not open")))?;
    let mut engine_b = self.folders.remove(b).ok_or_else(|| ImapError::Logical(format!("folder {b} is not open")));
    let result = match &mut engine_b {
      Ok(engine_b) => f(&mut engine_a, engine_b),
      Err(_) => Err(ImapError::Logical(format!("folder {b} is not open"))),
    };
    self.folders.insert(a.to_string(), engine_a);
    if let Ok(engine_b) = engine_b {
      self.folders.insert(b.to_string(), engine_b);
    }
    result
  }
}

/// Bridges `Journal::replay`'s generic `ReplayTarget` to a specific, already-removed-from-the-map
/// source engine plus the rest of the `Store` (needed to resolve TRANSFER destinations). Exists
/// only for the duration of one `replay_folder` call (DESIGN NOTES §9).
struct ReplayAdapter<'a, RW> {
  store: &'a mut Store<RW>,
  engine: &'a mut FolderEngine<RW>,
}

impl<'a, RW> ReplayTarget for ReplayAdapter<'a, RW>
where
  RW: Read + Write,
{
  fn append_resyncing(&mut self, temp_uid: &Uid) -> Result<u32> {
    self.engine.append_resyncing(temp_uid)
  }

  fn expunge_uids_resyncing(&mut self, uids: &[Uid]) -> Result<()> {
    self.engine.expunge_uids_resyncing(uids)
  }

  fn transfer_resyncing(&mut self, destination: &str, uids: &[Uid], delete_originals: bool, remap: &Remap) -> Result<()> {
    let destination_logical = self.store.to_logical_name(destination);
    self.store.ensure_open(&destination_logical)?;
    let source_name = self.engine.folder().to_string();
    let _ = source_name;
    let mut destination_engine =
      self.store.folders.remove(&destination_logical).expect("ensure_open just inserted it");
    let result = self.engine.transfer_resyncing(&mut destination_engine, uids, delete_originals, remap);
    self.store.folders.insert(destination_logical, destination_engine);
    result
  }

  /// Nothing to flush here: every `FolderEngine` operation persists its own summary/cache/journal
  /// state as it goes (§4.5, §4.6); there's no separate "close" step to batch.
  fn close_folders(&mut self) {}
}

fn fetch_namespace<RW: Read + Write>(connection: &mut Connection<RW>) -> Result<Namespace> {
  let mut response = connection.send_command(None, "NAMESPACE", &[])?;
  response.ok()?;
  let line = response
    .extract("NAMESPACE")
    .ok_or_else(|| ImapError::Protocol("no NAMESPACE response".to_string()))?;
  parse_namespace_line(&line)
}

/// Parses `* NAMESPACE (("" "/")) NIL NIL`-shaped responses, keeping only the first personal
/// namespace pair (§3.1). A server with no personal namespace (vanishingly rare, but legal) falls
/// back to an empty prefix with no delimiter, i.e. "no translation".
fn parse_namespace_line(line: &[u8]) -> Result<Namespace> {
  let rest = memchr::memmem::find(line, b"NAMESPACE")
    .map(|i| &line[i + "NAMESPACE".len()..])
    .unwrap_or(line);
  let (sexp, _) = wire::parse_sexp(rest, 0)?;
  let personal = match &sexp {
    wire::Sexp::Nil => return Ok(Namespace::default()),
    wire::Sexp::List(outer) => outer.first(),
    _ => None,
  };
  let Some(first_pair) = personal.and_then(|s| s.as_list()).and_then(|l| l.first()) else {
    return Ok(Namespace::default());
  };
  let pair = first_pair
    .as_list()
    .ok_or_else(|| ImapError::Protocol("malformed NAMESPACE pair".to_string()))?;
  let prefix = pair
    .first()
    .and_then(|s| s.as_string())
    .map(|s| s.into_owned())
    .unwrap_or_default();
  let delimiter = pair.get(1).and_then(|s| s.as_string()).and_then(|s| s.chars().next());
  Ok(Namespace { prefix, delimiter })
}

/// Parses one `* LIST (attrs) "delim" "name"` / `* LSUB ...` untagged line (§4.4).
fn parse_list_line(line: &[u8], keyword: &str) -> Result<Option<FolderListing>> {
  let upper = line.to_ascii_uppercase();
  if !upper.starts_with(keyword.as_bytes()) {
    return Ok(None);
  }
  let rest = &line[keyword.len()..];
  let (attrs, i) = wire::parse_sexp(rest, 0)?;
  let (_delimiter, i) = wire::parse_sexp(rest, i)?;
  let (name, _) = wire::parse_sexp(rest, i)?;
  let attr_list = attrs.as_list().unwrap_or(&[]);
  let noselect = attr_list.iter().any(|a| a.as_string().is_some_and(|s| s.eq_ignore_ascii_case("\\Noselect")));
  let has_children = attr_list.iter().any(|a| a.as_string().is_some_and(|s| s.eq_ignore_ascii_case("\\HasChildren")));
  let raw_name = name
    .as_string()
    .ok_or_else(|| ImapError::Protocol(format!("malformed {keyword} line")))?;
  let decoded = wire::utf7_to_utf8(raw_name.as_bytes()).unwrap_or_else(|| raw_name.into_owned());
  Ok(Some(FolderListing {
    name: decoded,
    noselect,
    has_children,
    subscribed: false,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
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

  fn connection(server_says: &[u8]) -> Connection<Loopback> {
    Connection::new(Loopback {
      inbound: Cursor::new(server_says.to_vec()),
      outbound: Vec::new(),
    })
  }

  /// Builds a `Store` directly (bypassing `connect`'s greeting/auth handshake) so individual
  /// operations can be tested against a short, focused server script.
  fn store(dir: &Path, namespace: Namespace, server_says: &[u8]) -> Store<Loopback> {
    Store {
      connection: Arc::new(Mutex::new(connection(server_says))),
      state_root: dir.to_path_buf(),
      config: Config::default(),
      exiting: Exiting::new(),
      namespace,
      folders: HashMap::new(),
      search_factory: Arc::new(|| Box::new(crate::session::NullSearchEngine)),
    }
  }

  #[test]
  fn connect_authenticates_and_discovers_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let server_says = concat!(
      "* CAPABILITY IMAP4rev1 NAMESPACE AUTH=PLAIN\r\n",
      "A00000 OK CAPABILITY completed\r\n",
      "+ \r\n",
      "A00001 OK authenticated\r\n",
      "* CAPABILITY IMAP4rev1 NAMESPACE AUTH=PLAIN\r\n",
      "A00002 OK CAPABILITY completed\r\n",
      "* NAMESPACE ((\"\" \"/\")) NIL NIL\r\n",
      "A00003 OK done\r\n",
    );
    let store = Store::connect(
      connection(server_says.as_bytes()),
      "user",
      "pass",
      dir.path().to_path_buf(),
      Config::default(),
      Exiting::new(),
      Arc::new(|| Box::new(crate::session::NullSearchEngine)),
    )
    .unwrap();
    assert_eq!(Namespace { prefix: String::new(), delimiter: Some('/') }, store.namespace);
  }

  #[test]
  fn folder_name_translation_round_trips_through_a_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path(), Namespace { prefix: "INBOX.".to_string(), delimiter: Some('.') }, b"");
    let server_name = store.to_server_name("Archive/2024");
    assert_eq!("INBOX.Archive.2024", server_name);
    assert_eq!("Archive/2024", store.to_logical_name(&server_name));
    assert_eq!("INBOX", store.to_server_name("inbox"));
  }

  #[test]
  fn list_folders_parses_attrs_delimiter_and_decodes_utf7_names() {
    let dir = tempfile::tempdir().unwrap();
    let server_says = concat!(
      "* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n",
      "* LIST (\\HasChildren) \"/\" \"Archive\"\r\n",
      "A00000 OK done\r\n",
      "* LSUB () \"/\" \"INBOX\"\r\n",
      "A00001 OK done\r\n",
    );
    let mut store = store(dir.path(), Namespace::default(), server_says.as_bytes());
    let listings = store.list_folders().unwrap();
    assert_eq!(2, listings.len());
    assert_eq!("INBOX", listings[0].name);
    assert!(listings[0].subscribed);
    assert!(!listings[1].subscribed);
    assert!(listings[1].has_children);
  }

  #[test]
  fn state_dir_rejects_path_traversal_components() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path(), Namespace::default(), b"");
    let resolved = store.state_dir_for("../../etc/Archive");
    assert_eq!(dir.path().join("etc").join("Archive"), resolved);
  }

  #[test]
  fn noop_sends_a_bare_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = store(dir.path(), Namespace::default(), b"A00000 OK NOOP completed\r\n");
    store.noop().unwrap();
  }

  #[test]
  fn transfer_copies_between_two_open_folders() {
    let dir = tempfile::tempdir().unwrap();
    let server_says = concat!(
      "* OK [UIDVALIDITY 1] ok\r\nA00000 OK SELECT completed\r\n", // SELECT INBOX
      "* OK [UIDVALIDITY 1] ok\r\nA00001 OK SELECT completed\r\n", // SELECT Archive
      "A00002 OK [COPYUID 1 5 9] COPY completed\r\n",
    );
    let mut store = store(dir.path(), Namespace::default(), server_says.as_bytes());
    store.open_folder("INBOX").unwrap();
    store.open_folder("Archive").unwrap();
    store.transfer("INBOX", "Archive", &[Uid::Server(5)], false).unwrap();
  }
}
