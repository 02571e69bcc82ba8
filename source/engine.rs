//! FolderEngine (§4.5): the per-folder state machine driving SELECT, rescan, two-phase fetch,
//! flag synchronization, expunge, append, transfer, message retrieval, search delegation, and
//! quota lookup.
//!
//! Grounded on `camel-imap-folder.c`'s folder operations (generalized away from its
//! `CamelFolder`/`CamelException` shape into `Result`) and `camel-imap-journal.c`'s
//! `camel_imap_journal_entry_*` replay primitives, which this module implements as inherent
//! methods a `Store`-owned `journal::ReplayTarget` impl delegates to (DESIGN NOTES §9: only the
//! `Store`, which owns every open folder, can resolve a TRANSFER entry's destination).

use crate::cache::MessageCache;
use crate::config::{Config, Exiting};
use crate::connection::{Capabilities, Connection, Response};
use crate::error::{ImapError, Result};
use crate::journal::{Entry, Journal};
use crate::mime::MimePartWrapper;
use crate::session::{RawMessage, SearchEngine};
use crate::summary::{ContentStructure, Flags, FolderSummary, MessageInfo};
use crate::uid::{Remap, Uid};
use crate::wire::{self, Arg, Sexp};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Added/removed/changed/recent UIDs resulting from one engine operation (§4.5, "emits a change
/// notification").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
  pub added: Vec<Uid>,
  pub removed: Vec<Uid>,
  pub changed: Vec<Uid>,
  pub recent: Vec<Uid>,
}

impl ChangeSet {
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty() && self.recent.is_empty()
  }
}

pub struct FolderEngine<RW> {
  connection: Arc<Mutex<Connection<RW>>>,
  folder: String,
  summary: FolderSummary,
  summary_path: PathBuf,
  cache: Arc<MessageCache>,
  journal: Journal,
  config: Config,
  exiting: Exiting,
  permanent_flags: Vec<String>,
  custom_flags_supported: bool,
  read_only: bool,
  search: Mutex<Box<dyn SearchEngine + Send>>,
}

impl<RW> FolderEngine<RW>
where
  RW: Read + Write,
{
  /// SELECTs `folder` and loads (or initializes) its on-disk summary/cache/journal (§4.5.1).
  pub fn open(
    connection: Arc<Mutex<Connection<RW>>>,
    folder: &str,
    state_dir: &Path,
    config: Config,
    exiting: Exiting,
    search: Box<dyn SearchEngine + Send>,
  ) -> Result<Self> {
    fs::create_dir_all(state_dir).map_err(ImapError::Cache)?;
    let summary_path = state_dir.join("summary");
    let mut summary = match fs::File::open(&summary_path) {
      Ok(mut file) => FolderSummary::read(&mut file)?,
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => FolderSummary::new(),
      Err(error) => return Err(ImapError::Cache(error)),
    };
    let known_uids: HashSet<String> = summary.iter().map(|m| m.uid.to_string()).collect();
    let cache = Arc::new(MessageCache::open(&state_dir.join("cache"), &known_uids)?);
    let journal = Journal::open(&state_dir.join("journal"))?;

    let response = {
      let mut conn = connection.lock().unwrap();
      conn.select(folder)?
    };
    let permanent_flags = response_permanent_flags(&response);
    let custom_flags_supported = permanent_flags.iter().any(|f| f == "\\*");
    let read_only = response.text.to_ascii_uppercase().contains("READ-ONLY");
    let uidvalidity = find_bracket_number(&response.untagged, "UIDVALIDITY");

    if let (Some(fresh), Some(known)) = (uidvalidity, summary.uidvalidity) {
      if fresh != known {
        // §4.5.1: UIDVALIDITY changed underneath us. Every UID we hold is now meaningless.
        summary.clear();
        cache.clear()?;
      }
    }
    summary.uidvalidity = uidvalidity.or(summary.uidvalidity);

    let engine = Self {
      connection,
      folder: folder.to_string(),
      summary,
      summary_path,
      cache,
      journal,
      config,
      exiting,
      permanent_flags,
      custom_flags_supported,
      read_only,
      search: Mutex::new(search),
    };
    engine.persist_summary()?;
    Ok(engine)
  }

  pub fn folder(&self) -> &str {
    &self.folder
  }

  pub fn summary(&self) -> &FolderSummary {
    &self.summary
  }

  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  pub fn supports_custom_flags(&self) -> bool {
    self.custom_flags_supported
  }

  pub fn permanent_flags(&self) -> &[String] {
    &self.permanent_flags
  }

  pub fn journal(&self) -> &Journal {
    &self.journal
  }

  /// Exposed so a `Store` can drive replay itself (§4.6): none of the `*_resyncing` methods above
  /// touch `self.journal`, so the caller can swap it out for the duration of a `Journal::replay`
  /// call without the borrow checker seeing a conflict.
  pub fn journal_mut(&mut self) -> &mut Journal {
    &mut self.journal
  }

  fn persist_summary(&self) -> Result<()> {
    let tmp = self.summary_path.with_extension("tmp");
    {
      let mut file = fs::File::create(&tmp).map_err(ImapError::Cache)?;
      self.summary.write(&mut file)?;
    }
    fs::rename(&tmp, &self.summary_path).map_err(ImapError::Cache)
  }

  fn is_online(&self) -> bool {
    !self.exiting.is_set() && self.connection.lock().unwrap().is_connected()
  }

  /// §4.5.1: reselects the folder and decides, cheaply, whether a full `rescan` is warranted
  /// before falling back to the incremental `fetch_new`, rather than always paying for the full
  /// `UID FETCH 1:* (UID FLAGS)` diff.
  pub fn refresh(&mut self) -> Result<ChangeSet> {
    let response = {
      let mut conn = self.connection.lock().unwrap();
      conn.select(&self.folder)?
    };
    let permanent_flags = response_permanent_flags(&response);
    if !permanent_flags.is_empty() {
      self.permanent_flags = permanent_flags;
      self.custom_flags_supported = self.permanent_flags.iter().any(|f| f == "\\*");
    }
    self.read_only = response.text.to_ascii_uppercase().contains("READ-ONLY");

    let mut need_rescan = false;
    let uidvalidity = find_bracket_number(&response.untagged, "UIDVALIDITY");
    if let (Some(fresh), Some(known)) = (uidvalidity, self.summary.uidvalidity) {
      if fresh != known {
        self.summary.clear();
        self.cache.clear()?;
        need_rescan = true;
      }
    }
    self.summary.uidvalidity = uidvalidity.or(self.summary.uidvalidity);

    let exists = find_exists_count(&response.untagged).unwrap_or(0) as usize;
    if exists < self.summary.count() {
      need_rescan = true;
    } else if !need_rescan && self.summary.count() > 0 {
      need_rescan = self.probe_deletion_at_tail(exists)?;
    }

    if need_rescan {
      self.rescan()
    } else if exists > self.summary.count() {
      self.fetch_new()
    } else {
      Ok(ChangeSet::default())
    }
  }

  /// §4.5.1 step 5: probes the server UID at sequence `summary.count()`. A mismatch against the
  /// last UID we know about means something in the middle of the mailbox was expunged, which a
  /// plain `exists` vs. `summary.count()` comparison alone wouldn't catch.
  fn probe_deletion_at_tail(&mut self, exists: usize) -> Result<bool> {
    let seq = self.summary.count();
    if seq == 0 || seq > exists {
      return Ok(false);
    }
    let Some(last) = self.summary.index(seq - 1) else {
      return Ok(false);
    };
    let expected = last.uid.server();
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), "FETCH %d UID", &[Arg::Int(seq as i64)])?
    };
    if response.ok().is_err() {
      // A server that chokes on the probe is no worse off than one we never asked; fall back to
      // the expensive path.
      return Ok(true);
    }
    let probed = response.untagged.iter().find_map(|line| parse_fetch_line(line).ok().flatten()).and_then(|f| f.uid);
    Ok(probed != expected)
  }

  /// §4.5.2: a full re-fetch of every known UID's FLAGS, detecting both server-side flag changes
  /// (the local user-flag set is set to the server's reported set, not unioned with it, so a flag
  /// removed server-side is dropped locally too) and messages no longer present.
  pub fn rescan(&mut self) -> Result<ChangeSet> {
    if self.summary.count() == 0 {
      return self.fetch_new();
    }
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), "UID FETCH 1:* (UID FLAGS)", &[])?
    };
    response.ok()?;
    let mut seen = HashSet::new();
    let mut changed = Vec::new();
    let mut added = Vec::new();
    for line in &response.untagged {
      let Some(fetch) = parse_fetch_line(line)? else {
        continue;
      };
      let Some(n) = fetch.uid else {
        continue;
      };
      let server_uid = Uid::Server(n);
      seen.insert(server_uid.clone());
      let custom: BTreeSet<String> = fetch.custom_flags.iter().cloned().collect();
      if let Some(info) = self.summary.by_uid_mut(&server_uid) {
        let server_flags = fetch.flags.masked(Flags::SERVER_MASK);
        if info.server_flags != server_flags || info.user_flags != custom {
          if !info.flags.contains(Flags::FOLDER_FLAGGED) {
            info.flags = server_flags;
          }
          info.server_flags = server_flags;
          info.user_flags = custom;
          info.dirty = true;
          changed.push(server_uid.clone());
        }
      } else {
        let mut info = MessageInfo::new(server_uid.clone());
        info.flags = fetch.flags;
        info.server_flags = fetch.flags.masked(Flags::SERVER_MASK);
        info.user_flags = custom;
        self.summary.insert(info);
        added.push(server_uid);
      }
    }
    let stale: Vec<Uid> = self
      .summary
      .iter()
      .map(|m| m.uid.clone())
      .filter(|uid| uid.server().is_some() && !seen.contains(uid))
      .collect();
    for uid in &stale {
      self.summary.remove_uid(uid);
      self.cache.remove(&uid.to_string())?;
    }
    self.persist_summary()?;
    Ok(ChangeSet {
      added,
      removed: stale,
      changed,
      recent: Vec::new(),
    })
  }

  /// §4.5.3: phase one fetches UID/FLAGS/INTERNALDATE/RFC822.SIZE/header fields for every UID
  /// past the last one we know about.
  pub fn fetch_new(&mut self) -> Result<ChangeSet> {
    let start = self.summary.max_uid() + 1;
    let range = format!("{start}:*");
    let headers = self.config.header_set().join(" ");
    let items = format!("(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[HEADER.FIELDS ({headers})])");
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), "UID FETCH %s %s", &[Arg::Str(&range), Arg::Str(&items)])?
    };
    response.ok()?;
    let mut added = Vec::new();
    let mut recent = Vec::new();
    let mut pending: HashMap<u32, MessageInfo> = HashMap::new();
    for line in &response.untagged {
      let Some(fetch) = parse_fetch_line(line)? else {
        continue;
      };
      let Some(n) = fetch.uid else {
        continue;
      };
      let server_uid = Uid::Server(n);
      if self.summary.by_uid(&server_uid).is_some() {
        // A server reusing a UID we haven't expunged locally yet; never clobber what we have.
        continue;
      }
      let mut info = MessageInfo::new(server_uid.clone());
      info.flags = fetch.flags;
      info.server_flags = fetch.flags.masked(Flags::SERVER_MASK);
      info.user_flags = fetch.custom_flags.into_iter().collect();
      info.size = fetch.size.unwrap_or(0);
      info.received = fetch.internaldate.unwrap_or(0);
      if !self.config.filter_recent || fetch.flags.contains(Flags::RECENT) {
        recent.push(server_uid.clone());
      }
      match fetch.header {
        Some(bytes) => {
          self.cache.insert(&server_uid.to_string(), HEADER_PART_SPEC, &bytes)?;
          self.summary.insert(info);
          added.push(server_uid);
        }
        // Header didn't arrive in phase 1; hold the rest of what we learned and retry below.
        None => {
          pending.insert(n, info);
        }
      }
    }
    // Phase 2 (§4.5.3): some servers omit the header body part on the first pass; re-fetch it
    // (alongside BODYSTRUCTURE, since the spec pairs the two in the phase 2 request) for whatever
    // didn't arrive, then finish inserting those messages.
    if !pending.is_empty() {
      let mut missing: Vec<u32> = pending.keys().copied().collect();
      missing.sort_unstable();
      let mut offset = 0;
      while offset < missing.len() {
        let (set, next) = wire::encode_uid_set(&missing[offset..], self.config.uid_set_byte_limit);
        let item = format!("(BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS ({headers})])");
        let mut retry = {
          let mut conn = self.connection.lock().unwrap();
          conn.send_command(Some(&self.folder), "UID FETCH %s %s", &[Arg::Str(&set), Arg::Str(&item)])?
        };
        retry.ok()?;
        for line in &retry.untagged {
          let Some(fetch) = parse_fetch_line(line)? else {
            continue;
          };
          let Some(n) = fetch.uid else {
            continue;
          };
          let Some(mut info) = pending.remove(&n) else {
            continue;
          };
          info.structure = fetch.structure.or(info.structure);
          let header_bytes = fetch.header.unwrap_or_default();
          self.cache.insert(&n.to_string(), HEADER_PART_SPEC, &header_bytes)?;
          self.summary.insert(info);
          added.push(Uid::Server(n));
        }
        offset += next;
      }
      // Whatever the server still didn't answer for gets inserted anyway with an empty header
      // rather than silently vanishing from the change set.
      for (n, info) in pending {
        self.cache.insert(&n.to_string(), HEADER_PART_SPEC, b"")?;
        self.summary.insert(info);
        added.push(Uid::Server(n));
      }
    }
    self.persist_summary()?;
    Ok(ChangeSet {
      added,
      removed: Vec::new(),
      changed: Vec::new(),
      recent,
    })
  }

  /// §4.5.4: pushes every locally flagged-dirty message's flags to the server, clearing
  /// FOLDER_FLAGGED on success. UIDs that share the same permanent/user/server flag set are
  /// batched into one `STORE` over the largest adjacent UID range the byte limit allows, since an
  /// empty-flags `STORE` falls back to removing the matched message's own server flags and would
  /// otherwise stomp a differently-flagged message swept into the same batch.
  pub fn sync(&mut self) -> Result<()> {
    let mut pending: Vec<Uid> = self.summary.changed_set();
    pending.sort_unstable_by_key(|uid| uid.server().unwrap_or(u32::MAX));
    let mut done = HashSet::new();
    for uid in pending.clone() {
      if done.contains(&uid) {
        continue;
      }
      done.insert(uid.clone());
      let Some(n) = uid.server() else {
        // A temporary UID's flags travel with its eventual APPEND; nothing to push yet.
        continue;
      };
      let Some(info) = self.summary.by_uid(&uid) else {
        continue;
      };
      let permanent = info.flags.masked(Flags::SERVER_MASK);
      let user_flags = info.user_flags.clone();
      let server_flags = info.server_flags;

      let mut batch = vec![n];
      for other in &pending {
        if done.contains(other) {
          continue;
        }
        let Some(m) = other.server() else { continue };
        let Some(other_info) = self.summary.by_uid(other) else { continue };
        if other_info.flags.masked(Flags::SERVER_MASK) == permanent
          && other_info.user_flags == user_flags
          && other_info.server_flags == server_flags
        {
          batch.push(m);
          done.insert(other.clone());
        }
      }
      batch.sort_unstable();

      let mut offset = 0;
      while offset < batch.len() {
        let (_, next) = wire::encode_uid_set(&batch[offset..], self.config.uid_set_byte_limit);
        self.push_flags(&batch[offset..offset + next], permanent, &user_flags, server_flags)?;
        offset += next;
      }
    }
    self.persist_summary()
  }

  /// Issues one `STORE` for `uids` (already batched/chunked by the caller) and, on success, clears
  /// FOLDER_FLAGGED locally for each.
  fn push_flags(&mut self, uids: &[u32], permanent: Flags, user_flags: &BTreeSet<String>, server_flags: Flags) -> Result<()> {
    let (set, _) = wire::encode_uid_set(uids, self.config.uid_set_byte_limit);
    let mut names: Vec<&str> = permanent.names();
    let user_flag_refs: Vec<&str> = user_flags.iter().map(String::as_str).collect();
    names.extend(user_flag_refs);
    if names.is_empty() {
      // Some servers reject `STORE FLAGS.SILENT ()`; clear by removing whatever's known
      // server-side instead (§4.5.4).
      let current: Vec<&str> = server_flags.names();
      let result = if current.is_empty() {
        Ok(())
      } else {
        let flag_list = wire::encode_flag_list(&current);
        let mut conn = self.connection.lock().unwrap();
        conn
          .send_command(Some(&self.folder), "UID STORE %s -FLAGS.SILENT %s", &[Arg::Str(&set), Arg::Str(&flag_list)])
          .and_then(|r| r.ok())
      };
      if result.is_err() {
        // Last resort (§4.5.4 step 4): a no-op STORE still exercises the round trip, letting us
        // clear FOLDER_FLAGGED locally even though the server never accepted the real change.
        let mut conn = self.connection.lock().unwrap();
        conn
          .send_command(Some(&self.folder), "UID STORE %s +FLAGS.SILENT (\\Seen)", &[Arg::Str(&set)])
          .and_then(|r| r.ok())?;
      }
    } else {
      let flag_list = wire::encode_flag_list(&names);
      let mut conn = self.connection.lock().unwrap();
      conn
        .send_command(Some(&self.folder), "UID STORE %s FLAGS.SILENT %s", &[Arg::Str(&set), Arg::Str(&flag_list)])
        .and_then(|r| r.ok())?;
    }
    for &n in uids {
      if let Some(info) = self.summary.by_uid_mut(&Uid::Server(n)) {
        info.flags = info.flags & !Flags::FOLDER_FLAGGED;
        info.server_flags = info.flags.masked(Flags::SERVER_MASK);
        info.dirty = false;
      }
    }
    Ok(())
  }

  /// §4.5.5: expunges every locally `\Deleted` message. With UIDPLUS, marks and expunges only our
  /// own delete set via `UID STORE`/`UID EXPUNGE`, falling back to a bare `EXPUNGE` if the server's
  /// `UID EXPUNGE` itself misbehaves. Without UIDPLUS, temporarily un-deletes whatever the server
  /// thinks is `\Deleted` but we don't want gone, expunges, then restores that kept set.
  pub fn expunge(&mut self) -> Result<ChangeSet> {
    let mut deleted: Vec<u32> = self
      .summary
      .iter()
      .filter(|m| m.flags.contains(Flags::DELETED))
      .filter_map(|m| m.uid.server())
      .collect();
    if deleted.is_empty() {
      return Ok(ChangeSet::default());
    }
    deleted.sort_unstable();
    let supports_uidplus = self.connection.lock().unwrap().capabilities().contains(Capabilities::UIDPLUS);
    if supports_uidplus {
      let mut offset = 0;
      while offset < deleted.len() {
        let (set, next) = wire::encode_uid_set(&deleted[offset..], self.config.uid_set_byte_limit);
        {
          let mut conn = self.connection.lock().unwrap();
          conn.send_command(Some(&self.folder), "UID STORE %s +FLAGS.SILENT (\\Deleted)", &[Arg::Str(&set)])?.ok()?;
        }
        let expunged = {
          let mut conn = self.connection.lock().unwrap();
          conn.send_command(Some(&self.folder), "UID EXPUNGE %s", &[Arg::Str(&set)])?
        };
        if expunged.ok().is_err() {
          // A server whose UID EXPUNGE itself is broken still honors a bare EXPUNGE of what was
          // just marked.
          let mut conn = self.connection.lock().unwrap();
          conn.send_command(Some(&self.folder), "EXPUNGE", &[])?.ok()?;
        }
        offset += next;
      }
    } else {
      self.sync()?;
      let mark_set = deleted.clone();
      let server_deleted = self.search_deleted()?;
      let keep_set: Vec<u32> = server_deleted.into_iter().filter(|n| !mark_set.contains(n)).collect();
      self.store_delete_flag(&keep_set, false)?;
      self.store_delete_flag(&mark_set, true)?;
      {
        let mut conn = self.connection.lock().unwrap();
        conn.send_command(Some(&self.folder), "EXPUNGE", &[])?.ok()?;
      }
      self.store_delete_flag(&keep_set, true)?;
    }
    let mut removed = Vec::new();
    for n in deleted {
      let uid = Uid::Server(n);
      self.summary.remove_uid(&uid);
      self.cache.remove(&uid.to_string())?;
      removed.push(uid);
    }
    self.persist_summary()?;
    Ok(ChangeSet {
      added: Vec::new(),
      removed,
      changed: Vec::new(),
      recent: Vec::new(),
    })
  }

  /// `UID SEARCH DELETED`, returning every UID the server currently considers `\Deleted` (§4.5.5
  /// non-UIDPLUS fallback).
  fn search_deleted(&mut self) -> Result<Vec<u32>> {
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), "UID SEARCH DELETED", &[])?
    };
    response.ok()?;
    Ok(response.untagged.iter().filter_map(|line| parse_search_response(line)).flatten().collect())
  }

  fn store_delete_flag(&mut self, uids: &[u32], set: bool) -> Result<()> {
    if uids.is_empty() {
      return Ok(());
    }
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    let fmt = if set { "UID STORE %s +FLAGS.SILENT (\\Deleted)" } else { "UID STORE %s -FLAGS.SILENT (\\Deleted)" };
    let mut offset = 0;
    while offset < sorted.len() {
      let (chunk, next) = wire::encode_uid_set(&sorted[offset..], self.config.uid_set_byte_limit);
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), fmt, &[Arg::Str(&chunk)])?.ok()?;
      offset += next;
    }
    Ok(())
  }

  /// §4.5.6: appends `bytes` with `flags`/`user_flags`, online if possible, falling back to an
  /// offline journal entry on any transport failure (or when already offline).
  pub fn append(&mut self, bytes: &[u8], flags: Flags, user_flags: &[String]) -> Result<Uid> {
    if !self.is_online() {
      return self.append_offline(bytes, flags, user_flags);
    }
    match self.append_online(bytes, flags, user_flags) {
      Ok(uid) => Ok(uid),
      Err(ImapError::Transport(_)) => self.append_offline(bytes, flags, user_flags),
      Err(error) => Err(error),
    }
  }

  fn append_online(&mut self, bytes: &[u8], flags: Flags, user_flags: &[String]) -> Result<Uid> {
    let standard: Vec<&str> = flags.masked(Flags::SERVER_MASK).names();
    let mut names = standard.clone();
    let user_flag_refs: Vec<&str> = user_flags.iter().map(String::as_str).collect();
    names.extend(user_flag_refs);
    let flag_list = wire::encode_flag_list(&names);
    // `Arg::String` only round-trips valid UTF-8; callers are expected to hand in already
    // 7-bit-clean or base64-encoded MIME, matching the rest of the wire-string API (§4.1).
    let body = String::from_utf8_lossy(bytes).into_owned();
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(
        Some(&self.folder),
        "APPEND %F %s %S",
        &[Arg::Folder(&self.folder), Arg::Str(&flag_list), Arg::String(&body)],
      )?
    };
    if response.ok().is_err() && !user_flags.is_empty() {
      // Some servers reject unrecognized custom flags outright; retry with the standard set only.
      let standard_list = wire::encode_flag_list(&standard);
      let mut conn = self.connection.lock().unwrap();
      response = conn.send_command(
        Some(&self.folder),
        "APPEND %F %s %S",
        &[Arg::Folder(&self.folder), Arg::Str(&standard_list), Arg::String(&body)],
      )?;
    }
    response.ok()?;
    let server_uid = match parse_appenduid(&response.text) {
      Some(n) => Uid::Server(n),
      None => crate::uid::temporary(),
    };
    let mut info = MessageInfo::new(server_uid.clone());
    info.flags = flags;
    info.server_flags = flags.masked(Flags::SERVER_MASK);
    info.user_flags = user_flags.iter().cloned().collect();
    info.size = bytes.len() as u64;
    self.cache.insert(&server_uid.to_string(), "", bytes)?;
    self.summary.insert(info);
    self.persist_summary()?;
    Ok(server_uid)
  }

  fn append_offline(&mut self, bytes: &[u8], flags: Flags, user_flags: &[String]) -> Result<Uid> {
    let temp_uid = crate::uid::temporary();
    let mut info = MessageInfo::new(temp_uid.clone());
    info.flags = flags | Flags::FOLDER_FLAGGED;
    info.server_flags = Flags::default();
    info.user_flags = user_flags.iter().cloned().collect();
    info.size = bytes.len() as u64;
    self.cache.insert(&temp_uid.to_string(), "", bytes)?;
    self.summary.insert(info);
    self.journal.log(Entry::Append { temp_uid: temp_uid.clone() })?;
    self.persist_summary()?;
    Ok(temp_uid)
  }

  /// §4.5.7: COPYs (or, when moving and the server advertises it, XGWMOVEs) `uids` into
  /// `destination`. Falls back to an offline journal entry when offline or when any UID is still
  /// temporary (unresolved, so the server can't be told about it yet).
  pub fn transfer(&mut self, destination: &mut FolderEngine<RW>, uids: &[Uid], delete_originals: bool) -> Result<()> {
    if !self.is_online() || uids.iter().any(Uid::is_temporary) {
      return self.transfer_offline(destination, uids, delete_originals);
    }
    self.transfer_online(destination, uids, delete_originals)
  }

  fn transfer_online(&mut self, destination: &mut FolderEngine<RW>, uids: &[Uid], delete_originals: bool) -> Result<()> {
    let mut server_uids: Vec<u32> = uids.iter().filter_map(Uid::server).collect();
    server_uids.sort_unstable();
    server_uids.dedup();
    if server_uids.is_empty() {
      return Ok(());
    }
    let xgwmove =
      delete_originals && self.connection.lock().unwrap().capabilities().contains(Capabilities::XGWMOVE);
    let mut offset = 0;
    while offset < server_uids.len() {
      let (set, next) = wire::encode_uid_set(&server_uids[offset..], self.config.uid_set_byte_limit);
      let fmt = if xgwmove { "UID XGWMOVE %s %F" } else { "UID COPY %s %F" };
      let response = {
        let mut conn = self.connection.lock().unwrap();
        conn.send_command(Some(&self.folder), fmt, &[Arg::Str(&set), Arg::Folder(&destination.folder)])?
      };
      response.ok()?;
      let copyuid = parse_copyuid(&response.text);
      for &n in &server_uids[offset..offset + next] {
        let src_uid = Uid::Server(n);
        let dst_n = copyuid.as_ref().and_then(|m| m.get(&n)).copied();
        if let Some(info) = self.summary.by_uid(&src_uid).cloned() {
          if let Some(dst_n) = dst_n {
            let mut moved = info;
            moved.uid = Uid::Server(dst_n);
            self.cache.copy(&src_uid.to_string(), destination.cache.as_ref(), &moved.uid.to_string())?;
            destination.summary.insert(moved);
          }
        }
        if delete_originals {
          self.summary.remove_uid(&src_uid);
          self.cache.remove(&src_uid.to_string())?;
        }
      }
      offset += next;
    }
    destination.persist_summary()?;
    self.persist_summary()
  }

  fn transfer_offline(&mut self, destination: &mut FolderEngine<RW>, uids: &[Uid], delete_originals: bool) -> Result<()> {
    self.journal.log(Entry::Transfer {
      destination: destination.folder.clone(),
      uids: uids.to_vec(),
      delete_originals,
    })
  }

  // --- journal::ReplayTarget primitives (delegated to by a `Store`-level adapter) ---

  pub fn append_resyncing(&mut self, temp_uid: &Uid) -> Result<u32> {
    let uid_str = temp_uid.to_string();
    let handle = self
      .cache
      .get(&uid_str, "")
      .ok_or_else(|| ImapError::Logical(format!("no cached body for {uid_str}")))?;
    let mut bytes = Vec::new();
    handle.reader().map_err(ImapError::Cache)?.read_to_end(&mut bytes).map_err(ImapError::Cache)?;
    let (flags, user_flags) = self
      .summary
      .by_uid(temp_uid)
      .map(|m| (m.flags, m.user_flags.iter().cloned().collect::<Vec<_>>()))
      .unwrap_or_default();
    let new_uid = self.append_online(&bytes, flags, &user_flags)?;
    let server = new_uid
      .server()
      .ok_or_else(|| ImapError::Logical("append did not resolve to a server uid".to_string()))?;
    self.summary.remove_uid(temp_uid);
    self.cache.remove(&uid_str)?;
    self.persist_summary()?;
    Ok(server)
  }

  pub fn expunge_uids_resyncing(&mut self, uids: &[Uid]) -> Result<()> {
    for n in uids.iter().filter_map(Uid::server) {
      if let Some(info) = self.summary.by_uid_mut(&Uid::Server(n)) {
        info.flags = info.flags | Flags::DELETED;
      }
    }
    self.expunge().map(|_| ())
  }

  pub fn transfer_resyncing(
    &mut self,
    destination: &mut FolderEngine<RW>,
    uids: &[Uid],
    delete_originals: bool,
    remap: &Remap,
  ) -> Result<()> {
    let resolved: Vec<Uid> = uids.iter().filter_map(|u| remap.lookup(u)).collect();
    self.transfer_online(destination, &resolved, delete_originals)
  }

  /// §4.5.8: returns the whole message, preferring the cache, falling back to a whole-body fetch
  /// when the message is small, braindamaged mode is forced, or the part tree isn't known yet.
  pub fn get_message(&mut self, uid: &Uid) -> Result<RawMessage> {
    let uid_str = uid.to_string();
    if let Some(handle) = self.cache.get(&uid_str, "") {
      let mut bytes = Vec::new();
      handle.reader().map_err(ImapError::Cache)?.read_to_end(&mut bytes).map_err(ImapError::Cache)?;
      return Ok(RawMessage { bytes });
    }
    let server_uid = uid
      .server()
      .ok_or_else(|| ImapError::Logical("cannot fetch an unresolved temporary uid from the server".to_string()))?;
    let bytes = match self.fetch_whole_body(server_uid) {
      Ok(bytes) => bytes,
      // A lone "service unavailable" is worth one silent retry before surfacing it (§4.5.8).
      Err(ImapError::Transport(_)) => self.fetch_whole_body(server_uid)?,
      Err(error) => return Err(error),
    };
    self.cache.insert(&uid_str, "", &bytes)?;
    Ok(RawMessage { bytes })
  }

  fn fetch_whole_body(&mut self, uid: u32) -> Result<Vec<u8>> {
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), "UID FETCH %d BODY.PEEK[]", &[Arg::Int(uid as i64)])?
    };
    response.ok()?;
    let line = response
      .untagged
      .iter()
      .find(|line| memchr::memmem::find(line, b"BODY[]").is_some())
      .ok_or_else(|| ImapError::Protocol("no BODY[] in FETCH response".to_string()))?;
    extract_body_literal(line, "BODY[]")
  }

  /// §4.5.8: a lazy handle onto one MIME part, fetched from the server on first read.
  pub fn part(&self, uid: &Uid, part_spec: &str) -> MimePartWrapper<RW> {
    MimePartWrapper::new(&self.folder, &uid.to_string(), part_spec, self.cache.clone(), self.connection.clone())
  }

  /// §6 Store-level interface `uncached_uids`: the subset of `uids` whose whole body isn't on disk
  /// yet.
  pub fn uncached_uids<'a>(&self, uids: &'a [String]) -> Vec<&'a str> {
    self.cache.filter_cached(uids)
  }

  /// §6 Store-level interface `get_filename`: the on-disk path a cached `(uid, part-spec)` would
  /// live at, whether or not it's actually been fetched yet.
  pub fn get_filename(&self, uid: &Uid, part_spec: &str) -> PathBuf {
    self.cache.get_filename(&uid.to_string(), part_spec)
  }

  /// §4.5.8: fetches (and caches) BODYSTRUCTURE for `uid` if not already known.
  pub fn sync_message_structure(&mut self, uid: &Uid) -> Result<ContentStructure> {
    if let Some(structure) = self.summary.by_uid(uid).and_then(|m| m.structure.clone()) {
      if structure.is_complete() {
        return Ok(structure);
      }
    }
    let n = uid
      .server()
      .ok_or_else(|| ImapError::Logical("cannot fetch structure for an unresolved temporary uid".to_string()))?;
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), "UID FETCH %d BODYSTRUCTURE", &[Arg::Int(n as i64)])?
    };
    response.ok()?;
    let line = response
      .untagged
      .iter()
      .find_map(|line| parse_fetch_line(line).ok().flatten())
      .and_then(|fetch| fetch.structure)
      .ok_or_else(|| ImapError::Protocol("no BODYSTRUCTURE in FETCH response".to_string()))?;
    if let Some(info) = self.summary.by_uid_mut(uid) {
      info.structure = Some(line.clone());
    }
    self.persist_summary()?;
    Ok(line)
  }

  /// §4.5.9: search/count delegate to the embedder's `SearchEngine`, scoped to this folder.
  pub fn search_by_expression(&self, expression: &str, uids: Option<&[u32]>) -> Result<Vec<u32>> {
    self.search.lock().unwrap().search(&self.folder, expression, uids)
  }

  pub fn count_by_expression(&self, expression: &str) -> Result<u32> {
    self.search.lock().unwrap().count(&self.folder, expression)
  }

  /// §4.5.10: `GETQUOTAROOT`, parsed into `(resource, used, total)` triples across every quota
  /// root the server names.
  pub fn get_quota_info(&mut self) -> Result<Vec<(String, u64, u64)>> {
    let supports_quota = self.connection.lock().unwrap().capabilities().contains(Capabilities::QUOTA);
    if !supports_quota {
      return Ok(Vec::new());
    }
    let mut response = {
      let mut conn = self.connection.lock().unwrap();
      conn.send_command(Some(&self.folder), "GETQUOTAROOT %F", &[Arg::Folder(&self.folder)])?
    };
    response.ok()?;
    let mut resources = Vec::new();
    for line in &response.untagged {
      let Some(pos) = memchr::memmem::find(line, b"QUOTA ") else {
        continue;
      };
      let rest = &line[pos + "QUOTA ".len()..];
      let (_root, next) = wire::parse_sexp(rest, 0)?;
      let (list, _) = wire::parse_sexp(rest, next)?;
      let Some(items) = list.as_list() else {
        continue;
      };
      let mut i = 0;
      while i + 2 < items.len() {
        let name = items[i].as_string().map(|s| s.into_owned()).unwrap_or_default();
        let used: u64 = items[i + 1].as_string().and_then(|s| s.parse().ok()).unwrap_or(0);
        let total: u64 = items[i + 2].as_string().and_then(|s| s.parse().ok()).unwrap_or(0);
        resources.push((name, used, total));
        i += 3;
      }
    }
    Ok(resources)
  }
}

// ---------------------------------------------------------------------------------------------
// Response scanning helpers
// ---------------------------------------------------------------------------------------------

fn find_bracket_number(lines: &[Vec<u8>], keyword: &str) -> Option<u32> {
  for line in lines {
    if let Some(pos) = memchr::memmem::find(line, keyword.as_bytes()) {
      let rest = &line[pos + keyword.len()..];
      let digits: String = rest
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|&&b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect();
      if let Ok(n) = digits.parse() {
        return Some(n);
      }
    }
  }
  None
}

/// Parses the `<n>` out of an untagged `* <n> EXISTS` line (§4.5.1).
fn find_exists_count(lines: &[Vec<u8>]) -> Option<u32> {
  for line in lines {
    if let Some(pos) = memchr::memmem::find(line, b"EXISTS") {
      let digits: String =
        line[..pos].iter().rev().skip_while(|&&b| b == b' ').take_while(|&&b| b.is_ascii_digit()).map(|&b| b as char).collect();
      if let Ok(n) = digits.chars().rev().collect::<String>().parse() {
        return Some(n);
      }
    }
  }
  None
}

fn response_permanent_flags(response: &Response) -> Vec<String> {
  for line in &response.untagged {
    if let Some(pos) = memchr::memmem::find(line, b"PERMANENTFLAGS") {
      let rest = &line[pos + "PERMANENTFLAGS".len()..];
      if let Ok((sexp, _)) = wire::parse_sexp(rest, 0) {
        if let Ok(names) = wire::parse_flag_list(&sexp) {
          return names;
        }
      }
    }
  }
  Vec::new()
}

/// Parses one untagged `* SEARCH <n1> <n2> ...` line into the UIDs it lists.
fn parse_search_response(line: &[u8]) -> Option<Vec<u32>> {
  let pos = memchr::memmem::find(line, b"SEARCH")?;
  let rest = std::str::from_utf8(&line[pos + "SEARCH".len()..]).ok()?;
  Some(rest.split_whitespace().filter_map(|tok| tok.parse().ok()).collect())
}

fn parse_appenduid(text: &str) -> Option<u32> {
  let pos = text.find("APPENDUID")?;
  let mut parts = text[pos + "APPENDUID".len()..].split_whitespace();
  let _uidvalidity = parts.next()?;
  parts.next()?.trim_end_matches(']').parse().ok()
}

fn parse_copyuid(text: &str) -> Option<HashMap<u32, u32>> {
  let pos = text.find("COPYUID")?;
  let mut parts = text[pos + "COPYUID".len()..].split_whitespace();
  let _uidvalidity = parts.next()?;
  let source_set = parts.next()?.trim_end_matches(']');
  let dest_set = parts.next()?.trim_end_matches(']');
  let sources = wire::decode_uid_set(source_set).ok()?;
  let dests = wire::decode_uid_set(dest_set).ok()?;
  if sources.len() != dests.len() {
    return None;
  }
  Some(sources.into_iter().zip(dests).collect())
}

/// Extracts the raw bytes of a `{N}`-prefixed literal immediately following `section` (e.g.
/// `BODY[1]`) in an already-reassembled response line (§4.1: the literal's header and payload sit
/// back-to-back in the line, with no separator, once `wire::Reader` has normalized it).
pub(crate) fn extract_body_literal(line: &[u8], section: &str) -> Result<Vec<u8>> {
  let pos = memchr::memmem::find(line, section.as_bytes())
    .ok_or_else(|| ImapError::Protocol(format!("{section} not found in response")))?;
  let mut i = pos + section.len();
  while line.get(i) == Some(&b' ') {
    i += 1;
  }
  if line.get(i) != Some(&b'{') {
    return Err(ImapError::Protocol(format!("expected a literal after {section}")));
  }
  i += 1;
  let digit_start = i;
  while line.get(i).is_some_and(u8::is_ascii_digit) {
    i += 1;
  }
  let n: usize = std::str::from_utf8(&line[digit_start..i])
    .ok()
    .and_then(|s| s.parse().ok())
    .ok_or_else(|| ImapError::Protocol("invalid literal length".to_string()))?;
  if line.get(i) != Some(&b'}') {
    return Err(ImapError::Protocol("malformed literal header".to_string()));
  }
  i += 1;
  if i + n > line.len() {
    return Err(ImapError::Protocol("truncated literal".to_string()));
  }
  Ok(line[i..i + n].to_vec())
}

// ---------------------------------------------------------------------------------------------
// FETCH line parsing
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FetchResult {
  uid: Option<u32>,
  flags: Flags,
  custom_flags: Vec<String>,
  size: Option<u64>,
  internaldate: Option<i64>,
  structure: Option<ContentStructure>,
  header: Option<Vec<u8>>,
}

/// The part-spec headers are cached under, distinct from the whole-message marker (`cache.rs`'s
/// `WHOLE_MESSAGE_MARKER`) and any numbered MIME part.
const HEADER_PART_SPEC: &str = "HEADER";

const SERVER_FLAG_NAMES: &[&str] = &["\\Seen", "\\Answered", "\\Deleted", "\\Draft", "\\Flagged", "\\Junk", "\\Recent"];

fn parse_fetch_line(line: &[u8]) -> Result<Option<FetchResult>> {
  let Some(pos) = memchr::memmem::find(line, b"FETCH") else {
    return Ok(None);
  };
  let items = wire::parse_list(&line[pos + "FETCH".len()..])?;
  let mut result = FetchResult::default();
  let mut i = 0;
  while i + 1 < items.len() {
    let key = items[i].as_string().map(|s| s.to_ascii_uppercase());
    match key.as_deref() {
      Some("UID") => result.uid = items[i + 1].as_string().and_then(|s| s.parse().ok()),
      Some("FLAGS") => {
        let names = wire::parse_flag_list(&items[i + 1])?;
        let (known, custom): (Vec<String>, Vec<String>) =
          names.into_iter().partition(|n| SERVER_FLAG_NAMES.contains(&n.as_str()));
        result.flags = Flags::from_names(known.iter().map(String::as_str));
        result.custom_flags = custom;
      }
      Some("RFC822.SIZE") => result.size = items[i + 1].as_string().and_then(|s| s.parse().ok()),
      Some("INTERNALDATE") => result.internaldate = items[i + 1].as_string().and_then(|s| parse_internaldate(&s)),
      Some("BODYSTRUCTURE") => result.structure = Some(parse_bodystructure(&items[i + 1], "")),
      Some(k) if k.starts_with("BODY[HEADER") || k.starts_with("BODY.PEEK[HEADER") => {
        result.header = match &items[i + 1] {
          Sexp::Literal(bytes) | Sexp::Quoted(bytes) | Sexp::Atom(bytes) => Some(bytes.clone()),
          Sexp::Nil | Sexp::List(_) => None,
        }
      }
      _ => {}
    }
    i += 2;
  }
  Ok(Some(result))
}

fn parse_internaldate(s: &str) -> Option<i64> {
  chrono::DateTime::parse_from_str(s.trim_matches('"'), "%d-%b-%Y %H:%M:%S %z")
    .ok()
    .map(|dt| dt.timestamp())
}

fn child_spec(prefix: &str, n: usize) -> String {
  if prefix.is_empty() {
    n.to_string()
  } else {
    format!("{prefix}.{n}")
  }
}

/// A deliberately simplified BODYSTRUCTURE parser (§4.3/§6 `ContentStructure`): content-type,
/// subtype, transfer-encoding, and positional part-spec paths, without envelope, disposition,
/// language, or location fields — `ContentStructure` doesn't carry them.
fn parse_bodystructure(sexp: &Sexp, prefix: &str) -> ContentStructure {
  let Some(items) = sexp.as_list() else {
    return ContentStructure::default();
  };
  let is_multipart = items.first().map(|item| item.as_list().is_some()).unwrap_or(false);
  if is_multipart {
    let mut children = Vec::new();
    let mut subtype = String::new();
    let mut n = 1;
    for item in items {
      if item.as_list().is_some() {
        children.push(parse_bodystructure(item, &child_spec(prefix, n)));
        n += 1;
      } else if subtype.is_empty() {
        subtype = item.as_string().map(|s| s.into_owned()).unwrap_or_default();
      }
    }
    ContentStructure {
      content_type: "multipart".to_string(),
      subtype,
      transfer_encoding: String::new(),
      part_spec: prefix.to_string(),
      children,
    }
  } else {
    let get = |i: usize| items.get(i).and_then(|s| s.as_string()).map(|s| s.into_owned()).unwrap_or_default();
    ContentStructure {
      content_type: get(0),
      subtype: get(1),
      transfer_encoding: get(5),
      part_spec: if prefix.is_empty() { "1".to_string() } else { prefix.to_string() },
      children: Vec::new(),
    }
  }
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

  fn engine(server_says: &[u8]) -> FolderEngine<Loopback> {
    let connection = Arc::new(Mutex::new(Connection::new(Loopback {
      inbound: Cursor::new(server_says.to_vec()),
      outbound: Vec::new(),
    })));
    let dir = tempfile::tempdir().unwrap();
    FolderEngine::open(
      connection,
      "INBOX",
      dir.path(),
      Config::default(),
      Exiting::new(),
      Box::new(crate::session::NullSearchEngine),
    )
    .unwrap()
  }

  #[test]
  fn open_reads_permanentflags_and_uidvalidity() {
    let engine = engine(
      b"* FLAGS (\\Seen \\Deleted)\r\n\
* OK [PERMANENTFLAGS (\\Seen \\Deleted \\*)] ok\r\n\
* 0 EXISTS\r\n\
* OK [UIDVALIDITY 100] ok\r\n\
A00000 OK [READ-WRITE] SELECT completed\r\n",
    );
    assert!(engine.supports_custom_flags());
    assert_eq!(Some(100), engine.summary().uidvalidity);
    assert!(!engine.is_read_only());
  }

  #[test]
  fn fetch_new_adds_messages_and_marks_recent() {
    let mut engine = engine(b"* OK [UIDVALIDITY 1] ok\r\nA00000 OK SELECT completed\r\n");
    // Seed the connection's inbound buffer for the subsequent FETCH via a fresh loopback swap.
    let connection = Arc::new(Mutex::new(Connection::new(Loopback {
      inbound: Cursor::new(
        b"* 1 FETCH (UID 1 FLAGS (\\Recent) INTERNALDATE \"17-Jul-2020 02:44:25 +0000\" RFC822.SIZE 120 BODY[HEADER.FIELDS (DATE)] {0})\r\nA00001 OK done\r\n".to_vec(),
      ),
      outbound: Vec::new(),
    })));
    engine_set_connection(&mut engine, connection);
    let changes = engine.fetch_new().unwrap();
    assert_eq!(1, changes.added.len());
    assert_eq!(1, changes.recent.len());
    assert_eq!(1, engine.summary().count());
  }

  fn engine_set_connection(engine: &mut FolderEngine<Loopback>, connection: Arc<Mutex<Connection<Loopback>>>) {
    engine.connection = connection;
  }

  #[test]
  fn extract_body_literal_reads_inline_literal() {
    let line = b"1 FETCH (BODY[1] {5}hello)";
    assert_eq!(b"hello".to_vec(), extract_body_literal(line, "BODY[1]").unwrap());
  }

  #[test]
  fn bodystructure_parses_simple_text_part() {
    let (sexp, _) = wire::parse_sexp(b"(\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 120 10)", 0).unwrap();
    let structure = parse_bodystructure(&sexp, "");
    assert_eq!("TEXT", structure.content_type);
    assert_eq!("PLAIN", structure.subtype);
    assert_eq!("7BIT", structure.transfer_encoding);
    assert_eq!("1", structure.part_spec);
  }

  #[test]
  fn bodystructure_parses_multipart_children() {
    let (sexp, _) = wire::parse_sexp(
      b"((\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 10 1)(\"TEXT\" \"HTML\" NIL NIL NIL \"7BIT\" 20 2) \"MIXED\")",
      0,
    )
    .unwrap();
    let structure = parse_bodystructure(&sexp, "");
    assert!(structure.is_multipart());
    assert_eq!("MIXED", structure.subtype);
    assert_eq!(2, structure.children.len());
    assert_eq!("1", structure.children[0].part_spec);
    assert_eq!("2", structure.children[1].part_spec);
  }

  #[test]
  fn appenduid_and_copyuid_parse() {
    assert_eq!(Some(3955), parse_appenduid("[APPENDUID 38505 3955] APPEND completed"));
    let map = parse_copyuid("[COPYUID 38505 304,319:320 3956:3958] COPY completed").unwrap();
    assert_eq!(Some(&3956), map.get(&304));
    assert_eq!(Some(&3957), map.get(&319));
    assert_eq!(Some(&3958), map.get(&320));
  }

  #[test]
  fn uncached_uids_excludes_whole_bodies_already_on_disk() {
    let mut engine = engine(b"* OK [UIDVALIDITY 1] ok\r\nA00000 OK SELECT completed\r\n");
    engine.cache.insert("7", "", b"whole body").unwrap();
    let uids = vec!["7".to_string(), "8".to_string()];
    assert_eq!(vec!["8"], engine.uncached_uids(&uids));
  }

  #[test]
  fn get_filename_is_stable_for_the_same_uid_and_part() {
    let engine = engine(b"* OK [UIDVALIDITY 1] ok\r\nA00000 OK SELECT completed\r\n");
    let uid = Uid::Server(7);
    assert_eq!(engine.get_filename(&uid, "1"), engine.get_filename(&uid, "1"));
    assert_ne!(engine.get_filename(&uid, "1"), engine.get_filename(&uid, "2"));
  }
}
