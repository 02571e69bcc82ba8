//! FolderSummary (§4.4) and the `MessageInfo` record (§3) it indexes.
//!
//! Grounded on `camel-imap-folder.c`'s summary fields (there's no direct teacher equivalent — the
//! teacher tracks synchronization state inside the Notmuch database itself — generalized into its
//! own persisted structure per §6 "Persisted state per folder") and `camel-imap-journal.c`'s
//! length-prefixed encoding conventions, shared via [`crate::codec`].

use crate::codec;
use crate::error::{ImapError, Result};
use crate::uid::Uid;
use std::collections::BTreeSet;
use std::io::{Read, Write};

pub const SCHEMA_VERSION: u32 = 3;
const MAGIC: &[u8; 4] = b"SIN1";

/// A bit set drawn from {SEEN, ANSWERED, DELETED, DRAFT, FLAGGED, JUNK, RECENT} plus the internal
/// FOLDER_FLAGGED bit meaning "local change not yet pushed" (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u32);

impl Flags {
  pub const SEEN: Flags = Flags(1 << 0);
  pub const ANSWERED: Flags = Flags(1 << 1);
  pub const DELETED: Flags = Flags(1 << 2);
  pub const DRAFT: Flags = Flags(1 << 3);
  pub const FLAGGED: Flags = Flags(1 << 4);
  pub const JUNK: Flags = Flags(1 << 5);
  pub const RECENT: Flags = Flags(1 << 6);
  pub const FOLDER_FLAGGED: Flags = Flags(1 << 7);

  /// The subset of bits a server FLAGS response can set; FOLDER_FLAGGED never travels over the
  /// wire.
  pub const SERVER_MASK: Flags = Flags(
    Self::SEEN.0 | Self::ANSWERED.0 | Self::DELETED.0 | Self::DRAFT.0 | Self::FLAGGED.0 | Self::JUNK.0 | Self::RECENT.0,
  );

  pub fn contains(self, other: Flags) -> bool {
    self.0 & other.0 == other.0
  }

  pub fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub fn masked(self, mask: Flags) -> Flags {
    Flags(self.0 & mask.0)
  }

  pub fn names(self) -> Vec<&'static str> {
    let table: &[(Flags, &str)] = &[
      (Flags::SEEN, "\\Seen"),
      (Flags::ANSWERED, "\\Answered"),
      (Flags::DELETED, "\\Deleted"),
      (Flags::DRAFT, "\\Draft"),
      (Flags::FLAGGED, "\\Flagged"),
      (Flags::JUNK, "\\Junk"),
      (Flags::RECENT, "\\Recent"),
    ];
    table
      .iter()
      .filter(|(flag, _)| self.contains(*flag))
      .map(|(_, name)| *name)
      .collect()
  }

  pub fn from_names<'a>(names: impl Iterator<Item = &'a str>) -> Flags {
    let mut flags = Flags::default();
    for name in names {
      flags = flags
        | match name {
          "\\Seen" => Flags::SEEN,
          "\\Answered" => Flags::ANSWERED,
          "\\Deleted" => Flags::DELETED,
          "\\Draft" => Flags::DRAFT,
          "\\Flagged" => Flags::FLAGGED,
          "\\Junk" => Flags::JUNK,
          "\\Recent" => Flags::RECENT,
          _ => Flags::default(),
        };
    }
    flags
  }
}

impl std::ops::BitOr for Flags {
  type Output = Flags;
  fn bitor(self, rhs: Flags) -> Flags {
    Flags(self.0 | rhs.0)
  }
}

impl std::ops::BitAnd for Flags {
  type Output = Flags;
  fn bitand(self, rhs: Flags) -> Flags {
    Flags(self.0 & rhs.0)
  }
}

impl std::ops::Not for Flags {
  type Output = Flags;
  fn not(self) -> Flags {
    Flags(!self.0)
  }
}

/// Recursive MIME content structure (§3): content-type, transfer-encoding, child parts, and the
/// IMAP `BODY[<part-spec>]` path addressing this node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentStructure {
  pub content_type: String,
  pub subtype: String,
  pub transfer_encoding: String,
  pub part_spec: String,
  pub children: Vec<ContentStructure>,
}

impl ContentStructure {
  pub fn is_multipart(&self) -> bool {
    self.content_type.eq_ignore_ascii_case("multipart")
  }

  /// Whether this structure is known in full, i.e. every leaf has a concrete part-spec. Used by
  /// `get_message` (§4.5.8) to decide whether BODYSTRUCTURE needs to be re-fetched.
  pub fn is_complete(&self) -> bool {
    !self.content_type.is_empty()
  }
}

/// One message in one folder (§3).
#[derive(Debug, Clone)]
pub struct MessageInfo {
  pub uid: Uid,
  pub flags: Flags,
  pub server_flags: Flags,
  pub size: u64,
  /// UTC seconds, parsed from INTERNALDATE.
  pub received: i64,
  pub user_flags: BTreeSet<String>,
  pub structure: Option<ContentStructure>,
  pub dirty: bool,
  pub preview_available: bool,
  pub has_attachments: bool,
}

impl MessageInfo {
  pub fn new(uid: Uid) -> Self {
    Self {
      uid,
      flags: Flags::default(),
      server_flags: Flags::default(),
      size: 0,
      received: 0,
      user_flags: BTreeSet::new(),
      structure: None,
      dirty: false,
      preview_available: false,
      has_attachments: false,
    }
  }

  /// §3 invariant: `flags & SERVER_FLAG_MASK` differs from `server_flags` only when
  /// FOLDER_FLAGGED is also set.
  pub fn invariant_holds(&self) -> bool {
    self.flags.masked(Flags::SERVER_MASK) == self.server_flags || self.flags.contains(Flags::FOLDER_FLAGGED)
  }

  pub fn mark_flags(&mut self, flags: Flags) {
    if self.flags != flags {
      self.flags = flags | (self.flags & Flags::FOLDER_FLAGGED);
      if self.flags.masked(Flags::SERVER_MASK) != self.server_flags {
        self.flags = self.flags | Flags::FOLDER_FLAGGED;
      }
      self.dirty = true;
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
  pub total: u64,
  pub unread: u64,
  pub deleted: u64,
  pub junk: u64,
  pub junk_not_deleted: u64,
  pub visible: u64,
}

impl Counters {
  fn recompute(messages: &[MessageInfo]) -> Self {
    let mut c = Counters::default();
    for m in messages {
      c.total += 1;
      if !m.flags.contains(Flags::SEEN) {
        c.unread += 1;
      }
      if m.flags.contains(Flags::DELETED) {
        c.deleted += 1;
      }
      if m.flags.contains(Flags::JUNK) {
        c.junk += 1;
        if !m.flags.contains(Flags::DELETED) {
          c.junk_not_deleted += 1;
        }
      }
      if !m.flags.contains(Flags::DELETED) && !m.flags.contains(Flags::JUNK) {
        c.visible += 1;
      }
    }
    c
  }
}

/// §4.4: an ordered sequence of `MessageInfo`, 0-based internally, 1-based on the wire.
#[derive(Debug, Default)]
pub struct FolderSummary {
  pub uidvalidity: Option<u32>,
  messages: Vec<MessageInfo>,
  counters: Counters,
}

impl FolderSummary {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn count(&self) -> usize {
    self.messages.len()
  }

  pub fn index(&self, i: usize) -> Option<&MessageInfo> {
    self.messages.get(i)
  }

  pub fn index_mut(&mut self, i: usize) -> Option<&mut MessageInfo> {
    self.messages.get_mut(i)
  }

  pub fn by_uid(&self, uid: &Uid) -> Option<&MessageInfo> {
    self.messages.iter().find(|m| &m.uid == uid)
  }

  pub fn position(&self, uid: &Uid) -> Option<usize> {
    self.messages.iter().position(|m| &m.uid == uid)
  }

  pub fn by_uid_mut(&mut self, uid: &Uid) -> Option<&mut MessageInfo> {
    self.messages.iter_mut().find(|m| &m.uid == uid)
  }

  pub fn iter(&self) -> impl Iterator<Item = &MessageInfo> {
    self.messages.iter()
  }

  pub fn max_uid(&self) -> u32 {
    self.messages.iter().filter_map(|m| m.uid.server()).max().unwrap_or(0)
  }

  pub fn insert(&mut self, message: MessageInfo) {
    self.messages.push(message);
    self.recompute();
  }

  pub fn remove_uid(&mut self, uid: &Uid) -> Option<MessageInfo> {
    let position = self.position(uid)?;
    self.remove_index(position)
  }

  pub fn remove_index(&mut self, i: usize) -> Option<MessageInfo> {
    if i >= self.messages.len() {
      return None;
    }
    let message = self.messages.remove(i);
    self.recompute();
    Some(message)
  }

  pub fn counters(&self) -> Counters {
    self.counters
  }

  fn recompute(&mut self) {
    self.counters = Counters::recompute(&self.messages);
  }

  /// UIDs whose FOLDER_FLAGGED bit is set, i.e. local flag changes not yet pushed (§4.4).
  pub fn changed_set(&self) -> Vec<Uid> {
    self
      .messages
      .iter()
      .filter(|m| m.flags.contains(Flags::FOLDER_FLAGGED))
      .map(|m| m.uid.clone())
      .collect()
  }

  /// Discards every message; used on UIDVALIDITY mismatch (§4.5.1).
  pub fn clear(&mut self) {
    self.messages.clear();
    self.counters = Counters::default();
  }

  pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
    w.write_all(MAGIC).map_err(ImapError::from)?;
    codec::write_u32(w, SCHEMA_VERSION)?;
    codec::write_u32(w, self.uidvalidity.unwrap_or(0))?;
    codec::write_u32(w, self.messages.len() as u32)?;
    for m in &self.messages {
      codec::write_string(w, &m.uid.to_string())?;
      codec::write_u32(w, m.flags.0)?;
      codec::write_u32(w, m.server_flags.0)?;
      codec::write_u64(w, m.size)?;
      codec::write_u64(w, m.received as u64)?;
      codec::write_strings(w, &m.user_flags.iter().cloned().collect::<Vec<_>>())?;
      w.write_all(&[m.dirty as u8, m.preview_available as u8, m.has_attachments as u8])
        .map_err(ImapError::from)?;
    }
    Ok(())
  }

  pub fn read<R: Read>(r: &mut R) -> Result<Self> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(ImapError::from)?;
    if &magic != MAGIC {
      return Err(ImapError::Protocol("bad summary magic".to_string()));
    }
    let version = codec::read_u32(r)?;
    if version != SCHEMA_VERSION {
      return Err(ImapError::Protocol(format!(
        "unsupported summary schema version {version}"
      )));
    }
    let uidvalidity = codec::read_u32(r)?;
    let count = codec::read_u32(r)? as usize;
    let mut summary = FolderSummary {
      uidvalidity: if uidvalidity == 0 { None } else { Some(uidvalidity) },
      messages: Vec::with_capacity(count),
      counters: Counters::default(),
    };
    for _ in 0..count {
      let uid_str = codec::read_string(r)?;
      let uid = if uid_str.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        Uid::Server(uid_str.parse().map_err(|_| ImapError::Protocol("bad uid".to_string()))?)
      } else {
        Uid::Temporary(uid_str)
      };
      let flags = Flags(codec::read_u32(r)?);
      let server_flags = Flags(codec::read_u32(r)?);
      let size = codec::read_u64(r)?;
      let received = codec::read_u64(r)? as i64;
      let user_flags = codec::read_strings(r)?.into_iter().collect();
      let mut bits = [0u8; 3];
      r.read_exact(&mut bits).map_err(ImapError::from)?;
      summary.messages.push(MessageInfo {
        uid,
        flags,
        server_flags,
        size,
        received,
        user_flags,
        structure: None,
        dirty: bits[0] != 0,
        preview_available: bits[1] != 0,
        has_attachments: bits[2] != 0,
      });
    }
    summary.recompute();
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn counters_track_unread_deleted_junk() {
    let mut summary = FolderSummary::new();
    let mut unseen = MessageInfo::new(Uid::Server(1));
    summary.insert(unseen.clone());
    let mut seen = MessageInfo::new(Uid::Server(2));
    seen.flags = Flags::SEEN;
    summary.insert(seen);
    unseen.uid = Uid::Server(3);
    unseen.flags = Flags::DELETED;
    summary.insert(unseen);

    let counters = summary.counters();
    assert_eq!(3, counters.total);
    assert_eq!(2, counters.unread);
    assert_eq!(1, counters.deleted);
    assert_eq!(2, counters.visible);
  }

  #[test]
  fn changed_set_tracks_folder_flagged() {
    let mut summary = FolderSummary::new();
    let mut m = MessageInfo::new(Uid::Server(1));
    m.flags = Flags::SEEN | Flags::FOLDER_FLAGGED;
    summary.insert(m);
    summary.insert(MessageInfo::new(Uid::Server(2)));
    assert_eq!(vec![Uid::Server(1)], summary.changed_set());
  }

  #[test]
  fn invariant_requires_folder_flagged_on_mismatch() {
    let mut m = MessageInfo::new(Uid::Server(1));
    m.flags = Flags::SEEN;
    m.server_flags = Flags::default();
    assert!(!m.invariant_holds());
    m.flags = Flags::SEEN | Flags::FOLDER_FLAGGED;
    assert!(m.invariant_holds());
  }

  #[test]
  fn persistence_round_trips() {
    let mut summary = FolderSummary::new();
    summary.uidvalidity = Some(100);
    let mut m = MessageInfo::new(Uid::Server(17));
    m.flags = Flags::SEEN;
    m.server_flags = Flags::SEEN;
    m.size = 512;
    m.received = 1_700_000_000;
    m.user_flags.insert("work".to_string());
    summary.insert(m);

    let mut buf = Vec::new();
    summary.write(&mut buf).unwrap();
    let restored = FolderSummary::read(&mut Cursor::new(buf)).unwrap();
    assert_eq!(Some(100), restored.uidvalidity);
    assert_eq!(1, restored.count());
    let restored_message = restored.by_uid(&Uid::Server(17)).unwrap();
    assert_eq!(Flags::SEEN, restored_message.flags);
    assert_eq!(512, restored_message.size);
    assert!(restored_message.user_flags.contains("work"));
  }

  #[test]
  fn uidvalidity_change_clears_summary() {
    let mut summary = FolderSummary::new();
    summary.uidvalidity = Some(1);
    summary.insert(MessageInfo::new(Uid::Server(1)));
    summary.clear();
    assert_eq!(0, summary.count());
    assert_eq!(Counters::default(), summary.counters());
  }

  #[test]
  fn flag_names_round_trip() {
    let flags = Flags::SEEN | Flags::FLAGGED;
    let names = flags.names();
    assert_eq!(vec!["\\Seen", "\\Flagged"], names);
    assert_eq!(flags, Flags::from_names(names.into_iter()));
  }
}
