//! Journal (§4.6): an append-only log of pending offline operations with a UID remap table,
//! replayed to the server on reconnection.
//!
//! Grounded directly on `camel-imap-journal.c` (entry variants, `uidmap_add`/`lookup`,
//! `close_folders`), re-expressed per DESIGN NOTES §9 as a single-threaded replay owner instead of
//! a re-entrance counter: `replay` takes `&mut self` and simply returns early if re-entered, since
//! only one thread can hold `&mut Journal` at a time.

use crate::codec;
use crate::error::{ImapError, Result};
use crate::uid::{Remap, Uid};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const TAG_EXPUNGE: u32 = 1;
const TAG_APPEND: u32 = 2;
const TAG_TRANSFER: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
  Expunge { uids: Vec<Uid> },
  Append { temp_uid: Uid },
  Transfer {
    destination: String,
    uids: Vec<Uid>,
    delete_originals: bool,
  },
}

fn write_uid<W: Write>(w: &mut W, uid: &Uid) -> Result<()> {
  codec::write_string(w, &uid.to_string())
}

fn read_uid(bytes: &str) -> Uid {
  if bytes.chars().next().is_some_and(|c| c.is_ascii_digit()) {
    bytes.parse().map(Uid::Server).unwrap_or_else(|_| Uid::Temporary(bytes.to_string()))
  } else {
    Uid::Temporary(bytes.to_string())
  }
}

impl Entry {
  fn write<W: Write>(&self, w: &mut W) -> Result<()> {
    match self {
      Entry::Expunge { uids } => {
        codec::write_u32(w, TAG_EXPUNGE)?;
        codec::write_u32(w, uids.len() as u32)?;
        for uid in uids {
          write_uid(w, uid)?;
        }
      }
      Entry::Append { temp_uid } => {
        codec::write_u32(w, TAG_APPEND)?;
        write_uid(w, temp_uid)?;
      }
      Entry::Transfer {
        destination,
        uids,
        delete_originals,
      } => {
        codec::write_u32(w, TAG_TRANSFER)?;
        codec::write_string(w, destination)?;
        codec::write_u32(w, uids.len() as u32)?;
        for uid in uids {
          write_uid(w, uid)?;
        }
        w.write_all(&[*delete_originals as u8]).map_err(ImapError::from)?;
      }
    }
    Ok(())
  }

  fn read<R: std::io::Read>(r: &mut R) -> Result<Self> {
    let tag = codec::read_u32(r)?;
    match tag {
      TAG_EXPUNGE => {
        let n = codec::read_u32(r)? as usize;
        let mut uids = Vec::with_capacity(n);
        for _ in 0..n {
          uids.push(read_uid(&codec::read_string(r)?));
        }
        Ok(Entry::Expunge { uids })
      }
      TAG_APPEND => Ok(Entry::Append {
        temp_uid: read_uid(&codec::read_string(r)?),
      }),
      TAG_TRANSFER => {
        let destination = codec::read_string(r)?;
        let n = codec::read_u32(r)? as usize;
        let mut uids = Vec::with_capacity(n);
        for _ in 0..n {
          uids.push(read_uid(&codec::read_string(r)?));
        }
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag).map_err(ImapError::from)?;
        Ok(Entry::Transfer {
          destination,
          uids,
          delete_originals: flag[0] != 0,
        })
      }
      other => Err(ImapError::Protocol(format!("unknown journal entry tag {other}"))),
    }
  }
}

/// Replay primitives a `FolderEngine` must provide; kept as a trait so `Journal` doesn't need to
/// depend on the engine module (DESIGN NOTES §9).
pub trait ReplayTarget {
  /// Replays one APPEND entry; returns the server-assigned UID on success.
  fn append_resyncing(&mut self, temp_uid: &Uid) -> Result<u32>;
  fn expunge_uids_resyncing(&mut self, uids: &[Uid]) -> Result<()>;
  fn transfer_resyncing(
    &mut self,
    destination: &str,
    uids: &[Uid],
    delete_originals: bool,
    remap: &Remap,
  ) -> Result<()>;
  /// Flushes and releases any destination folders opened while replaying TRANSFER entries.
  fn close_folders(&mut self);
}

#[derive(Debug)]
pub struct Journal {
  path: PathBuf,
  entries: Vec<Entry>,
  remap: Remap,
  replaying: bool,
}

impl Journal {
  pub fn open(path: &Path) -> Result<Self> {
    let entries = match File::open(path) {
      Ok(file) => {
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
          match Entry::read(&mut reader) {
            Ok(entry) => entries.push(entry),
            Err(error) if codec::is_eof(&error) => break,
            Err(error) => return Err(error),
          }
        }
        entries
      }
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
      Err(error) => return Err(ImapError::Cache(error)),
    };
    Ok(Self {
      path: path.to_path_buf(),
      entries,
      remap: Remap::new(),
      replaying: false,
    })
  }

  /// An empty, unbacked stand-in never written to disk: a caller that needs to pull the real
  /// journal out of its owner for the duration of a call (e.g. `Store` driving replay) can leave
  /// one of these in its place instead of leaving the field in a half-moved state.
  pub(crate) fn placeholder() -> Self {
    Self {
      path: PathBuf::new(),
      entries: Vec::new(),
      remap: Remap::new(),
      replaying: false,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  fn persist(&self) -> Result<()> {
    let tmp = self.path.with_extension("tmp");
    {
      let mut writer = BufWriter::new(File::create(&tmp).map_err(ImapError::Cache)?);
      for entry in &self.entries {
        entry.write(&mut writer)?;
      }
      writer.flush().map_err(ImapError::Cache)?;
    }
    fs::rename(&tmp, &self.path).map_err(ImapError::Cache)
  }

  /// Appends `entry`, then immediately flushes (§4.6).
  pub fn log(&mut self, entry: Entry) -> Result<()> {
    self.entries.push(entry);
    self.persist()
  }

  pub fn uidmap_add(&mut self, old: &str, new: u32) {
    self.remap.add(old, new);
  }

  pub fn uidmap_lookup(&self, uid: &Uid) -> Option<Uid> {
    self.remap.lookup(uid)
  }

  pub fn remap(&self) -> &Remap {
    &self.remap
  }

  /// Iterates entries in order, invoking the matching `ReplayTarget` primitive. On success the
  /// entry is dropped from the log; on failure replay stops and the entry (and everything after
  /// it) is left for a later attempt. Guarded against recursive invocation (a flag sync triggered
  /// mid-replay would otherwise re-enter).
  pub fn replay(&mut self, target: &mut impl ReplayTarget) -> Result<()> {
    if self.replaying {
      return Ok(());
    }
    self.replaying = true;
    let result = self.replay_inner(target);
    self.replaying = false;
    target.close_folders();
    result
  }

  fn replay_inner(&mut self, target: &mut impl ReplayTarget) -> Result<()> {
    while let Some(entry) = self.entries.first().cloned() {
      let outcome = match &entry {
        Entry::Expunge { uids } => target.expunge_uids_resyncing(uids),
        Entry::Append { temp_uid } => target.append_resyncing(temp_uid).map(|new_uid| {
          self.remap.add(&temp_uid.to_string(), new_uid);
        }),
        Entry::Transfer {
          destination,
          uids,
          delete_originals,
        } => target.transfer_resyncing(destination, uids, *delete_originals, &self.remap),
      };
      match outcome {
        Ok(()) => {
          self.entries.remove(0);
          self.persist()?;
        }
        Err(error) => return Err(error),
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;

  #[derive(Default)]
  struct Recorder {
    appended: RefCell<Vec<Uid>>,
    expunged: RefCell<Vec<Vec<Uid>>>,
    transferred: RefCell<Vec<(String, Vec<Uid>, bool)>>,
    fail_next: bool,
    closed: RefCell<bool>,
  }

  impl ReplayTarget for Recorder {
    fn append_resyncing(&mut self, temp_uid: &Uid) -> Result<u32> {
      if self.fail_next {
        return Err(ImapError::Logical("boom".to_string()));
      }
      self.appended.borrow_mut().push(temp_uid.clone());
      Ok(83)
    }

    fn expunge_uids_resyncing(&mut self, uids: &[Uid]) -> Result<()> {
      self.expunged.borrow_mut().push(uids.to_vec());
      Ok(())
    }

    fn transfer_resyncing(
      &mut self,
      destination: &str,
      uids: &[Uid],
      delete_originals: bool,
      _remap: &Remap,
    ) -> Result<()> {
      self
        .transferred
        .borrow_mut()
        .push((destination.to_string(), uids.to_vec(), delete_originals));
      Ok(())
    }

    fn close_folders(&mut self) {
      *self.closed.borrow_mut() = true;
    }
  }

  #[test]
  fn log_persists_and_reopen_restores_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal");
    {
      let mut journal = Journal::open(&path).unwrap();
      journal.log(Entry::Expunge { uids: vec![Uid::Server(17)] }).unwrap();
      journal
        .log(Entry::Append {
          temp_uid: Uid::Temporary("tempuid-abc-0".to_string()),
        })
        .unwrap();
    }
    let reopened = Journal::open(&path).unwrap();
    assert_eq!(2, reopened.len());
  }

  #[test]
  fn replay_removes_entries_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal");
    let mut journal = Journal::open(&path).unwrap();
    let temp = Uid::Temporary("tempuid-abc-0".to_string());
    journal.log(Entry::Append { temp_uid: temp.clone() }).unwrap();
    journal.log(Entry::Expunge { uids: vec![Uid::Server(5)] }).unwrap();

    let mut recorder = Recorder::default();
    journal.replay(&mut recorder).unwrap();
    assert!(journal.is_empty());
    assert_eq!(vec![temp], *recorder.appended.borrow());
    assert_eq!(Some(Uid::Server(83)), journal.uidmap_lookup(&Uid::Temporary("tempuid-abc-0".to_string())));
    assert!(*recorder.closed.borrow());
  }

  #[test]
  fn replay_stops_on_failure_and_preserves_remaining_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal");
    let mut journal = Journal::open(&path).unwrap();
    journal
      .log(Entry::Append {
        temp_uid: Uid::Temporary("tempuid-abc-0".to_string()),
      })
      .unwrap();
    journal.log(Entry::Expunge { uids: vec![Uid::Server(5)] }).unwrap();

    let mut recorder = Recorder {
      fail_next: true,
      ..Recorder::default()
    };
    assert!(journal.replay(&mut recorder).is_err());
    assert_eq!(2, journal.len());
  }

  #[test]
  fn replay_is_guarded_against_reentrance() {
    // A flag sync triggered mid-replay would call back into replay() while `replaying` is still
    // set; build that state directly (same-module field access) rather than simulating the
    // reentrant call stack, and check the guard short-circuits to Ok(()) without touching target.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal");
    let mut journal = Journal::open(&path).unwrap();
    journal
      .log(Entry::Append {
        temp_uid: Uid::Temporary("tempuid-abc-0".to_string()),
      })
      .unwrap();
    journal.replaying = true;

    let mut recorder = Recorder::default();
    assert!(journal.replay(&mut recorder).is_ok());
    assert!(recorder.appended.borrow().is_empty());
    assert_eq!(1, journal.len());
  }
}
