//! An APPEND issued while `Exiting` is set goes to the journal instead of the wire; once the flag
//! clears, `Store::replay_folder` drains it by running the real APPEND and remapping the temporary
//! UID to the server-assigned one. One `#[test]` per file — see `tests/store_connect.rs` for why.

mod common;

use common::mock;
use sin::config::Exiting;
use sin::summary::Flags;

#[test]
fn offline_append_is_journaled_then_replayed_on_reconnect() {
  let dir = tempfile::tempdir().unwrap();
  let script = format!(
    "{}{}",
    mock::connect_handshake('A'),
    concat!(
      // SELECT INBOX
      "* FLAGS (\\Seen)\r\n",
      "* 0 EXISTS\r\n",
      "* OK [UIDVALIDITY 1] ok\r\n",
      "A00004 OK [READ-WRITE] SELECT completed\r\n",
      // APPEND, issued later by the journal replay
      "A00005 OK [APPENDUID 1 9] APPEND completed\r\n",
    )
  );
  let exiting = Exiting::new();
  let mut store = mock::store_with_exiting(dir.path(), script.as_bytes(), exiting.clone());

  exiting.set();
  let engine = store.open_folder("INBOX").unwrap();
  let temp_uid = engine.append(b"Subject: hi\r\n\r\nbody", Flags::default(), &[]).unwrap();
  assert!(temp_uid.is_temporary());
  assert!(!engine.journal().is_empty());
  assert_eq!(1, engine.summary().count());

  exiting.clear();
  store.replay_folder("INBOX").unwrap();

  let engine = store.open_folder("INBOX").unwrap();
  assert!(engine.journal().is_empty());
  assert_eq!(1, engine.summary().count());
  assert!(engine.summary().by_uid(&sin::uid::Uid::Server(9)).is_some());
}
