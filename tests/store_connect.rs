//! Drives `Store`/`FolderEngine` end to end against a scripted mock stream: connect, open a
//! folder, rescan it into an empty local summary, then reopen the same state directory and check
//! the summary survived. One `#[test]` per file (see `tests/offline_append_replay.rs`) because
//! `Connection`'s tag prefix is assigned from a process-global counter (§4.2), so every
//! `Connection` built in this file has to be scripted with the letter it will actually get: 'A'
//! for the first one, 'B' for the second.

mod common;

use common::mock;

#[test]
fn connect_open_rescan_and_reopen_keep_the_summary() {
  let dir = tempfile::tempdir().unwrap();
  let script = format!(
    "{}{}",
    mock::connect_handshake('A'),
    concat!(
      // SELECT INBOX
      "* FLAGS (\\Seen \\Deleted)\r\n",
      "* OK [PERMANENTFLAGS (\\Seen \\Deleted \\*)] ok\r\n",
      "* 1 EXISTS\r\n",
      "* OK [UIDVALIDITY 100] ok\r\n",
      "A00004 OK [READ-WRITE] SELECT completed\r\n",
      // UID FETCH 1:* (rescan() defers to fetch_new() on an empty summary)
      "* 1 FETCH (UID 7 FLAGS (\\Seen) INTERNALDATE \"17-Jul-2020 02:44:25 +0000\" RFC822.SIZE 120 BODY[HEADER.FIELDS (DATE)] {0})\r\nA00005 OK done\r\n",
    )
  );
  let mut store = mock::store(dir.path(), script.as_bytes());
  assert_eq!("", store.namespace().prefix);

  let engine = store.open_folder("INBOX").unwrap();
  assert!(!engine.is_read_only());
  assert!(engine.supports_custom_flags());
  assert_eq!(Some(100), engine.summary().uidvalidity);

  let changes = engine.rescan().unwrap();
  assert_eq!(1, changes.added.len());
  assert_eq!(1, changes.recent.len());
  assert_eq!(1, engine.summary().count());

  // A fresh open of the same state directory picks the persisted summary back up without
  // re-fetching anything past what's already known (this script has no FETCH response, so
  // fetch_new() finding nothing new would be the only tolerable outcome besides not calling it).
  drop(store);
  let reopen_script = format!(
    "{}{}",
    mock::connect_handshake('B'),
    concat!(
      "* FLAGS (\\Seen \\Deleted)\r\n",
      "* OK [PERMANENTFLAGS (\\Seen \\Deleted \\*)] ok\r\n",
      "* 1 EXISTS\r\n",
      "* OK [UIDVALIDITY 100] ok\r\n",
      "B00004 OK [READ-WRITE] SELECT completed\r\n",
    )
  );
  let mut reopened = mock::store(dir.path(), reopen_script.as_bytes());
  let engine = reopened.open_folder("INBOX").unwrap();
  assert_eq!(1, engine.summary().count());
  assert_eq!(Some(100), engine.summary().uidvalidity);
}
