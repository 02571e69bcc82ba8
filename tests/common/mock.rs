//! A scripted, in-process stream for integration tests: the server's side of the conversation is
//! whatever bytes the test hands in up front, and everything the client writes is captured for
//! later inspection. Stands in for the `dovecot` subprocess the teacher's `tests/common/mod.rs`
//! used to drive, since this crate's surface is a library API rather than a maildir-sync CLI tool.

use std::io::{Cursor, Read, Write};

pub struct Loopback {
  inbound: Cursor<Vec<u8>>,
  pub outbound: Vec<u8>,
}

impl Loopback {
  pub fn new(server_says: &[u8]) -> Self {
    Self {
      inbound: Cursor::new(server_says.to_vec()),
      outbound: Vec::new(),
    }
  }

  pub fn outbound_text(&self) -> String {
    String::from_utf8_lossy(&self.outbound).into_owned()
  }
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

/// A connected, authenticated, namespace-discovered `Store` whose single connection plays back
/// `server_says`. `server_says` must already account for the CAPABILITY/LOGIN/CAPABILITY/NAMESPACE
/// round trip `Store::connect` performs before handing control back, plus whatever the test needs
/// afterwards.
pub fn store(state_root: &std::path::Path, server_says: &[u8]) -> sin::store::Store<Loopback> {
  store_with_exiting(state_root, server_says, sin::config::Exiting::new())
}

/// Like [`store`], but lets the caller keep a handle to the `Exiting` flag it was built with, so a
/// test can flip it to simulate "offline" without severing the underlying stream.
pub fn store_with_exiting(
  state_root: &std::path::Path,
  server_says: &[u8],
  exiting: sin::config::Exiting,
) -> sin::store::Store<Loopback> {
  let connection = sin::connection::Connection::new(Loopback::new(server_says));
  sin::store::Store::connect(
    connection,
    "user",
    "pass",
    state_root.to_path_buf(),
    sin::config::Config::default(),
    exiting,
    std::sync::Arc::new(|| Box::new(sin::session::NullSearchEngine) as Box<dyn sin::session::SearchEngine + Send>),
  )
  .unwrap()
}

/// The CAPABILITY/AUTHENTICATE/CAPABILITY/NAMESPACE round trip `Store::connect` always runs,
/// tagged with `prefix` (§4.2: one letter per `Connection`, assigned from a process-global counter,
/// so a test building more than one `Connection` has to pick the right letter for each).
pub fn connect_handshake(prefix: char) -> String {
  format!(
    concat!(
      "* CAPABILITY IMAP4rev1 NAMESPACE UIDPLUS LITERAL+ AUTH=PLAIN\r\n",
      "{p}00000 OK CAPABILITY completed\r\n",
      "+ \r\n",
      "{p}00001 OK authenticated\r\n",
      "* CAPABILITY IMAP4rev1 NAMESPACE UIDPLUS LITERAL+ AUTH=PLAIN\r\n",
      "{p}00002 OK CAPABILITY completed\r\n",
      "* NAMESPACE ((\"\" \"/\")) NIL NIL\r\n",
      "{p}00003 OK done\r\n",
    ),
    p = prefix
  )
}
