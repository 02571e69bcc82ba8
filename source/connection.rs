//! Connection (§4.2): tag formation, the recursive command lock, capability tracking, and the
//! greeting/STARTTLS/AUTHENTICATE handshake.
//!
//! Grounded on `source/imap.rs`'s `Stream<RW>` for the byte-level plumbing (superseded here by
//! `crate::wire::Reader`) and on `camel-imap-command.c`'s recursive lock semantics, tag format and
//! password masking; the greeting/authenticate sequencing follows
//! `kevinboulain-sin/source/sync/mod.rs`'s `greetings()`/`authenticate()`. The lock itself is
//! re-expressed per DESIGN NOTES §9 as an explicit `CommandGuard` (RAII, one release per guard)
//! instead of a count tied to "when the response is freed".

use crate::error::{ImapError, Result};
use crate::wire::{self, Arg, Line};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);

impl Capabilities {
  pub const IMAP4: Capabilities = Capabilities(1 << 0);
  pub const IMAP4REV1: Capabilities = Capabilities(1 << 1);
  pub const STATUS: Capabilities = Capabilities(1 << 2);
  pub const NAMESPACE: Capabilities = Capabilities(1 << 3);
  pub const UIDPLUS: Capabilities = Capabilities(1 << 4);
  pub const LITERAL_PLUS: Capabilities = Capabilities(1 << 5);
  pub const STARTTLS: Capabilities = Capabilities(1 << 6);
  pub const AUTH_PLAIN: Capabilities = Capabilities(1 << 7);
  pub const LOGINDISABLED: Capabilities = Capabilities(1 << 8);
  pub const QUOTA: Capabilities = Capabilities(1 << 9);
  /// Quirk: server accepts `UID XGWMOVE <set> <folder>` (a GMX/1&1 extension).
  pub const XGWMOVE: Capabilities = Capabilities(1 << 10);

  fn none() -> Self {
    Capabilities(0)
  }

  pub fn contains(self, flag: Capabilities) -> bool {
    self.0 & flag.0 == flag.0
  }

  fn insert(&mut self, flag: Capabilities) {
    self.0 |= flag.0;
  }

  fn from_token(token: &str) -> Option<Capabilities> {
    match token.to_ascii_uppercase().as_str() {
      "IMAP4" => Some(Capabilities::IMAP4),
      "IMAP4REV1" => Some(Capabilities::IMAP4REV1),
      "STATUS" => Some(Capabilities::STATUS),
      "NAMESPACE" => Some(Capabilities::NAMESPACE),
      "UIDPLUS" => Some(Capabilities::UIDPLUS),
      "LITERAL+" => Some(Capabilities::LITERAL_PLUS),
      "STARTTLS" => Some(Capabilities::STARTTLS),
      "AUTH=PLAIN" => Some(Capabilities::AUTH_PLAIN),
      "LOGINDISABLED" => Some(Capabilities::LOGINDISABLED),
      "QUOTA" => Some(Capabilities::QUOTA),
      "XGWMOVE" => Some(Capabilities::XGWMOVE),
      _ => None,
    }
  }

  fn parse(text: &str) -> Self {
    let mut caps = Capabilities::none();
    for token in text.split_ascii_whitespace() {
      if let Some(flag) = Capabilities::from_token(token) {
        caps.insert(flag);
      }
    }
    caps
  }
}

/// What the server said in its greeting line (§4.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
  Ok,
  Preauth,
  Refused,
}

/// One accumulated response: the untagged lines gathered while the tag was pending, and the final
/// tagged status. Owns one level of the command lock; dropping it releases that level (the
/// `CommandGuard` re-expression of "freeing the response unlocks" from §4.2).
#[derive(Debug)]
pub struct Response {
  pub untagged: Vec<Vec<u8>>,
  pub status: wire::Status,
  pub text: String,
  guard: Option<CommandGuard>,
}

impl Response {
  pub fn ok(&self) -> Result<()> {
    match self.status {
      wire::Status::Ok => Ok(()),
      wire::Status::No => Err(ImapError::ServerRefused {
        status: crate::error::Status::No,
        reason: self.text.clone(),
      }),
      wire::Status::Bad => Err(ImapError::ServerRefused {
        status: crate::error::Status::Bad,
        reason: self.text.clone(),
      }),
    }
  }

  /// Pulls the first untagged line whose first space-delimited token (case-insensitively) equals
  /// `atom`, leaving the rest (§4.2 `extract`).
  pub fn extract(&mut self, atom: &str) -> Option<Vec<u8>> {
    let pos = self.untagged.iter().position(|line| {
      line
        .split(|&b| b == b' ')
        .next()
        .is_some_and(|token| token.eq_ignore_ascii_case(atom.as_bytes()))
    })?;
    Some(self.untagged.remove(pos))
  }
}

#[derive(Debug, Default)]
struct LockState {
  holder: Option<ThreadId>,
  depth: u32,
}

/// A hand-rolled recursive lock (§5.1): held by thread id plus a depth counter, rather than a
/// third-party reentrant-mutex crate, because the guard it hands out must outlive the stack frame
/// that acquired it (transferred into a caller-owned `Response`) — something a borrowed
/// `parking_lot::ReentrantMutex` guard can't do.
#[derive(Debug, Default)]
struct CommandLock {
  state: Mutex<LockState>,
  condvar: Condvar,
}

impl CommandLock {
  fn acquire(self: &Arc<Self>) -> CommandGuard {
    let me = std::thread::current().id();
    let mut state = self.state.lock().unwrap();
    loop {
      match state.holder {
        None => {
          state.holder = Some(me);
          state.depth = 1;
          break;
        }
        Some(holder) if holder == me => {
          state.depth += 1;
          break;
        }
        Some(_) => {
          state = self.condvar.wait(state).unwrap();
        }
      }
    }
    drop(state);
    CommandGuard { lock: self.clone() }
  }

  fn depth(&self) -> u32 {
    self.state.lock().unwrap().depth
  }
}

/// RAII guard over one level of the recursive command lock. `Connection::send_command` transfers
/// ownership of a freshly-acquired guard into the returned `Response`; dropping the `Response`
/// drops the guard, releasing that level. Chained/nested commands (e.g. an implicit SELECT before
/// the user's command) acquire an additional guard explicitly and drop it before returning.
/// `CommandGuard::drop` decrements depth and, at zero, clears the holder and notifies waiters
/// (§5.1).
#[derive(Debug)]
struct CommandGuard {
  lock: Arc<CommandLock>,
}

impl Drop for CommandGuard {
  fn drop(&mut self) {
    let mut state = self.lock.state.lock().unwrap();
    state.depth -= 1;
    if state.depth == 0 {
      state.holder = None;
      self.lock.condvar.notify_one();
    }
  }
}

/// A single IMAP connection: the wire reader/writer, tag counter, capability set, and the
/// currently selected folder (§4.2).
pub struct Connection<RW> {
  reader: wire::Reader<RW>,
  prefix: char,
  counter: AtomicU32,
  lock: Arc<CommandLock>,
  capabilities: Capabilities,
  connected: bool,
  preauthed: bool,
  selected: Option<String>,
  alerts_seen: HashSet<String>,
  literal_plus: bool,
}

static NEXT_PREFIX: AtomicU32 = AtomicU32::new(0);

fn next_prefix() -> char {
  let n = NEXT_PREFIX.fetch_add(1, Ordering::Relaxed);
  (b'A' + (n % 26) as u8) as char
}

impl<RW> Connection<RW>
where
  RW: Read + Write,
{
  pub fn new(rw: RW) -> Self {
    Self {
      reader: wire::Reader::new(rw),
      prefix: next_prefix(),
      counter: AtomicU32::new(0),
      lock: Arc::new(CommandLock::default()),
      capabilities: Capabilities::none(),
      connected: true,
      preauthed: false,
      selected: None,
      alerts_seen: HashSet::new(),
      literal_plus: false,
    }
  }

  pub fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  pub fn is_connected(&self) -> bool {
    self.connected
  }

  pub fn is_preauthed(&self) -> bool {
    self.preauthed
  }

  pub fn selected_folder(&self) -> Option<&str> {
    self.selected.as_deref()
  }

  fn next_tag(&self) -> String {
    let n = self.counter.fetch_add(1, Ordering::Relaxed) % 100_000;
    format!("{}{:05}", self.prefix, n)
  }

  /// Reads and classifies the server greeting (§4.2.1). Must be the first call on a freshly
  /// opened `Connection`.
  pub fn greeting(&mut self) -> Result<Greeting> {
    match self.reader.next_line()? {
      Line::Untagged(bytes) => {
        let text = String::from_utf8_lossy(&bytes);
        let upper = text.to_ascii_uppercase();
        if upper.starts_with("BYE") {
          self.connected = false;
          Ok(Greeting::Refused)
        } else if upper.starts_with("PREAUTH") {
          self.preauthed = true;
          Ok(Greeting::Preauth)
        } else if upper.starts_with("OK") {
          Ok(Greeting::Ok)
        } else {
          Err(ImapError::Protocol(format!("unexpected greeting: {text}")))
        }
      }
      other => Err(ImapError::Protocol(format!("unexpected greeting line: {other:?}"))),
    }
  }

  /// Masks `LOGIN`/`AUTHENTICATE PLAIN` credential material before a formatted command line is
  /// written to the trace log (§4.2 "Password masking"). Three forms: a quoted string, a literal
  /// header (data follows separately and is never logged), and a bare atom.
  fn trace_command(tag: &str, line: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) {
      return;
    }
    let text = String::from_utf8_lossy(line);
    let masked = if text.to_ascii_uppercase().starts_with("LOGIN") {
      mask_login_line(&text)
    } else {
      text.into_owned()
    };
    log::trace!("{tag} {masked}");
  }

  fn selected_folder_is(&self, folder: &str) -> bool {
    self.selected.as_deref() == Some(folder)
  }

  /// §4.2 `send_command`: acquires the lock (recursively selecting `folder` first if it isn't
  /// already selected), writes the tagged command, and reads through to the tagged response,
  /// accumulating every untagged line along the way. The returned `Response` owns one lock level.
  pub fn send_command(&mut self, folder: Option<&str>, fmt: &str, args: &[Arg<'_>]) -> Result<Response> {
    let outer_guard = self.lock.acquire();
    if let Some(folder) = folder {
      if !self.selected_folder_is(folder) {
        self.select_locked(folder)?;
      }
    }
    let guard = self.lock.acquire();
    let result = self.run_command(fmt, args);
    drop(outer_guard);
    let response = result?;
    Ok(Response { guard: Some(guard), ..response })
  }

  /// §4.2 `send_command_start`: writes the command and returns as soon as it's on the wire,
  /// leaving one lock level held for the caller to drain via `next_response`.
  pub fn send_command_start(&mut self, folder: Option<&str>, fmt: &str, args: &[Arg<'_>]) -> Result<CommandHandle> {
    let outer_guard = self.lock.acquire();
    if let Some(folder) = folder {
      if !self.selected_folder_is(folder) {
        self.select_locked(folder)?;
      }
    }
    let guard = self.lock.acquire();
    let tag = self.next_tag();
    let command = wire::format_command(fmt, args, self.literal_plus);
    Self::trace_command(&tag, &command);
    let mut line = format!("{tag} ").into_bytes();
    line.extend_from_slice(&command);
    line.extend_from_slice(b"\r\n");
    let write_result = self.reader.write_all(&line);
    drop(outer_guard);
    write_result?;
    Ok(CommandHandle { tag, guard: Some(guard) })
  }

  /// Runs `fmt`/`args` to completion under a lock level already held by the caller, returning the
  /// accumulated response (without its own guard; the caller attaches one).
  fn run_command(&mut self, fmt: &str, args: &[Arg<'_>]) -> Result<Response> {
    let tag = self.next_tag();
    let command = wire::format_command(fmt, args, self.literal_plus);
    Self::trace_command(&tag, &command);
    let mut line = format!("{tag} ").into_bytes();
    line.extend_from_slice(&command);
    line.extend_from_slice(b"\r\n");
    if let Err(error) = self.reader.write_all(&line) {
      self.connected = false;
      return Err(error);
    }
    self.read_until_tagged(&tag)
  }

  fn read_until_tagged(&mut self, tag: &str) -> Result<Response> {
    let mut untagged = Vec::new();
    loop {
      let line = match self.reader.next_line() {
        Ok(line) => line,
        Err(error) => {
          self.connected = false;
          return Err(error);
        }
      };
      match line {
        Line::Untagged(bytes) => {
          if bytes.to_ascii_uppercase().starts_with(b"BYE") {
            self.connected = false;
          }
          self.note_alert(&bytes);
          untagged.push(bytes);
        }
        Line::Continuation(_) => {
          // A command that expects a continuation must drive it via `send_command_start` +
          // `send_continuation`; seeing one here means the caller used the wrong entry point.
          return Err(ImapError::Protocol("unexpected continuation".to_string()));
        }
        Line::Tagged { tag: got, status, text } => {
          if got != tag {
            return Err(ImapError::Protocol(format!("tag mismatch: expected {tag}, got {got}")));
          }
          return Ok(Response {
            untagged,
            status,
            text,
            guard: None,
          });
        }
      }
    }
  }

  fn note_alert(&mut self, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    if let Some(rest) = text.strip_prefix("OK [ALERT] ").or_else(|| text.strip_prefix("[ALERT] ")) {
      self.alerts_seen.insert(rest.to_string());
    }
  }

  /// Drains the previously delivered alerts (each reported to the caller exactly once).
  pub fn take_alerts(&mut self) -> Vec<String> {
    self.alerts_seen.drain().collect()
  }

  fn select_locked(&mut self, folder: &str) -> Result<()> {
    let response = self.run_command("SELECT %F", &[Arg::Folder(folder)])?;
    response.ok()?;
    self.selected = Some(folder.to_string());
    Ok(())
  }

  /// Explicitly SELECTs `folder`, regardless of what's currently selected, and returns the full
  /// response so the caller can read FLAGS/PERMANENTFLAGS/EXISTS/UIDVALIDITY/UIDNEXT (§4.5.1). A
  /// plain `send_command(Some(folder), ...)` can't be used for this: it only auto-selects when the
  /// folder isn't already selected, silently discarding the SELECT response.
  pub fn select(&mut self, folder: &str) -> Result<Response> {
    let outer_guard = self.lock.acquire();
    let guard = self.lock.acquire();
    let result = self.run_command("SELECT %F", &[Arg::Folder(folder)]);
    drop(outer_guard);
    let response = result?;
    response.ok()?;
    self.selected = Some(folder.to_string());
    Ok(Response { guard: Some(guard), ..response })
  }

  /// §4.2 `send_continuation`: sends literal bytes after a `+` continuation, under a lock already
  /// held by an in-progress `send_command_start`.
  pub fn send_continuation(&mut self, handle: &mut CommandHandle, bytes: &[u8]) -> Result<()> {
    let mut payload = bytes.to_vec();
    payload.extend_from_slice(b"\r\n");
    if let Err(error) = self.reader.write_all(&payload) {
      self.connected = false;
      return Err(error);
    }
    let _ = handle;
    Ok(())
  }

  /// §4.2 `next_response`: advances one streamed response line. Releases one lock level on
  /// `TAGGED`/error.
  pub fn next_response(&mut self, handle: &mut CommandHandle) -> Result<StreamedLine> {
    let line = match self.reader.next_line() {
      Ok(line) => line,
      Err(error) => {
        self.connected = false;
        handle.guard.take();
        return Err(error);
      }
    };
    match line {
      Line::Untagged(bytes) => {
        if bytes.to_ascii_uppercase().starts_with(b"BYE") {
          self.connected = false;
        }
        self.note_alert(&bytes);
        Ok(StreamedLine::Untagged(bytes))
      }
      Line::Continuation(text) => Ok(StreamedLine::Continuation(text)),
      Line::Tagged { tag, status, text } => {
        if tag != handle.tag {
          handle.guard.take();
          return Err(ImapError::Protocol(format!(
            "tag mismatch: expected {}, got {tag}",
            handle.tag
          )));
        }
        handle.guard.take();
        Ok(StreamedLine::Tagged { status, text })
      }
    }
  }

  /// Runs CAPABILITY and replaces the tracked capability set. Called after greeting and again
  /// after STARTTLS, since a pre-STARTTLS CAPABILITY response must not be trusted (RFC 3501
  /// §6.2.1, §4.2.1).
  pub fn refresh_capabilities(&mut self) -> Result<()> {
    let mut response = self.send_command(None, "CAPABILITY", &[])?;
    response.ok()?;
    let line = response
      .extract("CAPABILITY")
      .ok_or_else(|| ImapError::Protocol("no CAPABILITY response".to_string()))?;
    self.capabilities = Capabilities::parse(&String::from_utf8_lossy(&line));
    self.literal_plus = self.capabilities.contains(Capabilities::LITERAL_PLUS);
    Ok(())
  }

  /// §4.2.1 STARTTLS upgrade: issues `STARTTLS`, and on tagged OK hands the caller back the raw
  /// stream so it can be wrapped in a TLS session and a fresh `Connection` built over it (since
  /// `RW` doesn't know how to upgrade itself in place, unlike the self-referential `ouroboros`
  /// stream the teacher used for its concrete TLS type).
  pub fn starttls(mut self) -> Result<RW> {
    let response = self.send_command(None, "STARTTLS", &[])?;
    response.ok()?;
    Ok(self.reader.into_inner())
  }

  /// §4.2.1 `AUTHENTICATE PLAIN` / `LOGIN` fallback.
  pub fn authenticate(&mut self, user: &str, pass: &str) -> Result<()> {
    if self.capabilities.contains(Capabilities::AUTH_PLAIN)
      && !self.capabilities.contains(Capabilities::LOGINDISABLED)
    {
      let sasl = format!("\0{user}\0{pass}");
      let mut handle = self.send_command_start(None, "AUTHENTICATE PLAIN", &[])?;
      loop {
        match self.next_response(&mut handle)? {
          StreamedLine::Continuation(_) => {
            use base64::Engine as _;
            let encoded = base64::engine::general_purpose::STANDARD.encode(sasl.as_bytes());
            self.send_continuation(&mut handle, encoded.as_bytes())?;
          }
          StreamedLine::Untagged(_) => continue,
          StreamedLine::Tagged { status, text } => {
            return match status {
              wire::Status::Ok => Ok(()),
              _ => Err(ImapError::Auth(text)),
            };
          }
        }
      }
    } else {
      let response = self.send_command(None, "LOGIN %S %S", &[Arg::String(user), Arg::String(pass)])?;
      response.ok().map_err(|error| match error {
        ImapError::ServerRefused { reason, .. } => ImapError::Auth(reason),
        other => other,
      })
    }
  }
}

#[derive(Debug)]
pub enum StreamedLine {
  Untagged(Vec<u8>),
  Continuation(String),
  Tagged { status: wire::Status, text: String },
}

/// A command in progress, as returned by `send_command_start`. Holds one lock level until a
/// `Tagged` response (or error) is observed via `next_response`.
#[derive(Debug)]
pub struct CommandHandle {
  tag: String,
  guard: Option<CommandGuard>,
}

impl CommandHandle {
  pub fn tag(&self) -> &str {
    &self.tag
  }
}

/// Covers the three forms a credential can take on the wire: a quoted string, a literal header
/// (the literal bytes themselves arrive on a following line and are never traced), and a bare atom
/// password.
fn mask_login_line(text: &str) -> String {
  let mut tokens = text.splitn(2, ' ');
  let _login = tokens.next();
  match tokens.next() {
    Some(rest) if rest.starts_with('"') => "LOGIN \"<redacted>\" \"<redacted>\"".to_string(),
    Some(rest) if rest.contains('{') => "LOGIN <redacted literal>".to_string(),
    Some(_) => "LOGIN <redacted> <redacted>".to_string(),
    None => "LOGIN".to_string(),
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

  fn connection(server_says: &[u8]) -> Connection<Loopback> {
    Connection::new(Loopback {
      inbound: Cursor::new(server_says.to_vec()),
      outbound: Vec::new(),
    })
  }

  #[test]
  fn greeting_classifies_ok_preauth_bye() {
    assert_eq!(Greeting::Ok, connection(b"* OK ready\r\n").greeting().unwrap());
    assert_eq!(Greeting::Preauth, connection(b"* PREAUTH already\r\n").greeting().unwrap());
    assert_eq!(Greeting::Refused, connection(b"* BYE go away\r\n").greeting().unwrap());
  }

  #[test]
  fn tags_are_one_letter_prefix_and_five_digit_counter() {
    let mut conn = connection(b"A00000 OK done\r\n");
    let tag = conn.next_tag();
    assert_eq!(6, tag.len());
    assert!(tag.chars().next().unwrap().is_ascii_uppercase());
    assert!(tag[1..].chars().all(|c| c.is_ascii_digit()));
  }

  #[test]
  fn send_command_reads_through_to_tagged_response() {
    let mut conn = connection(b"* 2 EXISTS\r\nA00000 OK done\r\n");
    let response = conn.send_command(None, "NOOP", &[]).unwrap();
    assert_eq!(vec![b"2 EXISTS".to_vec()], response.untagged);
    assert_eq!(wire::Status::Ok, response.status);
  }

  #[test]
  fn send_command_rejects_server_no_as_server_refused() {
    let mut conn = connection(b"A00000 NO mailbox doesn't exist\r\n");
    let response = conn.send_command(None, "SELECT missing", &[]).unwrap();
    let error = response.ok().unwrap_err();
    assert!(matches!(
      error,
      ImapError::ServerRefused { status: crate::error::Status::No, .. }
    ));
  }

  #[test]
  fn command_guard_releases_lock_level_on_drop() {
    let mut conn = connection(b"A00000 OK done\r\n");
    assert_eq!(0, conn.lock.depth());
    let response = conn.send_command(None, "NOOP", &[]).unwrap();
    assert_eq!(1, conn.lock.depth());
    drop(response);
    assert_eq!(0, conn.lock.depth());
  }

  #[test]
  fn capability_parsing_recognizes_known_tokens() {
    let caps = Capabilities::parse("CAPABILITY IMAP4rev1 UIDPLUS LITERAL+ XGWMOVE UNKNOWNX");
    assert!(caps.contains(Capabilities::IMAP4REV1));
    assert!(caps.contains(Capabilities::UIDPLUS));
    assert!(caps.contains(Capabilities::LITERAL_PLUS));
    assert!(caps.contains(Capabilities::XGWMOVE));
    assert!(!caps.contains(Capabilities::QUOTA));
  }

  #[test]
  fn login_line_is_masked_in_all_three_forms() {
    assert_eq!(
      "LOGIN \"<redacted>\" \"<redacted>\"",
      mask_login_line("LOGIN \"alice\" \"hunter2\"")
    );
    assert_eq!("LOGIN <redacted literal>", mask_login_line("LOGIN {5}\r\nalice"));
    assert_eq!("LOGIN <redacted> <redacted>", mask_login_line("LOGIN alice hunter2"));
  }

  #[test]
  fn extract_pulls_matching_untagged_line_case_insensitively() {
    let mut response = Response {
      untagged: vec![b"capability IMAP4rev1 UIDPLUS".to_vec(), b"2 EXISTS".to_vec()],
      status: wire::Status::Ok,
      text: "done".to_string(),
      guard: None,
    };
    let line = response.extract("CAPABILITY").unwrap();
    assert_eq!(b"capability IMAP4rev1 UIDPLUS".to_vec(), line);
    assert_eq!(1, response.untagged.len());
  }
}
