use std::env;

/// Headers `fetch_new`'s phase-1 `BODY.PEEK[HEADER.FIELDS (...)]` always asks for, per §4.5.3.
/// `X-CALENDAR-ATTACHMENT` is non-standard but kept as a default; see DESIGN.md's Open Question 2.
pub const DEFAULT_HEADERS: &[&str] = &[
  "DATE",
  "FROM",
  "TO",
  "CC",
  "SUBJECT",
  "REFERENCES",
  "IN-REPLY-TO",
  "MESSAGE-ID",
  "MIME-VERSION",
  "CONTENT-TYPE",
  "CONTENT-CLASS",
  "X-CALENDAR-ATTACHMENT",
];

pub const MAILING_LIST_HEADERS: &[&str] = &[
  "LIST-ID",
  "LIST-POST",
  "LIST-SUBSCRIBE",
  "LIST-UNSUBSCRIBE",
  "LIST-ARCHIVE",
  "LIST-HELP",
  "LIST-OWNER",
];

/// Process-wide immutable configuration, constructed once and handed by reference into every
/// `Connection`/`FolderEngine` this process creates. Replaces the source's global verbose-debug
/// flag and global tag-prefix counter (DESIGN NOTES §9).
#[derive(Debug, Clone)]
pub struct Config {
  /// Size, in bytes, under which `get_message` always fetches the whole body rather than building
  /// a lazy MIME tree (§4.5.8). 5120 in the source; tunable (DESIGN.md Open Question 3).
  pub small_message_bytes: u64,
  /// Byte budget for one encoded UID set (§4.1). 768 in the source; tunable (Open Question 4).
  pub uid_set_byte_limit: usize,
  /// Extra headers appended to `DEFAULT_HEADERS` by the embedder.
  pub extra_headers: Vec<String>,
  /// Whether the mailing-list header set is requested alongside `DEFAULT_HEADERS`.
  pub mailing_list_headers: bool,
  /// Forces the brain-damaged-server workaround (whole-body fetch only) regardless of what the
  /// server otherwise looks capable of. Mirrors `CAMEL_IMAP_BRAINDAMAGED` (§3.1, renamed).
  pub braindamaged: bool,
  /// When `false` (the default, i.e. `IMAP_CORE_FILTER_RECENT` unset), every newly fetched
  /// message in `fetch_new` is treated as recent even without the server's RECENT flag. Setting
  /// the env var to anything turns filtering on, requiring the server's actual flag. Mirrors
  /// `FILTER_RECENT` (§6/§3.1, renamed): the original only filters when the variable is *set*.
  pub filter_recent: bool,
  /// Verbose/debug trace, read by the wire layer to decide whether to summarize or fully log
  /// outgoing/incoming bytes.
  pub verbose: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      small_message_bytes: 5120,
      uid_set_byte_limit: 768,
      extra_headers: Vec::new(),
      mailing_list_headers: false,
      braindamaged: env::var_os("IMAP_CORE_BRAINDAMAGED").is_some(),
      // Absence means "announce everything as recent"; the variable only needs to be present to
      // turn filtering on, matching `getenv("FILTER_RECENT") == NULL` in the original.
      filter_recent: env::var_os("IMAP_CORE_FILTER_RECENT").is_some(),
      verbose: false,
    }
  }
}

impl Config {
  /// The full header set phase-1 fetch requests, in wire order.
  pub fn header_set(&self) -> Vec<&str> {
    let mut headers: Vec<&str> = DEFAULT_HEADERS.to_vec();
    if self.mailing_list_headers {
      headers.extend_from_slice(MAILING_LIST_HEADERS);
    }
    headers.extend(self.extra_headers.iter().map(String::as_str));
    headers
  }
}

/// Process-wide "exiting" flag (§5): a single shared bit that lets a long rescan or fetch abort
/// promptly at shutdown. Distinct from a per-operation cancellation token — this one is derived
/// by a `Store` and handed down so every background operation it starts observes the same signal.
#[derive(Debug, Clone, Default)]
pub struct Exiting(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl Exiting {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self) {
    self.0.store(true, std::sync::atomic::Ordering::SeqCst);
  }

  /// Unsets the flag, e.g. after a successful reconnect (§4.6 Journal replay).
  pub fn clear(&self) {
    self.0.store(false, std::sync::atomic::Ordering::SeqCst);
  }

  pub fn is_set(&self) -> bool {
    self.0.load(std::sync::atomic::Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_set_appends_in_order() {
    let config = Config {
      mailing_list_headers: true,
      extra_headers: vec!["X-CUSTOM".to_string()],
      ..Config::default()
    };
    let headers = config.header_set();
    assert_eq!(headers.first(), Some(&"DATE"));
    assert!(headers.contains(&"LIST-ID"));
    assert_eq!(headers.last(), Some(&"X-CUSTOM"));
  }

  #[test]
  fn exiting_flag_is_shared() {
    let exiting = Exiting::new();
    let clone = exiting.clone();
    assert!(!clone.is_set());
    exiting.set();
    assert!(clone.is_set());
    exiting.clear();
    assert!(!clone.is_set());
  }
}
