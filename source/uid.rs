use std::{collections, fmt, sync, time};

/// A message identifier: either server-assigned, or a placeholder minted while offline.
///
/// Temporary UIDs are never digit-leading, so a `Uid` parsed off the wire can never collide with
/// one synthesized locally (the wire grammar only ever produces `Server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Uid {
  Server(u32),
  Temporary(String),
}

impl Uid {
  pub fn server(&self) -> Option<u32> {
    match self {
      Uid::Server(n) => Some(*n),
      Uid::Temporary(_) => None,
    }
  }

  pub fn is_temporary(&self) -> bool {
    matches!(self, Uid::Temporary(_))
  }
}

impl fmt::Display for Uid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Uid::Server(n) => write!(f, "{n}"),
      Uid::Temporary(s) => f.write_str(s),
    }
  }
}

static TEMP_COUNTER: sync::atomic::AtomicU64 = sync::atomic::AtomicU64::new(0);

/// Mints a fresh `tempuid-<hex-time>-<counter>`, matching the `§3 UID` grammar: never
/// digit-leading, so it can't be mistaken for a server UID rendered as decimal ASCII.
pub fn temporary() -> Uid {
  let now = time::SystemTime::now()
    .duration_since(time::UNIX_EPOCH)
    .unwrap_or(time::Duration::ZERO)
    .as_secs();
  let counter = TEMP_COUNTER.fetch_add(1, sync::atomic::Ordering::Relaxed);
  Uid::Temporary(format!("tempuid-{now:x}-{counter}"))
}

/// String → string mapping from temporary UIDs to server-assigned UIDs, populated as Journal
/// replay resolves each APPEND/TRANSFER entry.
#[derive(Debug, Default)]
pub struct Remap(collections::HashMap<String, u32>);

impl Remap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, old: &str, new: u32) {
    self.0.insert(old.to_string(), new);
  }

  pub fn lookup(&self, uid: &Uid) -> Option<Uid> {
    match uid {
      Uid::Server(n) => Some(Uid::Server(*n)),
      Uid::Temporary(s) => self.0.get(s).map(|n| Uid::Server(*n)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn temporary_is_never_digit_leading() {
    for _ in 0..4 {
      let uid = temporary();
      match uid {
        Uid::Temporary(s) => assert!(!s.chars().next().unwrap().is_ascii_digit()),
        Uid::Server(_) => panic!("expected a temporary uid"),
      }
    }
  }

  #[test]
  fn remap_resolves_temporary_only() {
    let mut remap = Remap::new();
    let temp = Uid::Temporary("tempuid-abc-0".to_string());
    assert_eq!(None, remap.lookup(&temp));
    remap.add("tempuid-abc-0", 83);
    assert_eq!(Some(Uid::Server(83)), remap.lookup(&temp));
    assert_eq!(Some(Uid::Server(5)), remap.lookup(&Uid::Server(5)));
  }
}
