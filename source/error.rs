use std::{io, result};

/// Status word on a tagged IMAP response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  No,
  Bad,
}

impl std::fmt::Display for Status {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Status::No => "NO",
      Status::Bad => "BAD",
    })
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ImapError {
  #[error("service unavailable: {0}")]
  Transport(#[source] io::Error),
  #[error("protocol error: {0}")]
  Protocol(String),
  #[error("IMAP command failed: {reason}")]
  ServerRefused { status: Status, reason: String },
  #[error("authentication failed: {0}")]
  Auth(String),
  #[error("UIDVALIDITY changed for {folder}")]
  UidValidityChanged { folder: String },
  #[error("operation cancelled")]
  Cancelled,
  #[error("cache I/O error: {0}")]
  Cache(#[source] io::Error),
  #[error("logical error: {0}")]
  Logical(String),
}

impl From<io::Error> for ImapError {
  fn from(error: io::Error) -> Self {
    ImapError::Transport(error)
  }
}

pub type Result<T> = result::Result<T, ImapError>;
