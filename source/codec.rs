//! Small binary encoding helpers shared by `summary` and `journal`: length-prefixed strings and
//! length-prefixed arrays of strings, matching the convention `camel-imap-journal.c`'s
//! `encode_uids`/`decode_uids` and `camel_file_util_encode_string` use throughout the persisted
//! folder state (§6 "Persisted state per folder").

use crate::error::{ImapError, Result};
use std::io::{self, Read, Write};

pub fn write_u32<W: Write>(w: &mut W, n: u32) -> Result<()> {
  w.write_all(&n.to_le_bytes()).map_err(Into::into)
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
  let mut buf = [0u8; 4];
  r.read_exact(&mut buf)?;
  Ok(u32::from_le_bytes(buf))
}

pub fn write_u64<W: Write>(w: &mut W, n: u64) -> Result<()> {
  w.write_all(&n.to_le_bytes()).map_err(Into::into)
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
  let mut buf = [0u8; 8];
  r.read_exact(&mut buf)?;
  Ok(u64::from_le_bytes(buf))
}

/// A length-prefixed UTF-8 string. `camel_file_util_encode_string` tolerates a NULL string;
/// here that's `write_string_opt`/`read_string_opt` instead of overloading this one.
pub fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
  write_u32(w, s.len() as u32)?;
  w.write_all(s.as_bytes()).map_err(Into::into)
}

pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
  let len = read_u32(r)? as usize;
  let mut buf = vec![0u8; len];
  r.read_exact(&mut buf)?;
  String::from_utf8(buf).map_err(|error| {
    ImapError::Protocol(format!("non-UTF-8 string in persisted state: {error}"))
  })
}

pub fn write_string_opt<W: Write>(w: &mut W, s: Option<&str>) -> Result<()> {
  match s {
    None => w.write_all(&[0]).map_err(Into::into),
    Some(s) => {
      w.write_all(&[1])?;
      write_string(w, s)
    }
  }
}

pub fn read_string_opt<R: Read>(r: &mut R) -> Result<Option<String>> {
  let mut tag = [0u8; 1];
  r.read_exact(&mut tag)?;
  match tag[0] {
    0 => Ok(None),
    _ => Ok(Some(read_string(r)?)),
  }
}

pub fn write_strings<W: Write>(w: &mut W, strings: &[String]) -> Result<()> {
  write_u32(w, strings.len() as u32)?;
  for s in strings {
    write_string(w, s)?;
  }
  Ok(())
}

pub fn read_strings<R: Read>(r: &mut R) -> Result<Vec<String>> {
  let len = read_u32(r)? as usize;
  let mut out = Vec::with_capacity(len);
  for _ in 0..len {
    out.push(read_string(r)?);
  }
  Ok(out)
}

/// Maps an unexpected-EOF `io::Error` (a genuinely absent/truncated file, not corruption) to
/// `None` so callers like `Journal::open` can distinguish "nothing persisted yet" from a real
/// decode failure.
pub fn is_eof(error: &ImapError) -> bool {
  matches!(error, ImapError::Transport(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn string_round_trips() {
    let mut buf = Vec::new();
    write_string(&mut buf, "hello").unwrap();
    let mut cursor = Cursor::new(buf);
    assert_eq!("hello", read_string(&mut cursor).unwrap());
  }

  #[test]
  fn string_opt_round_trips() {
    let mut buf = Vec::new();
    write_string_opt(&mut buf, None).unwrap();
    write_string_opt(&mut buf, Some("x")).unwrap();
    let mut cursor = Cursor::new(buf);
    assert_eq!(None, read_string_opt(&mut cursor).unwrap());
    assert_eq!(Some("x".to_string()), read_string_opt(&mut cursor).unwrap());
  }

  #[test]
  fn strings_round_trip_empty_and_nonempty() {
    let mut buf = Vec::new();
    write_strings(&mut buf, &[]).unwrap();
    write_strings(&mut buf, &["a".to_string(), "b".to_string()]).unwrap();
    let mut cursor = Cursor::new(buf);
    assert_eq!(Vec::<String>::new(), read_strings(&mut cursor).unwrap());
    assert_eq!(vec!["a", "b"], read_strings(&mut cursor).unwrap());
  }
}
