//! WireCodec (§4.1): command formatting, response-line classification, the untagged/literal
//! reassembly algorithm, the generic parenthesized-list parser used for FETCH/BODYSTRUCTURE, the
//! UID-set codec and the modified-UTF-7 mailbox-name codec.
//!
//! Grounded on `source/imap.rs`'s `peg` grammar and `Stream<RW>` (same byte-buffer-with-cursor
//! shape), generalized: the teacher's grammar assumes a server that never truncates a literal
//! mid-parse and papers over the gap with a NOOP-chunking trick (`Stream::chunk`); the spec
//! requires the reassembly itself to be correct (§4.1, testable property "Literal reassembly"),
//! so this module reads literals directly off the wire instead. The generic value grammar below
//! (`sexp_grammar`) and the command-template tokenizer (`command_template`) reuse the teacher's
//! `peg` approach directly, including its `##skip` escape hatch for literal payloads
//! (`ParserHacks`, imap.rs's own comment on why `CHAR8()*<{n}>` is too slow for message bodies).

use crate::error::{ImapError, Result};
use std::io::{Read, Write};
use std::{borrow::Cow, str};

// ---------------------------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Ok,
  No,
  Bad,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
  /// The reassembled payload after `"* "`, with NUL bytes dropped and CRLF collapsed to LF inside
  /// any literal it contained (§4.1).
  Untagged(Vec<u8>),
  Tagged {
    tag: String,
    status: Status,
    text: String,
  },
  Continuation(String),
}

/// A reader over a blocking byte stream that buffers unread bytes and implements the literal
/// reassembly algorithm. One instance is owned by a `Connection` (§4.2).
#[derive(Debug)]
pub struct Reader<RW> {
  rw: RW,
  buf: Vec<u8>,
  pos: usize,
}

impl<RW> Reader<RW>
where
  RW: Read + Write,
{
  pub fn new(rw: RW) -> Self {
    Self {
      rw,
      buf: Vec::new(),
      pos: 0,
    }
  }

  pub fn get_mut(&mut self) -> &mut RW {
    &mut self.rw
  }

  /// Unwraps the reader, discarding any buffered-but-unconsumed bytes. Used by the STARTTLS
  /// upgrade, where the caller wraps the raw stream in a TLS session and builds a fresh `Reader`
  /// over it; a STARTTLS response never carries trailing pipelined bytes, so nothing is lost.
  pub fn into_inner(self) -> RW {
    self.rw
  }

  fn fill(&mut self) -> Result<()> {
    let mut chunk = [0u8; 8192];
    let n = self.rw.read(&mut chunk).map_err(ImapError::Transport)?;
    if n == 0 {
      return Err(ImapError::Protocol("end of stream".to_string()));
    }
    self.buf.extend_from_slice(&chunk[..n]);
    Ok(())
  }

  fn compact(&mut self) {
    if self.pos > 0 {
      self.buf.drain(0..self.pos);
      self.pos = 0;
    }
  }

  /// Reads one line up to (excluding) the terminating CRLF.
  fn read_line(&mut self) -> Result<Vec<u8>> {
    loop {
      if let Some(idx) = memchr::memmem::find(&self.buf[self.pos..], b"\r\n") {
        let end = self.pos + idx;
        let line = self.buf[self.pos..end].to_vec();
        self.pos = end + 2;
        return Ok(line);
      }
      self.fill()?;
    }
  }

  fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
    while self.buf.len() - self.pos < n {
      self.fill()?;
    }
    let out = self.buf[self.pos..self.pos + n].to_vec();
    self.pos += n;
    Ok(out)
  }

  pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
    self.rw.write_all(bytes).map_err(ImapError::Transport)
  }

  /// Reads and classifies the next response line, performing literal reassembly for untagged
  /// responses (§4.1).
  pub fn next_line(&mut self) -> Result<Line> {
    let first = self.read_line()?;
    let result = if first.starts_with(b"+") {
      let text = first.get(1..).unwrap_or(&[]);
      Line::Continuation(lossy(skip_leading_space(text)))
    } else if first.starts_with(b"*") {
      let rest = skip_leading_space(first.get(1..).unwrap_or(&[]));
      Line::Untagged(self.reassemble(rest)?)
    } else {
      let (tag, rest) = split_token(&first);
      let rest = skip_leading_space(rest);
      let (word, text) = split_token(rest);
      let status = match word {
        b"OK" => Status::Ok,
        b"NO" => Status::No,
        b"BAD" => Status::Bad,
        other => {
          return Err(ImapError::Protocol(format!(
            "unexpected status word {:?}",
            lossy(other)
          )))
        }
      };
      Line::Tagged {
        tag: lossy(tag),
        status,
        text: lossy(skip_leading_space(text)),
      }
    };
    self.compact();
    Ok(result)
  }

  /// Implements §4.1's untagged-with-literals reassembly: scan for unmatched paren depth (the
  /// "sexp depth" counter), find a trailing `{N}`, read exactly N octets, normalize them (drop
  /// embedded NULs, collapse CRLF to LF), rewrite the `{N}` header in place to the normalized
  /// length using the same digit width, and repeat for as many literals as the response carries.
  fn reassemble(&mut self, first_line: &[u8]) -> Result<Vec<u8>> {
    let mut acc = Vec::new();
    let mut sexp_depth: i64 = 0;
    let mut line = first_line.to_vec();
    loop {
      for &b in &line {
        match b {
          b'(' => sexp_depth += 1,
          b')' => sexp_depth -= 1,
          _ => {}
        }
      }
      match trailing_literal(&line) {
        Some((open, width, n)) => {
          let raw = self.read_exact_bytes(n)?;
          let normalized = normalize_literal(&raw);
          rewrite_literal_header(&mut line, open, width, normalized.len());
          acc.extend_from_slice(&line);
          acc.extend_from_slice(&normalized);
          // A known server quirk inserts an extra blank line after a literal while still inside a
          // parenthesized list; tolerate it by reading (and discarding) blank lines until we find
          // the real continuation.
          loop {
            let next = self.read_line()?;
            if next.is_empty() && sexp_depth > 0 {
              continue;
            }
            line = next;
            break;
          }
        }
        None => {
          acc.extend_from_slice(&line);
          break;
        }
      }
    }
    Ok(acc)
  }
}

fn skip_leading_space(bytes: &[u8]) -> &[u8] {
  bytes.strip_prefix(b" ").unwrap_or(bytes)
}

fn split_token(bytes: &[u8]) -> (&[u8], &[u8]) {
  match memchr::memchr(b' ', bytes) {
    Some(i) => (&bytes[..i], &bytes[i..]),
    None => (bytes, &[]),
  }
}

fn lossy(bytes: &[u8]) -> String {
  String::from_utf8_lossy(bytes).into_owned()
}

/// If `line` ends with `{<digits>}`, returns `(open_brace_index, digit_width, value)`.
fn trailing_literal(line: &[u8]) -> Option<(usize, usize, usize)> {
  if line.last() != Some(&b'}') {
    return None;
  }
  let open = line.iter().rposition(|&b| b == b'{')?;
  let digits = &line[open + 1..line.len() - 1];
  if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
    return None;
  }
  let n: usize = str::from_utf8(digits).ok()?.parse().ok()?;
  Some((open, digits.len(), n))
}

fn rewrite_literal_header(line: &mut Vec<u8>, open: usize, width: usize, new_len: usize) {
  let digits = format!("{new_len:0width$}");
  // The normalized length can never exceed the original (we only ever remove bytes), so it always
  // fits within the original digit width.
  let digits = if digits.len() > width {
    digits
  } else {
    format!("{:0>width$}", digits, width = width)
  };
  line.splice(open + 1..open + 1 + width, digits.into_bytes());
}

fn normalize_literal(raw: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(raw.len());
  let mut i = 0;
  while i < raw.len() {
    match raw[i] {
      0 => {}
      b'\r' if raw.get(i + 1) == Some(&b'\n') => {
        out.push(b'\n');
        i += 1;
      }
      b => out.push(b),
    }
    i += 1;
  }
  out
}

// ---------------------------------------------------------------------------------------------
// Generic parenthesized-list ("sexp") parser, shared by FLAGS, FETCH, and BODYSTRUCTURE parsing.
// ---------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
  Atom(Vec<u8>),
  Quoted(Vec<u8>),
  Literal(Vec<u8>),
  Nil,
  List(Vec<Sexp>),
}

impl Sexp {
  pub fn as_atom(&self) -> Option<&[u8]> {
    match self {
      Sexp::Atom(a) => Some(a),
      _ => None,
    }
  }

  pub fn as_string(&self) -> Option<Cow<'_, str>> {
    match self {
      Sexp::Atom(a) | Sexp::Quoted(a) | Sexp::Literal(a) => Some(String::from_utf8_lossy(a)),
      Sexp::Nil => None,
      Sexp::List(_) => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Sexp]> {
    match self {
      Sexp::List(l) => Some(l),
      _ => None,
    }
  }
}

/// `peg`'s `##skip` escape hatch needs an extension trait on the input slice type, exactly as
/// `imap.rs` defines it, to advance past a literal's payload without materializing a
/// one-repetition-per-byte `Vec` first (`imap.rs`'s comment on `rust-peg/issues/284`).
trait ParserHacks {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()>;
}

impl ParserHacks for [u8] {
  fn skip(&self, position: usize, n: usize) -> peg::RuleResult<()> {
    if self.len() >= position + n {
      return peg::RuleResult::Matched(position + n, ());
    }
    peg::RuleResult::Failed
  }
}

fn parse_number(n: &[u8]) -> usize {
  // Guaranteed all-digits by the DIGIT()+ that calls this, same tradeoff imap.rs's own
  // parse_number makes.
  str::from_utf8(n).unwrap().parse().unwrap()
}

peg::parser! {
  // A recursive value grammar, generalizing imap.rs's per-response-type rules (its
  // `fetch_body_data`/`select_data`/etc. each enumerate one finite shape): FETCH and
  // BODYSTRUCTURE payloads nest arbitrarily, so one `value` rule recurses into itself instead of
  // being duplicated per message attribute.
  grammar sexp_grammar() for [u8] {
    rule SP() = " "
    rule DIGIT() = [b'0'..=b'9']
    rule number() -> usize
      = n:$(DIGIT()+)
      { parse_number(n) }

    // quoted = DQUOTE *QUOTED-CHAR DQUOTE, permissive like the hand-written version it replaces:
    // a backslash escapes whatever byte follows it, not just DQUOTE/backslash (RFC 3501's
    // quoted-specials), since some servers over-escape.
    rule quoted_char() -> u8
      = "\\" c:[_] { c }
      / !"\"" c:[_] { c }
    rule quoted() -> Vec<u8>
      = "\"" q:(quoted_char()*) "\""
      { q }

    // `BODY[section]<partial>`-shaped atoms absorb their bracketed section spec whole, since it
    // may itself contain spaces and parentheses that would otherwise look like list boundaries.
    rule section() -> Vec<u8>
      = "[" inner:$((!"]" [_])*) "]"
      { let mut v = vec![b'[']; v.extend_from_slice(inner); v.push(b']'); v }
    rule partial() -> Vec<u8>
      = "<" inner:$((!">" [_])*) ">"
      { let mut v = vec![b'<']; v.extend_from_slice(inner); v.push(b'>'); v }
    rule atom_safe_char() -> u8
      = !(" " / "(" / ")" / "[") c:[_]
      { c }
    rule atom_piece() -> Vec<u8>
      = s:section() tail:partial()?
      { let mut v = s; if let Some(t) = tail { v.extend_from_slice(&t); } v }
      / b:atom_safe_char()
      { vec![b] }
    rule atom() -> Vec<u8>
      = pieces:(atom_piece()+)
      { pieces.concat() }

    rule nil() = "NIL"

    // literal = "{" number "}" CRLF *CHAR8, CRLF optional here since `Reader::reassemble` already
    // splices a literal's normalized payload directly after its (rewritten) header with no
    // separator; tolerating a CR and/or LF keeps this usable on not-yet-reassembled fixtures too.
    rule literal() -> Vec<u8>
      = "{" n:number() "}" "\r"? "\n"? position!() l:$(##skip(n))
      { l.to_vec() }

    pub rule value() -> Sexp
      = "(" SP()* items:(value() ** (SP()*)) SP()* ")"
      { Sexp::List(items) }
      / q:quoted() { Sexp::Quoted(q) }
      / l:literal() { Sexp::Literal(l) }
      / nil() { Sexp::Nil }
      / a:atom() { Sexp::Atom(a) }

    pub rule top() -> (Sexp, usize)
      = SP()* s:value() p:position!()
      { (s, p) }
  }
}

/// Parses one generic IMAP token (atom, quoted string, literal, NIL, or parenthesized list)
/// starting at `bytes[i]`, skipping leading whitespace.
pub fn parse_sexp(bytes: &[u8], i: usize) -> Result<(Sexp, usize)> {
  if i > bytes.len() {
    return Err(ImapError::Protocol("unexpected end of response".to_string()));
  }
  match sexp_grammar::top(&bytes[i..]) {
    Ok((sexp, end)) => Ok((sexp, i + end)),
    Err(error) => Err(ImapError::Protocol(format!("malformed IMAP response: {error}"))),
  }
}

/// Parses a flat top-level list of items (the common case: a FETCH's `(key value key value ...)`
/// payload, or a FLAGS `(\Seen \Answered)` list), returning the list without its own parens.
pub fn parse_list(bytes: &[u8]) -> Result<Vec<Sexp>> {
  let (sexp, _) = parse_sexp(bytes, 0)?;
  match sexp {
    Sexp::List(items) => Ok(items),
    other => Ok(vec![other]),
  }
}

// ---------------------------------------------------------------------------------------------
// Flag list codec
// ---------------------------------------------------------------------------------------------

pub fn encode_flag_list(flags: &[&str]) -> String {
  format!("({})", flags.join(" "))
}

pub fn parse_flag_list(sexp: &Sexp) -> Result<Vec<String>> {
  let list = sexp
    .as_list()
    .ok_or_else(|| ImapError::Protocol("expected a flag list".to_string()))?;
  list
    .iter()
    .map(|item| {
      item
        .as_string()
        .map(|s| s.into_owned())
        .ok_or_else(|| ImapError::Protocol("non-atomic flag".to_string()))
    })
    .collect()
}

// ---------------------------------------------------------------------------------------------
// UID set codec (§4.1)
// ---------------------------------------------------------------------------------------------

/// Encodes as many UIDs from `sorted` (ascending, deduplicated) as fit within `byte_limit`,
/// collapsing adjacent runs into `a:b` ranges. Returns the encoded set text and the index of the
/// first UID *not* included, so the caller can loop to encode the remainder.
pub fn encode_uid_set(sorted: &[u32], byte_limit: usize) -> (String, usize) {
  let mut out = String::new();
  let mut i = 0;
  while i < sorted.len() {
    let start = sorted[i];
    let mut j = i;
    while j + 1 < sorted.len() && sorted[j + 1] == sorted[j] + 1 {
      j += 1;
    }
    let piece = if j == i {
      start.to_string()
    } else {
      format!("{}:{}", start, sorted[j])
    };
    let extra = if out.is_empty() { piece.len() } else { piece.len() + 1 };
    if !out.is_empty() && out.len() + extra > byte_limit {
      break;
    }
    if !out.is_empty() {
      out.push(',');
    }
    out.push_str(&piece);
    i = j + 1;
  }
  (out, i)
}

pub fn decode_uid_set(set: &str) -> Result<Vec<u32>> {
  let mut out = Vec::new();
  for piece in set.split(',').filter(|p| !p.is_empty()) {
    match piece.split_once(':') {
      Some((a, b)) => {
        let a: u32 = a
          .parse()
          .map_err(|_| ImapError::Protocol(format!("invalid uid {a:?} in set")))?;
        let b: u32 = b
          .parse()
          .map_err(|_| ImapError::Protocol(format!("invalid uid {b:?} in set")))?;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        out.extend(lo..=hi);
      }
      None => {
        let n: u32 = piece
          .parse()
          .map_err(|_| ImapError::Protocol(format!("invalid uid {piece:?} in set")))?;
        out.push(n);
      }
    }
  }
  Ok(out)
}

// ---------------------------------------------------------------------------------------------
// Mailbox name codec: modified UTF-7 (RFC 3501 §5.1.3)
// ---------------------------------------------------------------------------------------------

pub fn utf7_to_utf8(input: &[u8]) -> Option<String> {
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  );
  use base64::Engine as _;
  let mut buffer = Vec::new();
  let mut output = String::new();
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      b'&' => {
        let start = i;
        loop {
          i += 1;
          if i == input.len() {
            return None;
          }
          if input[i] == b'-' {
            break;
          }
        }
        if start + 1 == i {
          output.push('&');
        } else {
          buffer.clear();
          engine.decode_vec(&input[start + 1..i], &mut buffer).ok()?;
          let mut decoder = encoding_rs::UTF_16BE.new_decoder_without_bom_handling();
          let (result, _) =
            decoder.decode_to_string_without_replacement(&buffer, &mut output, true);
          match result {
            encoding_rs::DecoderResult::InputEmpty => (),
            _ => return None,
          }
        }
      }
      c @ 0x20..=0x25 | c @ 0x27..=0x7e => output.push(c as char),
      _ => return None,
    }
    i += 1;
  }
  Some(output)
}

pub fn utf8_to_utf7(input: &str) -> String {
  use base64::Engine as _;
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::IMAP_MUTF7,
    base64::engine::general_purpose::NO_PAD,
  );
  let mut out = String::new();
  let mut pending: Vec<u16> = Vec::new();
  let flush = |pending: &mut Vec<u16>, out: &mut String| {
    if pending.is_empty() {
      return;
    }
    let mut bytes = Vec::with_capacity(pending.len() * 2);
    for unit in pending.drain(..) {
      bytes.extend_from_slice(&unit.to_be_bytes());
    }
    out.push('&');
    out.push_str(&engine.encode(bytes));
    out.push('-');
  };
  for c in input.chars() {
    let printable = matches!(c as u32, 0x20..=0x25 | 0x27..=0x7e);
    if c == '&' {
      flush(&mut pending, &mut out);
      out.push_str("&-");
    } else if printable {
      flush(&mut pending, &mut out);
      out.push(c);
    } else {
      let mut buf = [0u16; 2];
      pending.extend_from_slice(c.encode_utf16(&mut buf));
    }
  }
  flush(&mut pending, &mut out);
  out
}

// ---------------------------------------------------------------------------------------------
// Command formatter
// ---------------------------------------------------------------------------------------------

/// One argument to [`format_command`], matching the `%s`/`%d`/`%S`/`%F`/`%G` directives of §4.1.
pub enum Arg<'a> {
  Str(&'a str),
  Int(i64),
  /// `%S`: an IMAP "string" value. Encoded as an atom if possible, else (with LITERAL+) as a
  /// non-synchronizing literal, else as a backslash-escaped quoted string.
  String(&'a str),
  /// `%F`/`%G`: a folder name already translated to its full server name (namespace-aware
  /// translation happens before this call; see `Connection::folder_arg`), encoded via modified
  /// UTF-7 then emitted like `%S`.
  Folder(&'a str),
}

fn is_atom_safe(s: &str) -> bool {
  !s.is_empty()
    && s.bytes().all(|b| {
      !matches!(
        b,
        b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b'\\' | b']' | 0..=0x1f | 0x7f
      )
    })
}

fn encode_imap_string(s: &str, literal_plus: bool) -> Vec<u8> {
  if is_atom_safe(s) {
    return s.as_bytes().to_vec();
  }
  if literal_plus {
    let bytes = s.as_bytes();
    let mut out = format!("{{{}+}}\r\n", bytes.len()).into_bytes();
    out.extend_from_slice(bytes);
    return out;
  }
  let mut out = Vec::with_capacity(s.len() + 2);
  out.push(b'"');
  for b in s.bytes() {
    if b == b'"' || b == b'\\' {
      out.push(b'\\');
    }
    out.push(b);
  }
  out.push(b'"');
  out
}

/// One piece of a tokenized command template: a run of literal text, a `%<char>` directive, or a
/// trailing, un-followed `%`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
  Literal(String),
  Directive(char),
  TrailingPercent,
}

peg::parser! {
  // Recognizes the `%s`/`%d`/`%S`/`%F`/`%G`/`%%` directive grammar of §4.1's command templates,
  // same spirit as `sexp_grammar` above but over `str` instead of `[u8]` since templates are
  // written inline as Rust string literals, never read off the wire.
  grammar command_template() for str {
    rule directive() -> Token
      = "%" c:[_] { Token::Directive(c) }
    rule trailing_percent() -> Token
      = "%" ![_] { Token::TrailingPercent }
    rule literal_run() -> Token
      = s:$((!"%" [_])+) { Token::Literal(s.to_string()) }
    pub rule tokens() -> Vec<Token>
      = t:(directive() / trailing_percent() / literal_run())*
      { t }
  }
}

/// Formats one IMAP command line (without the leading tag or trailing CRLF — those are added by
/// `Connection::send_command*`). Unknown `%X` directives are a programmer error; per §4.1 they're
/// logged and emitted verbatim to aid debugging rather than panicking.
pub fn format_command(fmt: &str, args: &[Arg<'_>], literal_plus: bool) -> Vec<u8> {
  // The grammar above partitions every `&str` into literal runs and `%<char>` directives, so this
  // can never fail; same tradeoff as `sexp_grammar`'s `parse_number`.
  let tokens = command_template::tokens(fmt).expect("command template grammar is exhaustive");
  let mut out = Vec::new();
  let mut args = args.iter();
  for token in tokens {
    match token {
      Token::Literal(s) => out.extend_from_slice(s.as_bytes()),
      // A bare trailing '%' (no directive character follows) is emitted as-is.
      Token::TrailingPercent => out.push(b'%'),
      Token::Directive('%') => out.push(b'%'),
      Token::Directive('s') => match args.next() {
        Some(Arg::Str(s)) => out.extend_from_slice(s.as_bytes()),
        _ => {
          log::error!("%s directive without a matching Arg::Str");
          out.extend_from_slice(b"%s");
        }
      },
      Token::Directive('d') => match args.next() {
        Some(Arg::Int(n)) => out.extend_from_slice(n.to_string().as_bytes()),
        _ => {
          log::error!("%d directive without a matching Arg::Int");
          out.extend_from_slice(b"%d");
        }
      },
      Token::Directive('S') => match args.next() {
        Some(Arg::String(s)) => out.extend_from_slice(&encode_imap_string(s, literal_plus)),
        _ => {
          log::error!("%S directive without a matching Arg::String");
          out.extend_from_slice(b"%S");
        }
      },
      Token::Directive(c @ ('F' | 'G')) => match args.next() {
        Some(Arg::Folder(name)) => {
          let encoded = utf8_to_utf7(name);
          out.extend_from_slice(&encode_imap_string(&encoded, literal_plus))
        }
        _ => {
          log::error!("%{c} directive without a matching Arg::Folder");
          out.push(b'%');
          out.extend_from_slice(c.to_string().as_bytes());
        }
      },
      Token::Directive(other) => {
        log::error!("unknown command format directive %{other}");
        out.push(b'%');
        let mut buf = [0u8; 4];
        out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
      }
    }
  }
  out
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

  fn reader(input: &[u8]) -> Reader<Loopback> {
    Reader::new(Loopback {
      inbound: Cursor::new(input.to_vec()),
      outbound: Vec::new(),
    })
  }

  #[test]
  fn classifies_tagged_untagged_continuation() {
    let mut r = reader(b"A00001 OK done\r\n* 2 EXISTS\r\n+ ready\r\n");
    assert_eq!(
      Line::Tagged {
        tag: "A00001".to_string(),
        status: Status::Ok,
        text: "done".to_string()
      },
      r.next_line().unwrap()
    );
    assert_eq!(Line::Untagged(b"2 EXISTS".to_vec()), r.next_line().unwrap());
    assert_eq!(Line::Continuation("ready".to_string()), r.next_line().unwrap());
  }

  #[test]
  fn literal_reassembly_normalizes_and_rewrites_length() {
    // The literal contains an embedded NUL and a CRLF that should collapse to LF; the header must
    // be rewritten from {6} to the normalized length using the same digit width.
    let mut r = reader(b"* 1 FETCH (BODY[] {6}\r\na\0b\r\nc)\r\n");
    let line = r.next_line().unwrap();
    match line {
      Line::Untagged(bytes) => {
        assert!(bytes.windows(3).any(|w| w == b"{4}"), "{:?}", lossy(&bytes));
        assert!(bytes.windows(4).any(|w| w == b"ab\nc"));
      }
      other => panic!("expected untagged, got {other:?}"),
    }
  }

  #[test]
  fn blank_line_after_literal_inside_sexp_is_tolerated() {
    let mut r = reader(b"* 1 FETCH (BODYSTRUCTURE (\"TEXT\" \"PLAIN\" {3}\r\nfoo\r\n\r\nNIL))\r\n");
    let line = r.next_line().unwrap();
    assert!(matches!(line, Line::Untagged(_)));
  }

  #[test]
  fn utf7_round_trips() {
    for name in ["INBOX/Sent", "~peter/mail/台北/日本語", "&weird"] {
      let encoded = utf8_to_utf7(name);
      assert_eq!(Some(name.to_string()), utf7_to_utf8(encoded.as_bytes()));
    }
  }

  #[test]
  fn utf7_known_vectors() {
    assert_eq!("&-", utf8_to_utf7("&"));
    assert_eq!("~peter/mail/&U,BTFw-/&ZeVnLIqe-", utf8_to_utf7("~peter/mail/台北/日本語"));
    assert_eq!(None, utf7_to_utf8(b"&Jjo!"));
    assert_eq!("☺!", utf7_to_utf8(b"&Jjo-!").unwrap());
  }

  #[test]
  fn uid_set_round_trips() {
    let uids = vec![1u32, 2, 3, 5, 7, 8, 9, 100];
    let (encoded, stopped_at) = encode_uid_set(&uids, 768);
    assert_eq!(uids.len(), stopped_at);
    assert_eq!(uids, decode_uid_set(&encoded).unwrap());
  }

  #[test]
  fn uid_set_respects_byte_limit() {
    let uids: Vec<u32> = (1..=1000).collect();
    let (encoded, stopped_at) = encode_uid_set(&uids, 16);
    assert!(encoded.len() <= 16);
    assert!(stopped_at < uids.len());
  }

  #[test]
  fn flag_list_round_trips() {
    let flags = ["\\Seen", "\\Deleted"];
    let encoded = encode_flag_list(&flags);
    assert_eq!("(\\Seen \\Deleted)", encoded);
    let (sexp, _) = parse_sexp(encoded.as_bytes(), 0).unwrap();
    assert_eq!(vec!["\\Seen".to_string(), "\\Deleted".to_string()], parse_flag_list(&sexp).unwrap());
  }

  #[test]
  fn command_formatter_directives() {
    let out = format_command(
      "%sFETCH %d (%S)",
      &[Arg::Str("UID "), Arg::Int(42), Arg::String("has space")],
      false,
    );
    assert_eq!(b"UID FETCH 42 (\"has space\")".to_vec(), out);
  }

  #[test]
  fn command_formatter_atom_safe_string_is_unquoted() {
    let out = format_command("%S", &[Arg::String("\\Seen")], false);
    assert_eq!(b"\\Seen".to_vec(), out);
  }

  #[test]
  fn command_formatter_literal_plus_for_unsafe_string() {
    let out = format_command("%S", &[Arg::String("has space")], true);
    assert_eq!(b"{9+}\r\nhas space".to_vec(), out);
  }

  #[test]
  fn unknown_directive_emitted_verbatim() {
    let out = format_command("%Q", &[], false);
    assert_eq!(b"%Q".to_vec(), out);
  }

  #[test]
  fn parse_fetch_items_generic() {
    let (sexp, _) = parse_sexp(b"(UID 42 FLAGS (\\Seen) RFC822.SIZE 123)", 0).unwrap();
    let items = sexp.as_list().unwrap();
    assert_eq!(b"UID", items[0].as_atom().unwrap());
    assert_eq!(b"42", items[1].as_atom().unwrap());
    assert_eq!(b"FLAGS", items[2].as_atom().unwrap());
    assert_eq!(vec!["\\Seen".to_string()], parse_flag_list(&items[3]).unwrap());
  }

  #[test]
  fn parse_body_section_key_absorbs_brackets() {
    let (sexp, _) = parse_sexp(b"BODY[HEADER.FIELDS (DATE FROM)]<0.512>", 0).unwrap();
    assert_eq!(
      b"BODY[HEADER.FIELDS (DATE FROM)]<0.512>".to_vec(),
      sexp.as_atom().unwrap().to_vec()
    );
  }
}
