// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc4315 - [...] UIDPLUS extension
// https://www.rfc-editor.org/rfc/rfc3502 - MULTIAPPEND
// https://www.rfc-editor.org/rfc/rfc2342 - IMAP4 Namespace

#![allow(clippy::upper_case_acronyms)]

use anyhow::Context as _;
use std::{io, net, num, path, process, result, str, sync::Arc, time};
use zeroize::Zeroize as _;

pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod journal;
pub mod mime;
pub mod session;
pub mod store;
pub mod summary;
pub mod uid;
pub mod wire;

fn parse_duration(argument: &str) -> result::Result<time::Duration, num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

/// Process-level CLI surface for the demonstration binary (§2.1): dials the server, authenticates,
/// opens one folder, and reports what changed. Mirrors the shape of `kevinboulain-sin`'s own
/// `Arguments`, trimmed of the maildir/notmuch-specific fields that no longer apply.
#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(long = "address", help = "Server address")]
  pub address: String,
  #[arg(long = "port", help = "Server port")]
  pub port: u16,
  #[arg(long = "tls", help = "Enable TLS", default_value_t = true)]
  pub tls: bool,
  #[arg(long = "timeout", help = "TCP timeout (in seconds)", value_parser = parse_duration)]
  pub timeout: Option<time::Duration>,

  #[arg(long = "user", help = "IMAP user")]
  pub user: String,
  #[arg(last = true, required = true)]
  pub password_command: Vec<String>,

  #[arg(long = "folder", help = "Folder to open and rescan", default_value_t = String::from("INBOX"))]
  pub folder: String,
  #[arg(long = "state", help = "Directory holding per-folder summaries/caches/journals")]
  pub state: String,
  #[arg(
    long = "namespace",
    help = "Log file basename",
    default_value_t = String::from("sin")
  )]
  pub namespace: String,

  #[arg(long = "mailing-list-headers", help = "Also fetch mailing-list headers in phase 1", default_value_t = false)]
  pub mailing_list_headers: bool,
  #[arg(long = "braindamaged", help = "Force the whole-body-fetch workaround", default_value_t = false)]
  pub braindamaged: bool,
  #[arg(long = "verbose-wire", help = "Log full command/response bodies at trace level", default_value_t = false)]
  pub verbose_wire: bool,
}

fn config(arguments: &Arguments) -> config::Config {
  let mut cfg = config::Config {
    mailing_list_headers: arguments.mailing_list_headers,
    verbose: arguments.verbose_wire,
    ..config::Config::default()
  };
  cfg.braindamaged = cfg.braindamaged || arguments.braindamaged;
  cfg
}

fn credentials(user: &str, password_command: &[String]) -> anyhow::Result<(String, String)> {
  let mut program = process::Command::new(&password_command[0]);
  let command = program.args(&password_command[1..]);
  log::info!("getting password from {command:?}");
  let output = command.output()?;
  let mut stdout = output.stdout;
  anyhow::ensure!(output.status.success(), "couldn't get password: {command:?} failed");
  let password = str::from_utf8(
    stdout
      .split(|byte| *byte == b'\n')
      .next()
      .with_context(|| format!("{command:?} didn't output anything"))?,
  )
  .with_context(|| format!("{command:?} didn't output UTF-8"))?
  .to_string();
  stdout.zeroize();
  Ok((user.to_string(), password))
}

/// Knows how to produce a freshly dialed, ungreeted transport (§6.1). Parallels the teacher's
/// `sync::Open`; implemented for a plain TCP dial and, wrapped, for a TLS upgrade of one.
trait Open {
  type RW: session::Stream;
  fn open(&self) -> anyhow::Result<Self::RW>;
}

struct TCP<'a> {
  address: &'a str,
  port: u16,
  timeout: Option<time::Duration>,
}

impl session::Stream for net::TcpStream {
  fn set_cancellation(&mut self, _token: session::CancellationToken) {
    // A plain TcpStream has no cooperative cancellation hook; the read/write timeout set at
    // connect time is this transport's only cutoff.
  }
}

impl<'a> Open for TCP<'a> {
  type RW = net::TcpStream;

  fn open(&self) -> anyhow::Result<Self::RW> {
    let &Self { address, port, timeout } = self;
    let resolved = {
      use std::net::ToSocketAddrs as _;
      (address, port)
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("couldn't resolve {address}:{port}"))?
    };
    log::debug!("connecting to {resolved:?} with timeout {timeout:?}");
    Ok(match timeout {
      Some(duration) => {
        let stream = net::TcpStream::connect_timeout(&resolved, duration)?;
        stream.set_read_timeout(Some(duration))?;
        stream
      }
      None => net::TcpStream::connect(resolved)?,
    })
  }
}

struct TLS<'a>(TCP<'a>);

/// The one self-referential type in the crate: a `rustls::Stream` borrows both the TCP socket and
/// the TLS session state it's built from, so the borrow has to live alongside its referents
/// instead of pointing at something owned elsewhere (§6.1).
#[ouroboros::self_referencing]
struct TLSStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl io::Read for TLSStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.read(buf))
  }
}

impl io::Write for TLSStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.tls_stream.write(buf))
  }

  fn flush(&mut self) -> io::Result<()> {
    self.with_mut(|fields| fields.tls_stream.flush())
  }
}

impl session::Stream for TLSStream {
  fn set_cancellation(&mut self, _token: session::CancellationToken) {
    // Same as the plain TCP case: cancellation rides the socket's own read timeout.
  }
}

impl<'a> Open for TLS<'a> {
  type RW = TLSStream;

  fn open(&self) -> anyhow::Result<Self::RW> {
    let mut root_store = rustls::RootCertStore::empty();
    for certificate in rustls_native_certs::load_native_certs()? {
      root_store.add(&rustls::Certificate(certificate.0))?;
    }
    Ok(
      TLSStreamBuilder {
        tcp_stream: self.0.open()?,
        tls_connection: rustls::ClientConnection::new(
          Arc::new(
            rustls::ClientConfig::builder()
              .with_safe_defaults()
              .with_root_certificates(root_store)
              .with_no_client_auth(),
          ),
          self.0.address.try_into().with_context(|| format!("couldn't convert {} to server name", self.0.address))?,
        )?,
        tls_stream_builder: |tcp_stream, tls_connection| rustls::Stream::new(tls_connection, tcp_stream),
      }
      .build(),
    )
  }
}

fn inner_run<O>(arguments: &Arguments, open: &O, user: &str, password: &str) -> anyhow::Result<()>
where
  O: Open,
{
  let mut connection = connection::Connection::new(open.open()?);
  connection.greeting()?;
  let store = store::Store::connect(
    connection,
    user,
    password,
    path::Path::new(&arguments.state).to_path_buf(),
    config(arguments),
    config::Exiting::new(),
    Arc::new(|| Box::new(session::NullSearchEngine) as Box<dyn session::SearchEngine + Send>),
  )?;
  run_with_store(arguments, store)
}

fn run_with_store<RW>(arguments: &Arguments, mut store: store::Store<RW>) -> anyhow::Result<()>
where
  RW: io::Read + io::Write,
{
  store.replay_all()?;
  let engine = store.open_folder(&arguments.folder)?;
  let changes = engine.refresh()?;
  log::info!(
    "{}: {} added, {} removed, {} changed, {} recent",
    arguments.folder,
    changes.added.len(),
    changes.removed.len(),
    changes.changed.len(),
    changes.recent.len(),
  );
  Ok(())
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  let (user, password) = credentials(&arguments.user, &arguments.password_command)?;
  let tcp = TCP { address: &arguments.address, port: arguments.port, timeout: arguments.timeout };
  if !arguments.tls {
    log::warn!("TLS not enabled, credentials will be sent in clear over the wire");
    return inner_run(arguments, &tcp, &user, &password);
  }
  let tls = TLS(tcp);
  inner_run(arguments, &tls, &user, &password)
}
