//! IMAP mailbox source ("messages since T") over TLS.
//!
//! The session is raw IMAP4rev1 on a blocking rustls stream, run in
//! `spawn_blocking`. The mailbox is opened read-only with `EXAMINE`, so
//! nothing is marked as seen.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::pipeline::source::Source;
use crate::pipeline::types::RawItem;
use crate::sources::mail::parse_messages;
use crate::sources::{Credentials, SourceConfig, deferred, select};

pub const DEFAULT_FOLDER: &str = "INBOX";

const READ_TIMEOUT: Duration = Duration::from_secs(30);

type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Messages from one IMAP folder.
pub struct ImapSource {
    name: String,
    folder: String,
    config: SourceConfig,
}

impl ImapSource {
    pub fn new(config: SourceConfig) -> Self {
        let folder = config
            .folder
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FOLDER.to_string());
        Self {
            name: format!("imap:{folder}"),
            folder,
            config,
        }
    }

    async fn load(&self) -> Result<Vec<RawItem>, SourceError> {
        let credentials = self
            .config
            .credentials
            .clone()
            .ok_or_else(|| SourceError::Task("IMAP source opened without credentials".into()))?;
        let host = credentials.host.clone();
        let folder = self.folder.clone();
        let since = self.config.since;
        let limit = self.config.limit;

        let messages = tokio::task::spawn_blocking(move || fetch_messages(&credentials, &folder, since, limit))
            .await
            .map_err(|e| SourceError::Task(e.to_string()))?
            .map_err(|e| SourceError::Imap {
                host: host.clone(),
                reason: e.to_string(),
            })?;
        info!(host = %host, folder = %self.folder, count = messages.len(), "Fetched IMAP messages");

        let items = parse_messages(messages.iter().map(Vec::as_slice), &self.name);
        // SEARCH SINCE has day granularity; `select` applies the exact bound.
        Ok(select(items, &self.config))
    }
}

impl Source for ImapSource {
    type Item = RawItem;

    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self) -> BoxStream<'_, Result<RawItem, SourceError>> {
        deferred(self.load())
    }
}

/// Fetch raw RFC 822 messages (blocking).
fn fetch_messages(
    credentials: &Credentials,
    folder: &str,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
) -> Result<Vec<Vec<u8>>, ImapError> {
    let tcp = TcpStream::connect((credentials.host.as_str(), credentials.port))?;
    tcp.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(credentials.host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;
    let mut session = Session { tls: &mut tls, tag: 0 };

    let login = session.command(&format!(
        "LOGIN {} {}",
        quote(&credentials.username),
        quote(credentials.password.expose_secret())
    ))?;
    if !is_ok(&login.lines) {
        return Err("IMAP login failed".into());
    }

    let examine = session.command(&format!("EXAMINE {}", quote(folder)))?;
    if !is_ok(&examine.lines) {
        return Err(format!("cannot open folder {folder}").into());
    }

    let criteria = since.map_or_else(|| "ALL".to_string(), |s| format!("SINCE {}", imap_date(s)));
    let search = session.command(&format!("SEARCH {criteria}"))?;
    let mut ids = search_ids(&search.lines);
    if let Some(limit) = limit
        && ids.len() > limit
    {
        ids.drain(..ids.len() - limit);
    }
    debug!(folder, criteria = %criteria, matched = ids.len(), "IMAP search");

    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
        let response = session.command(&format!("FETCH {id} RFC822"))?;
        if let Some(raw) = fetch_body(response) {
            messages.push(raw);
        }
    }

    let _ = session.command("LOGOUT");
    Ok(messages)
}

struct Session<'a> {
    tls: &'a mut TlsStream,
    tag: u32,
}

impl Session<'_> {
    /// Send a tagged command and read up to its tagged response.
    fn command(&mut self, cmd: &str) -> Result<Response, ImapError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;
        read_response(&mut *self.tls, &tag)
    }
}

/// Protocol lines of one tagged response, plus the literals they announced.
///
/// Literal bytes are kept raw and are not part of `lines`.
#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

fn read_response(reader: &mut impl Read, tag: &str) -> Result<Response, ImapError> {
    let done = format!("{tag} ");
    let mut response = Response::default();
    loop {
        let line = read_line(reader)?;
        if let Some(size) = literal_size(&line) {
            let mut literal = vec![0u8; size];
            reader.read_exact(&mut literal)?;
            response.literals.push(literal);
        }
        let finished = line.starts_with(&done);
        response.lines.push(line);
        if finished {
            return Ok(response);
        }
    }
}

/// One CRLF-terminated protocol line. Never used for literal data.
fn read_line(reader: &mut impl Read) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_ok(response: &[String]) -> bool {
    response
        .last()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|status| status.eq_ignore_ascii_case("OK"))
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP date (`10-Mar-2026`).
fn imap_date(at: DateTime<Utc>) -> String {
    at.format("%d-%b-%Y").to_string()
}

/// Message sequence numbers from untagged `* SEARCH` lines, ascending.
fn search_ids(response: &[String]) -> Vec<u32> {
    let mut ids: Vec<u32> = response
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2))
        .filter_map(|id| id.parse().ok())
        .collect();
    ids.sort_unstable();
    ids
}

/// Message bytes from a `FETCH n RFC822` response.
///
/// The message is the literal announced by the first line. Without one,
/// everything up to the closing `)` line.
fn fetch_body(response: Response) -> Option<Vec<u8>> {
    let (first, rest) = response.lines.split_first()?;
    if !first.starts_with('*') {
        return None;
    }
    if let Some(literal) = response.literals.into_iter().next() {
        return Some(literal);
    }
    let body_lines = rest.len().saturating_sub(2);
    Some(rest[..body_lines].iter().flat_map(|l| l.bytes()).collect())
}

/// Size of the literal (`{size}`) that ends `line`, if any.
fn literal_size(line: &str) -> Option<usize> {
    let inner = line.trim_end().strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].parse().ok()
}
