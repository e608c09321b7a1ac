//! Access logging
//!
//! One line per request, rendered from a small pattern language:
//!
//! | token       | value                                   |
//! |-------------|-----------------------------------------|
//! | `%t`        | request start, `[10/Oct/2000:13:55:36 +0200]` |
//! | `%a`        | remote address                          |
//! | `%{i,Name}` | request header `Name`                   |
//! | `%r`        | request line                            |
//! | `%s`        | response status code                    |
//! | `%b`        | response body size, `-` when unknown    |
//! | `%D`        | duration in milliseconds                |
//! | `%T`        | duration in seconds                     |
//! | `%%`        | a literal `%`                           |
//!
//! Lines go to an [`AccessLogSink`]; [`FileAccessLogSink`] writes them to
//! daily-rolling files without blocking the request path.

use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, Method, Uri, Version, header};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Local};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Default line format
pub const DEFAULT_LOG_FORMAT: &str = "time:%t\thost:%a\tforwardedfor:%{i,X-Forwarded-For}\treq:%r\tstatus:%s\tsize:%b\tduration:%D.%T";

/// Default log directory, relative to the server root
pub const DEFAULT_LOG_DIR: &str = "log";

/// Resolve the access-log directory
///
/// An absolute `configured` path is used as-is; a relative one (or the
/// default `log`) is joined onto `server_root`.
pub fn resolve_log_dir(server_root: &Path, configured: Option<&Path>) -> PathBuf {
    let dir = configured.unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR));
    if dir.is_absolute() {
        return dir.to_path_buf();
    }
    let joined = server_root.join(dir);
    if joined.is_absolute() {
        joined
    } else {
        std::path::absolute(&joined).unwrap_or(joined)
    }
}

/// Create `dir` and its parents when missing
pub fn ensure_log_dir(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
        tracing::info!(path = %dir.display(), "Created access log directory");
    }
    Ok(())
}

/// What happened to one request
#[derive(Debug, Clone)]
pub struct AccessLogRecord {
    /// When the request arrived
    pub started_at: DateTime<Local>,
    /// Peer address, when known
    pub remote_addr: Option<SocketAddr>,
    /// Request method
    pub method: Method,
    /// Request target
    pub uri: Uri,
    /// Protocol version
    pub version: Version,
    /// Request headers
    pub headers: HeaderMap,
    /// Response status code
    pub status: u16,
    /// Response body size from `Content-Length`
    pub response_size: Option<u64>,
    /// Time until the response head was produced
    pub duration: Duration,
}

impl AccessLogRecord {
    /// `GET /path?query HTTP/1.1`
    pub fn request_line(&self) -> String {
        let target = self
            .uri
            .path_and_query()
            .map_or_else(|| self.uri.path(), |pq| pq.as_str());
        format!("{} {} {:?}", self.method, target, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Timestamp,
    RemoteAddr,
    RequestHeader(HeaderName),
    RequestLine,
    Status,
    ResponseSize,
    Millis,
    Seconds,
}

/// Parsed access-log pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormat {
    tokens: Vec<Token>,
}

impl LogFormat {
    /// Parse a pattern; unknown `%` sequences are kept as literal text
    pub fn parse(pattern: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;

        while let Some(pos) = rest.find('%') {
            literal.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];

            let (token, consumed) = match rest.chars().next() {
                Some('t') => (Some(Token::Timestamp), 1),
                Some('a') => (Some(Token::RemoteAddr), 1),
                Some('r') => (Some(Token::RequestLine), 1),
                Some('s') => (Some(Token::Status), 1),
                Some('b') => (Some(Token::ResponseSize), 1),
                Some('D') => (Some(Token::Millis), 1),
                Some('T') => (Some(Token::Seconds), 1),
                Some('%') => {
                    literal.push('%');
                    (None, 1)
                }
                Some('{') => match parse_header_token(rest) {
                    Some((name, consumed)) => (Some(Token::RequestHeader(name)), consumed),
                    None => {
                        literal.push('%');
                        (None, 0)
                    }
                },
                _ => {
                    literal.push('%');
                    (None, 0)
                }
            };
            rest = &rest[consumed..];

            if let Some(token) = token {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(token);
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Self { tokens }
    }

    /// Render one line, without the trailing newline
    pub fn render(&self, record: &AccessLogRecord) -> String {
        let mut line = String::with_capacity(128);
        for token in &self.tokens {
            // Writing into a String cannot fail.
            let _ = match token {
                Token::Literal(text) => {
                    line.push_str(text);
                    Ok(())
                }
                Token::Timestamp => {
                    write!(line, "{}", record.started_at.format("[%d/%b/%Y:%H:%M:%S %z]"))
                }
                Token::RemoteAddr => match record.remote_addr {
                    Some(addr) => write!(line, "{}", addr.ip()),
                    None => write!(line, "-"),
                },
                Token::RequestHeader(name) => {
                    match record.headers.get(name).and_then(|v| v.to_str().ok()) {
                        Some(value) => write!(line, "{value}"),
                        None => write!(line, "-"),
                    }
                }
                Token::RequestLine => write!(line, "{}", record.request_line()),
                Token::Status => write!(line, "{}", record.status),
                Token::ResponseSize => match record.response_size {
                    Some(size) => write!(line, "{size}"),
                    None => write!(line, "-"),
                },
                Token::Millis => write!(line, "{}", record.duration.as_millis()),
                Token::Seconds => write!(line, "{:.3}", record.duration.as_secs_f64()),
            };
        }
        line
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::parse(DEFAULT_LOG_FORMAT)
    }
}

/// `{i,Name}` right after a `%`; returns the header and the bytes consumed
fn parse_header_token(rest: &str) -> Option<(HeaderName, usize)> {
    let end = rest.find('}')?;
    let inner = &rest[1..end];
    let (kind, name) = inner.split_once(',')?;
    if kind.trim() != "i" {
        return None;
    }
    let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
    Some((name, end + 1))
}

/// Destination for access-log lines
pub trait AccessLogSink: Send + Sync {
    /// Record one request
    fn record(&self, record: &AccessLogRecord);
}

/// Sink writing to daily-rolling `access.*.log` files
pub struct FileAccessLogSink {
    format: LogFormat,
    directory: PathBuf,
    writer: NonBlocking,
    _guard: WorkerGuard,
}

impl FileAccessLogSink {
    /// Open a sink in `directory`, which must already exist
    pub fn new(directory: impl Into<PathBuf>, format: LogFormat) -> io::Result<Self> {
        let directory = directory.into();
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("access")
            .filename_suffix("log")
            .build(&directory)
            .map_err(io::Error::other)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        Ok(Self {
            format,
            directory,
            writer,
            _guard: guard,
        })
    }

    /// Directory the log files are written to
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl std::fmt::Debug for FileAccessLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccessLogSink")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl AccessLogSink for FileAccessLogSink {
    fn record(&self, record: &AccessLogRecord) {
        let mut line = self.format.render(record);
        line.push('\n');
        let mut writer = self.writer.clone();
        if let Err(e) = writer.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, "Failed to write access log line");
        }
    }
}

/// Middleware recording every request, including ones rejected while draining
pub(crate) async fn access_log_layer(
    State(sink): State<Arc<dyn AccessLogSink>>,
    request: Request,
    next: Next,
) -> Response {
    let started_at = Local::now();
    let start = Instant::now();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();
    let headers = request.headers().clone();

    let response = next.run(request).await;

    let response_size = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    sink.record(&AccessLogRecord {
        started_at,
        remote_addr,
        method,
        uri,
        version,
        headers,
        status: response.status().as_u16(),
        response_size,
        duration: start.elapsed(),
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_escape_and_unknown_tokens_are_literal() {
        let format = LogFormat::parse("100%% %q %{x,Foo} done");
        assert_eq!(
            format.tokens,
            vec![Token::Literal("100% %q %{x,Foo} done".into())]
        );
    }

    #[test]
    fn header_token_is_case_insensitive() {
        let format = LogFormat::parse("%{i, X-Request-Id }");
        assert_eq!(
            format.tokens,
            vec![Token::RequestHeader(HeaderName::from_static("x-request-id"))]
        );
    }
}
