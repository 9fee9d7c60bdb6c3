//! Per-vhost access logging.
//!
//! # Responsibilities
//! - Stamp the `Server` header on every response
//! - Format one line per request (Apache combined, or JSON)
//! - Ship lines to the vhost's sink (file, TCP or UDP) off the request path
//!
//! # Design Decisions
//! - Lines are formatted on the request path (timestamp, final status) and
//!   written by the background queue; a full queue drops the line
//! - Sinks are created lazily per vhost and replaced when the vhost's log
//!   settings change
//! - Files open on first write; with daily rotation an existing file is
//!   moved aside to `<path>.<date>.<nnn>` whenever a new one is opened

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::HttpBody;
use axum::http::{header, HeaderValue};
use chrono::{Local, NaiveDate};
use dashmap::DashMap;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

use crate::config::schema::{LogConfig, LogSinkKind};
use crate::http::request::ProxyRequest;
use crate::http::response::ProxyResponse;
use crate::lifecycle::tasks::{TaskError, TaskQueue};
use crate::pipeline::ResponseFilter;

const SOCKET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ROTATED_PER_DAY: u32 = 999;

/// Line layout, from `log.format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Combined,
    Json,
}

impl LogFormat {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Combined
        }
    }
}

/// Everything logged about one request.
#[derive(Debug, Serialize)]
pub struct AccessRecord {
    pub time: String,
    pub client: String,
    pub method: String,
    pub uri: String,
    pub protocol: String,
    pub status: u16,
    /// `-1` when the length is not known up front.
    pub bytes: i64,
    pub host: String,
    pub referer: String,
    pub user_agent: String,
    pub request_id: String,
}

impl AccessRecord {
    pub fn new(req: &ProxyRequest, resp: &ProxyResponse) -> Self {
        let value = |name| req.header_str(name).unwrap_or_default().to_string();
        Self {
            time: Local::now().format("%d/%b/%Y:%H:%M:%S %z").to_string(),
            client: req.client_ip().to_string(),
            method: req.method.to_string(),
            uri: req.url().to_string(),
            protocol: format!("{:?}", req.version),
            status: resp.status().as_u16(),
            bytes: response_length(resp),
            host: value(header::HOST),
            referer: value(header::REFERER),
            user_agent: value(header::USER_AGENT),
            request_id: req.id.clone(),
        }
    }

    pub fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Combined => format!(
                "{} - - [{}] \"{} {} {}\" {} {} {} \"{}\" \"{}\"\n",
                self.client,
                self.time,
                self.method,
                self.uri,
                self.protocol,
                self.status,
                self.bytes,
                self.host,
                self.referer,
                self.user_agent,
            ),
            LogFormat::Json => match serde_json::to_string(self) {
                Ok(mut line) => {
                    line.push('\n');
                    line
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode access record");
                    String::new()
                }
            },
        }
    }
}

fn response_length(resp: &ProxyResponse) -> i64 {
    resp.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| resp.body().size_hint().exact().map(|n| n as i64))
        .unwrap_or(-1)
}

/// Access log file, optionally rotated at the first write of each day.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    rotate_daily: bool,
    state: Mutex<Option<OpenFile>>,
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    opened: NaiveDate,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, rotate_daily: bool) -> Self {
        Self {
            path: path.into(),
            rotate_daily,
            state: Mutex::new(None),
        }
    }

    pub async fn write(&self, line: &str) -> io::Result<()> {
        let today = Local::now().date_naive();
        let mut state = self.state.lock().await;

        let stale = match state.as_ref() {
            None => true,
            Some(open) => self.rotate_daily && open.opened != today,
        };
        if stale {
            if let Some(mut old) = state.take() {
                old.file.flush().await?;
            }
            *state = Some(self.open(today).await?);
        }

        match state.as_mut() {
            Some(open) => {
                open.file.write_all(line.as_bytes()).await?;
                open.file.flush().await
            }
            None => Ok(()),
        }
    }

    async fn open(&self, today: NaiveDate) -> io::Result<OpenFile> {
        if self.rotate_daily && fs::try_exists(&self.path).await? {
            let target = free_rotation_name(&self.path, today).await?;
            fs::rename(&self.path, &target).await?;
            tracing::info!(from = %self.path.display(), to = %target.display(), "Rotated access log");
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(OpenFile {
            file,
            opened: today,
        })
    }
}

/// `<path>.<date>.<nnn>` with the first unused number.
async fn free_rotation_name(path: &Path, day: NaiveDate) -> io::Result<PathBuf> {
    for n in 1..=MAX_ROTATED_PER_DAY {
        let candidate = PathBuf::from(format!("{}.{}.{:03}", path.display(), day.format("%Y-%m-%d"), n));
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free rotation slot for {}", path.display()),
    ))
}

#[derive(Debug)]
enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Remote collector. Reconnects on the next line after a write error.
#[derive(Debug)]
pub struct SocketSink {
    kind: LogSinkKind,
    addr: String,
    conn: Mutex<Option<Socket>>,
}

impl SocketSink {
    pub fn new(kind: LogSinkKind, addr: impl Into<String>) -> Self {
        Self {
            kind,
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> io::Result<Socket> {
        let dial = async {
            match self.kind {
                LogSinkKind::Udp => {
                    let socket = UdpSocket::bind("0.0.0.0:0").await?;
                    socket.connect(&self.addr).await?;
                    Ok(Socket::Udp(socket))
                }
                _ => Ok(Socket::Tcp(TcpStream::connect(&self.addr).await?)),
            }
        };
        tokio::time::timeout(SOCKET_DIAL_TIMEOUT, dial)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "log collector dial timed out"))?
    }

    pub async fn write(&self, line: &str) -> io::Result<()> {
        let mut conn = self.conn.lock().await;
        let mut socket = match conn.take() {
            Some(socket) => socket,
            None => self.connect().await?,
        };
        let written = match &mut socket {
            Socket::Tcp(stream) => stream.write_all(line.as_bytes()).await,
            Socket::Udp(udp) => udp.send(line.as_bytes()).await.map(|_| ()),
        };
        if written.is_ok() {
            *conn = Some(socket);
        }
        written
    }
}

/// Where a vhost's lines go.
#[derive(Debug)]
pub enum AccessSink {
    File(FileSink),
    Socket(SocketSink),
}

impl AccessSink {
    pub fn from_config(config: &LogConfig) -> Self {
        match config.kind {
            LogSinkKind::File => Self::File(FileSink::new(&config.addr, config.rotate_daily)),
            kind => Self::Socket(SocketSink::new(kind, &config.addr)),
        }
    }

    pub async fn write(&self, line: &str) -> io::Result<()> {
        match self {
            Self::File(sink) => sink.write(line).await,
            Self::Socket(sink) => sink.write(line).await,
        }
    }
}

struct VhostLog {
    config: LogConfig,
    format: LogFormat,
    sink: AccessSink,
}

/// Response filter that stamps `Server` and writes the access log.
pub struct CommonLogger {
    server: Option<HeaderValue>,
    tasks: TaskQueue,
    sinks: DashMap<String, Arc<VhostLog>>,
}

impl CommonLogger {
    pub fn new(server_name: &str, tasks: TaskQueue) -> Self {
        let server = (!server_name.is_empty())
            .then(|| HeaderValue::from_str(server_name).ok())
            .flatten();
        Self {
            server,
            tasks,
            sinks: DashMap::new(),
        }
    }

    fn log_for(&self, vhost: &str, config: &LogConfig) -> Arc<VhostLog> {
        if let Some(existing) = self.sinks.get(vhost) {
            if existing.config == *config {
                return existing.clone();
            }
        }
        let log = Arc::new(VhostLog {
            config: config.clone(),
            format: LogFormat::from_name(&config.format),
            sink: AccessSink::from_config(config),
        });
        tracing::debug!(vhost, addr = %config.addr, kind = ?config.kind, "Access log sink opened");
        self.sinks.insert(vhost.to_string(), log.clone());
        log
    }
}

#[async_trait]
impl ResponseFilter for CommonLogger {
    fn name(&self) -> &'static str {
        "access_log"
    }

    async fn filter_response(&self, req: &ProxyRequest, mut resp: ProxyResponse) -> ProxyResponse {
        if let Some(server) = &self.server {
            resp.headers_mut().insert(header::SERVER, server.clone());
        }

        let Some(vhost) = req.ctx.vhost.as_ref() else {
            return resp;
        };
        if !vhost.log.status || vhost.log.addr.is_empty() {
            return resp;
        }

        let log = self.log_for(&vhost.name, &vhost.log);
        let line = AccessRecord::new(req, &resp).render(log.format);
        if !line.is_empty() {
            self.tasks.submit("access_log", async move {
                log.sink.write(&line).await.map_err(TaskError::from)
            });
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::VhostConfig;
    use crate::http::response;
    use crate::routing::vhost::{VhostDefaults, VirtualHost};
    use axum::http::StatusCode;

    fn request(log: LogConfig) -> ProxyRequest {
        let config = VhostConfig {
            name: "example".to_string(),
            log,
            ..Default::default()
        };
        let vhost = VirtualHost::compile(&config, &VhostDefaults::default()).unwrap();
        let mut req = ProxyRequest::for_test("GET", "/a.css?v=2", "www.example.com");
        req.headers
            .insert(header::USER_AGENT, HeaderValue::from_static("curl/8.0"));
        req.ctx.vhost = Some(Arc::new(vhost));
        req
    }

    fn file_log(path: &Path, format: &str) -> LogConfig {
        LogConfig {
            status: true,
            kind: LogSinkKind::File,
            rotate_daily: false,
            addr: path.display().to_string(),
            format: format.to_string(),
        }
    }

    #[test]
    fn combined_line_layout() {
        let req = request(LogConfig::default());
        let resp = response::text(StatusCode::OK, "hello");
        let line = AccessRecord::new(&req, &resp).render(LogFormat::Combined);

        assert!(line.starts_with("203.0.113.7 - - ["));
        assert!(line.contains("] \"GET /a.css?v=2 HTTP/1.1\" 200 5 www.example.com \"\" \"curl/8.0\"\n"));
    }

    #[test]
    fn json_line_is_one_object() {
        let req = request(LogConfig::default());
        let resp = response::not_found();
        let line = AccessRecord::new(&req, &resp).render(LogFormat::Json);

        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["status"], 404);
        assert_eq!(value["uri"], "/a.css?v=2");
        assert_eq!(value["request_id"], req.id.as_str());
    }

    #[tokio::test]
    async fn stamps_server_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let tasks = TaskQueue::new(16, 2);
        let logger = CommonLogger::new("cdn-edge", tasks.clone());

        let req = request(file_log(&path, "combined"));
        let resp = logger
            .filter_response(&req, response::text(StatusCode::OK, "ok"))
            .await;
        assert_eq!(resp.headers()[header::SERVER], "cdn-edge");

        tasks.wait_idle().await;
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("\"GET /a.css?v=2 HTTP/1.1\" 200 2"));
    }

    #[tokio::test]
    async fn disabled_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let tasks = TaskQueue::new(16, 2);
        let logger = CommonLogger::new("", tasks.clone());

        let mut log = file_log(&path, "combined");
        log.status = false;
        let resp = logger
            .filter_response(&request(log), response::not_found())
            .await;
        assert!(resp.headers().get(header::SERVER).is_none());

        tasks.wait_idle().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rotation_moves_existing_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "yesterday\n").unwrap();

        let sink = FileSink::new(&path, true);
        sink.write("today\n").await.unwrap();

        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        let rotated = dir.path().join(format!("access.log.{today}.001"));
        assert_eq!(std::fs::read_to_string(rotated).unwrap(), "yesterday\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "today\n");
    }

    #[tokio::test]
    async fn udp_sink_sends_datagrams() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = collector.local_addr().unwrap().to_string();
        let sink = AccessSink::from_config(&LogConfig {
            status: true,
            kind: LogSinkKind::Udp,
            addr,
            ..Default::default()
        });

        sink.write("line one\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = collector.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"line one\n");
    }

    #[tokio::test]
    async fn tcp_sink_delivers_lines() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let sink = SocketSink::new(LogSinkKind::Tcp, addr);

        sink.write("first\n").await.unwrap();
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 6];
        tokio::io::AsyncReadExt::read_exact(&mut conn, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"first\n");
    }
}
