//! 集成测试共用的被测客户端：一个极简的行协议客户端。
//!
//! # 教案级说明
//!
//! - **意图（Why）**：脚本化对端需要一个真实的“另一端”来验证端到端行为；此客户端只实现
//!   问候、未标记/标记响应解析、STARTTLS 客户端握手与客户端压缩，足以覆盖会话场景；
//! - **逻辑（How）**：线路层自下而上为 `MemConn` → 可选 `rustls::ClientConnection` → 可选 DEFLATE，
//!   之上是按 `\r\n` 切分的读缓冲；
//! - **契约（What）**：所有方法返回 `anyhow::Result`，失败信息直接进入 `join` 的客户端一侧报告。
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail, ensure};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use spark_scripted_peer::DeflateStream;
use spark_transport_mem::MemConn;

const CRLF: &[u8] = b"\r\n";

/// 安装一次测试日志输出，`RUST_LOG` 控制级别。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum Wire {
    Plain(MemConn),
    Tls(Box<StreamOwned<ClientConnection, MemConn>>),
    Compressed(Box<DeflateStream<Wire>>),
    Detached,
}

impl Wire {
    fn encrypted(&self) -> bool {
        match self {
            Wire::Tls(_) => true,
            Wire::Compressed(inner) => inner.get_ref().encrypted(),
            Wire::Plain(_) | Wire::Detached => false,
        }
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "wire detached")
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Wire::Plain(conn) => conn.read(buf),
            Wire::Tls(stream) => stream.read(buf),
            Wire::Compressed(stream) => stream.read(buf),
            Wire::Detached => Err(detached()),
        }
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Wire::Plain(conn) => conn.write(buf),
            Wire::Tls(stream) => stream.write(buf),
            Wire::Compressed(stream) => stream.write(buf),
            Wire::Detached => Err(detached()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Wire::Plain(conn) => conn.flush(),
            Wire::Tls(stream) => stream.flush(),
            Wire::Compressed(stream) => stream.flush(),
            Wire::Detached => Err(detached()),
        }
    }
}

/// 服务端响应。
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    /// `* <status> <text>`
    Untagged { status: String, text: String },
    /// `<tag> <status> <text>`
    Tagged {
        tag: String,
        status: String,
        text: String,
    },
}

impl Response {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let (head, rest) = line
            .split_once(' ')
            .ok_or_else(|| anyhow!("response without status: {line:?}"))?;
        let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
        let (status, text) = (status.to_owned(), text.to_owned());
        if head == "*" {
            Ok(Response::Untagged { status, text })
        } else {
            Ok(Response::Tagged {
                tag: head.to_owned(),
                status,
                text,
            })
        }
    }
}

/// 极简行协议客户端。
pub struct LineClient {
    wire: Wire,
    pending: Vec<u8>,
}

impl LineClient {
    pub fn new(conn: MemConn) -> Self {
        Self {
            wire: Wire::Plain(conn),
            pending: Vec::new(),
        }
    }

    pub fn encrypted(&self) -> bool {
        self.wire.encrypted()
    }

    pub fn compressed(&self) -> bool {
        matches!(self.wire, Wire::Compressed(_))
    }

    pub fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.wire.write_all(line.as_bytes())?;
        self.wire.write_all(CRLF)?;
        self.wire.flush().context("flush command")?;
        Ok(())
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.wire.write_all(bytes)?;
        self.wire.flush()?;
        Ok(())
    }

    pub fn read_line(&mut self) -> anyhow::Result<String> {
        loop {
            if let Some(at) = self.pending.windows(CRLF.len()).position(|w| w == CRLF) {
                let line: Vec<u8> = self.pending.drain(..at + CRLF.len()).take(at).collect();
                return String::from_utf8(line).context("response is not utf-8");
            }
            let mut chunk = [0u8; 1024];
            let n = self.wire.read(&mut chunk).context("read response")?;
            if n == 0 {
                bail!("connection closed (pending {:?})", self.pending);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn read_exact_raw(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        while self.pending.len() < len {
            let mut chunk = [0u8; 1024];
            let n = self.wire.read(&mut chunk)?;
            ensure!(n > 0, "connection closed before {len} raw bytes");
            self.pending.extend_from_slice(&chunk[..n]);
        }
        Ok(self.pending.drain(..len).collect())
    }

    pub fn read_response(&mut self) -> anyhow::Result<Response> {
        let line = self.read_line()?;
        Response::parse(&line)
    }

    /// 读取到指定标签的完成响应为止，返回之前的未标记响应与完成响应。
    pub fn command(&mut self, tag: &str, command: &str) -> anyhow::Result<(Vec<Response>, Response)> {
        self.send_line(&format!("{tag} {command}"))?;
        let mut untagged = Vec::new();
        loop {
            match self.read_response()? {
                Response::Tagged { tag: seen, status, text } if seen == tag => {
                    return Ok((untagged, Response::Tagged { tag: seen, status, text }));
                }
                other @ Response::Untagged { .. } => untagged.push(other),
                other => bail!("unexpected response {other:?} while waiting for {tag}"),
            }
        }
    }

    /// 以客户端身份完成 TLS 握手。
    pub fn start_tls(
        &mut self,
        config: Arc<ClientConfig>,
        name: ServerName<'static>,
    ) -> anyhow::Result<()> {
        ensure!(self.pending.is_empty(), "unread input before tls upgrade");
        let conn = match mem::replace(&mut self.wire, Wire::Detached) {
            Wire::Plain(conn) => conn,
            other => {
                self.wire = other;
                bail!("tls requires a plain wire");
            }
        };
        let session = ClientConnection::new(config, name)?;
        let mut stream = StreamOwned::new(session, conn);
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock).context("tls handshake")?;
        }
        while stream.conn.wants_write() {
            stream.conn.write_tls(&mut stream.sock)?;
        }
        self.wire = Wire::Tls(Box::new(stream));
        Ok(())
    }

    /// 启用客户端压缩。
    pub fn deflate(&mut self, level: u32) -> anyhow::Result<()> {
        ensure!(self.pending.is_empty(), "unread input before compression");
        ensure!(!self.compressed(), "compression already active");
        let inner = mem::replace(&mut self.wire, Wire::Detached);
        let stream = DeflateStream::new(inner, flate2::Compression::new(level));
        self.wire = Wire::Compressed(Box::new(stream));
        Ok(())
    }

    /// 读取直到连接关闭，期望不再有任何数据。
    pub fn expect_eof(&mut self) -> anyhow::Result<()> {
        ensure!(self.pending.is_empty(), "unread input {:?}", self.pending);
        let mut chunk = [0u8; 64];
        let n = self.wire.read(&mut chunk)?;
        ensure!(n == 0, "expected eof, got {:?}", &chunk[..n]);
        Ok(())
    }
}
