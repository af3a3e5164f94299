use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;

use flate2::Compression;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use spark_transport_mem::MemConn;
use thiserror::Error;
use tracing::debug;

use crate::codec::DeflateStream;

const READ_CHUNK: usize = 4096;

/// 管道之上的传输链路：明文或 TLS。
enum Link {
    Plain(MemConn),
    Tls(Box<StreamOwned<ServerConnection, MemConn>>),
    // 升级过程中的占位状态，正常情况下不会被观察到。
    Detached,
}

impl Link {
    fn conn(&self) -> Option<&MemConn> {
        match self {
            Link::Plain(conn) => Some(conn),
            Link::Tls(stream) => Some(stream.get_ref()),
            Link::Detached => None,
        }
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "link detached")
}

impl Read for Link {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Link::Plain(conn) => conn.read(buf),
            Link::Tls(stream) => stream.read(buf),
            Link::Detached => Err(detached()),
        }
    }
}

impl Write for Link {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Link::Plain(conn) => conn.write(buf),
            Link::Tls(stream) => stream.write(buf),
            Link::Detached => Err(detached()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Link::Plain(conn) => conn.flush(),
            Link::Tls(stream) => stream.flush(),
            Link::Detached => Err(detached()),
        }
    }
}

/// 链路之上的可选压缩层。
enum Layer {
    Raw(Link),
    Deflate(Box<DeflateStream<Link>>),
}

impl Layer {
    fn link(&self) -> &Link {
        match self {
            Layer::Raw(link) => link,
            Layer::Deflate(stream) => stream.get_ref(),
        }
    }

    fn link_mut(&mut self) -> &mut Link {
        match self {
            Layer::Raw(link) => link,
            Layer::Deflate(stream) => stream.get_mut(),
        }
    }
}

impl Read for Layer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Layer::Raw(link) => link.read(buf),
            Layer::Deflate(stream) => stream.read(buf),
        }
    }
}

impl Write for Layer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Layer::Raw(link) => link.write(buf),
            Layer::Deflate(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Layer::Raw(link) => link.flush(),
            Layer::Deflate(stream) => stream.flush(),
        }
    }
}

/// 由脚本引擎驱动的一端：在内存管道端点上提供行读写、原始读写、压缩与 TLS 升级能力。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 扮演真实协议服务端的网络侧；脚本只看到“读一行/写一行/升级链路”这些能力，不关心协议语法。
///
/// ## 逻辑（How）
/// - 层次自下而上：[`MemConn`] → 可选 TLS（`rustls::StreamOwned`）→ 可选 DEFLATE → 读写缓冲；
/// - 写入先进入本地缓冲，[`Surrogate::flush`] 时一次交给下层；
/// - 读取先查看本地缓冲，不足时从下层补充。
///
/// ## 契约（What）
/// - `read_line`：阻塞直到读到分隔符，返回不含分隔符的字节；流提前结束返回 [`SurrogateError::UnexpectedEof`]；
/// - `write_line`：追加分隔符，但不刷新；
/// - `enable_tls` / `enable_deflate`：先刷新待发数据；若仍有未读输入（属于升级前的层）则拒绝；
///   重复启用返回错误；TLS 升级在已压缩时会把压缩层保留在新的加密链路之上；
/// - `close(flush)`：可选先刷新（TLS 下同时发送 close_notify），然后关闭管道；重复关闭无副作用；
/// - 关闭后所有读写返回 [`SurrogateError::Closed`]。
pub struct Surrogate {
    layer: Layer,
    terminator: Vec<u8>,
    rbuf: Vec<u8>,
    rpos: usize,
    wbuf: Vec<u8>,
    closed: bool,
}

impl Surrogate {
    /// 包装管道端点；`terminator` 为行分隔符。
    pub fn new(conn: MemConn, terminator: impl Into<Vec<u8>>) -> Self {
        Self {
            layer: Layer::Raw(Link::Plain(conn)),
            terminator: terminator.into(),
            rbuf: Vec::with_capacity(READ_CHUNK),
            rpos: 0,
            wbuf: Vec::new(),
            closed: false,
        }
    }

    /// 底层管道端点，可用于调整截止时间。
    pub fn conn(&self) -> Option<&MemConn> {
        self.layer.link().conn()
    }

    pub fn compressed(&self) -> bool {
        matches!(self.layer, Layer::Deflate(_))
    }

    pub fn encrypted(&self) -> bool {
        matches!(self.layer.link(), Link::Tls(_))
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// 读取一行，返回值不含分隔符。
    pub fn read_line(&mut self) -> Result<Vec<u8>, SurrogateError> {
        self.ensure_open()?;
        let mut scanned = 0;
        loop {
            let pending = &self.rbuf[self.rpos..];
            if let Some(at) = find(&pending[scanned..], &self.terminator) {
                let end = scanned + at;
                let line = pending[..end].to_vec();
                self.consume(end + self.terminator.len());
                return Ok(line);
            }
            // 分隔符可能跨越两次读取。
            scanned = pending
                .len()
                .saturating_sub(self.terminator.len().saturating_sub(1));
            if self.fill()? == 0 {
                let partial = self.rbuf[self.rpos..].to_vec();
                self.consume(partial.len());
                return Err(SurrogateError::UnexpectedEof { partial });
            }
        }
    }

    /// 写入一行并追加分隔符；需要 [`Surrogate::flush`] 才会发送。
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), SurrogateError> {
        self.ensure_open()?;
        self.wbuf.extend_from_slice(line);
        self.wbuf.extend_from_slice(&self.terminator);
        Ok(())
    }

    /// 把缓冲中的数据交给下层并刷新。
    pub fn flush(&mut self) -> Result<(), SurrogateError> {
        self.ensure_open()?;
        if !self.wbuf.is_empty() {
            let pending = mem::take(&mut self.wbuf);
            self.layer.write_all(&pending)?;
        }
        self.layer.flush()?;
        Ok(())
    }

    /// 启用 DEFLATE 压缩，之后的读写都经过压缩层。
    pub fn enable_deflate(&mut self, level: u32) -> Result<(), SurrogateError> {
        self.ensure_open()?;
        if self.compressed() {
            return Err(SurrogateError::CompressionActive);
        }
        self.prepare_upgrade()?;
        let link = match mem::replace(&mut self.layer, Layer::Raw(Link::Detached)) {
            Layer::Raw(link) => link,
            other => {
                self.layer = other;
                return Err(SurrogateError::CompressionActive);
            }
        };
        let stream = DeflateStream::new(link, Compression::new(level.min(9)));
        self.layer = Layer::Deflate(Box::new(stream));
        debug!(level, "surrogate compression enabled");
        Ok(())
    }

    /// 以服务端身份完成 TLS 握手，并把后续读写切换到加密链路。
    pub fn enable_tls(&mut self, config: Arc<ServerConfig>) -> Result<(), SurrogateError> {
        self.ensure_open()?;
        if self.encrypted() {
            return Err(SurrogateError::EncryptionActive);
        }
        self.prepare_upgrade()?;
        let session = ServerConnection::new(config)?;
        let link = self.layer.link_mut();
        let conn = match mem::replace(link, Link::Detached) {
            Link::Plain(conn) => conn,
            other => {
                *link = other;
                return Err(SurrogateError::EncryptionActive);
            }
        };
        let mut stream = StreamOwned::new(session, conn);
        let handshake = complete_handshake(&mut stream);
        match handshake {
            Ok(()) => {
                *link = Link::Tls(Box::new(stream));
                debug!("surrogate tls enabled");
                Ok(())
            }
            Err(error) => {
                *link = Link::Plain(stream.sock);
                Err(SurrogateError::Handshake(error))
            }
        }
    }

    /// 关闭连接；`flush` 为真时先发送缓冲数据。
    pub fn close(&mut self, flush: bool) -> Result<(), SurrogateError> {
        if self.closed {
            return Ok(());
        }
        let flushed = if flush { self.flush_for_close() } else { Ok(()) };
        if let Some(conn) = self.conn() {
            conn.close();
        }
        self.closed = true;
        debug!(flush, "surrogate closed");
        flushed
    }

    fn flush_for_close(&mut self) -> Result<(), SurrogateError> {
        self.flush()?;
        if let Link::Tls(stream) = self.layer.link_mut() {
            stream.conn.send_close_notify();
            stream.flush()?;
        }
        Ok(())
    }

    fn prepare_upgrade(&mut self) -> Result<(), SurrogateError> {
        if self.rpos < self.rbuf.len() {
            return Err(SurrogateError::PendingInput {
                buffered: self.rbuf.len() - self.rpos,
            });
        }
        self.flush()
    }

    fn ensure_open(&self) -> Result<(), SurrogateError> {
        if self.closed {
            Err(SurrogateError::Closed)
        } else {
            Ok(())
        }
    }

    fn consume(&mut self, n: usize) {
        self.rpos += n;
        if self.rpos == self.rbuf.len() {
            self.rbuf.clear();
            self.rpos = 0;
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        if self.rpos > 0 {
            self.rbuf.drain(..self.rpos);
            self.rpos = 0;
        }
        let start = self.rbuf.len();
        self.rbuf.resize(start + READ_CHUNK, 0);
        let result = self.layer.read(&mut self.rbuf[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.rbuf.truncate(start + n);
        result
    }
}

impl Read for Surrogate {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(SurrogateError::Closed.into());
        }
        if self.rpos == self.rbuf.len() {
            return self.layer.read(buf);
        }
        let pending = &self.rbuf[self.rpos..];
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl Write for Surrogate {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.wbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Surrogate::flush(self).map_err(io::Error::from)
    }
}

impl std::fmt::Debug for Surrogate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surrogate")
            .field("conn", &self.conn())
            .field("compressed", &self.compressed())
            .field("encrypted", &self.encrypted())
            .field("closed", &self.closed)
            .finish()
    }
}

fn complete_handshake(stream: &mut StreamOwned<ServerConnection, MemConn>) -> io::Result<()> {
    while stream.conn.is_handshaking() {
        stream.conn.complete_io(&mut stream.sock)?;
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// 对端能力调用失败。
#[derive(Debug, Error)]
pub enum SurrogateError {
    #[error("surrogate i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed before line terminator (partial {partial:?})")]
    UnexpectedEof { partial: Vec<u8> },
    #[error("surrogate is closed")]
    Closed,
    #[error("tls already active")]
    EncryptionActive,
    #[error("compression already active")]
    CompressionActive,
    #[error("{buffered} unread bytes buffered before link upgrade")]
    PendingInput { buffered: usize },
    #[error("tls session setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

impl From<SurrogateError> for io::Error {
    fn from(error: SurrogateError) -> Self {
        match error {
            SurrogateError::Io(error) => error,
            SurrogateError::Closed => io::Error::new(io::ErrorKind::NotConnected, error),
            SurrogateError::UnexpectedEof { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, error)
            }
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (MemConn, Surrogate) {
        let (client, server) = MemConn::pair("client", "server", 0);
        client.set_timeout(Some(Duration::from_secs(2)));
        server.set_timeout(Some(Duration::from_secs(2)));
        (client, Surrogate::new(server, "\r\n"))
    }

    #[test]
    fn lines_are_split_on_the_terminator() {
        let (client, mut surrogate) = pair();
        client.send(b"A1 NOOP\r\nA2 LO").expect("写入应成功");
        assert_eq!(surrogate.read_line().expect("第一行完整"), b"A1 NOOP");

        client.send(b"GOUT\r").expect("写入应成功");
        client.send(b"\n").expect("写入应成功");
        assert_eq!(
            surrogate.read_line().expect("跨多次写入的分隔符也应识别"),
            b"A2 LOGOUT"
        );
    }

    #[test]
    fn write_line_waits_for_flush() {
        let (client, mut surrogate) = pair();
        surrogate.write_line(b"* OK ready").expect("写入缓冲应成功");
        client.set_timeout(Some(Duration::ZERO));
        let mut buf = [0u8; 32];
        assert!(client.recv(&mut buf).is_err(), "刷新前对端不应收到数据");

        surrogate.flush().expect("刷新应成功");
        client.set_timeout(Some(Duration::from_secs(2)));
        let n = client.recv(&mut buf).expect("刷新后数据可读");
        assert_eq!(&buf[..n], b"* OK ready\r\n");
    }

    #[test]
    fn eof_mid_line_reports_partial_bytes() {
        let (client, mut surrogate) = pair();
        client.send(b"A1 NO").expect("写入应成功");
        client.close();
        match surrogate.read_line() {
            Err(SurrogateError::UnexpectedEof { partial }) => assert_eq!(partial, b"A1 NO"),
            other => panic!("期望 UnexpectedEof，实际 {other:?}"),
        }
    }

    #[test]
    fn upgrade_refuses_buffered_input() {
        let (client, mut surrogate) = pair();
        client.send(b"A1 COMPRESS DEFLATE\r\nleftover").expect("写入应成功");
        surrogate.read_line().expect("读取命令行");
        let err = surrogate.enable_deflate(6).expect_err("尚有未读输入时不能升级");
        assert!(matches!(err, SurrogateError::PendingInput { buffered: 8 }));
        assert!(!surrogate.compressed());
    }

    #[test]
    fn deflate_cannot_be_enabled_twice() {
        let (_client, mut surrogate) = pair();
        surrogate.enable_deflate(6).expect("首次启用应成功");
        assert!(surrogate.compressed());
        assert!(matches!(
            surrogate.enable_deflate(6),
            Err(SurrogateError::CompressionActive)
        ));
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_io() {
        let (client, mut surrogate) = pair();
        surrogate.write_line(b"* BYE").expect("写入缓冲应成功");
        surrogate.close(true).expect("带刷新的关闭应成功");
        surrogate.close(true).expect("重复关闭无副作用");
        assert!(surrogate.closed());
        assert!(matches!(surrogate.read_line(), Err(SurrogateError::Closed)));

        let mut out = Vec::new();
        (&client).read_to_end(&mut out).expect("关闭前刷新的数据可读");
        assert_eq!(out, b"* BYE\r\n");
    }
}
