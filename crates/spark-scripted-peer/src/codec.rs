use std::io::{self, Read, Write};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const CHUNK: usize = 4096;

/// 在任意字节流之上叠加原始 DEFLATE 压缩（无 zlib 头，与 IMAP `COMPRESS=DEFLATE` 一致）。
///
/// # 教案级注释
///
/// ## 逻辑（How）
/// - 写路径：`write` 只把数据喂给压缩器并在内部累积输出；`flush` 以 `FlushCompress::Sync`
///   结束当前块，把压缩结果一次写入下层再刷新下层；
/// - 读路径：从下层读取压缩字节，交给解压器；只要解压器内部仍有可产出的数据，就不会去阻塞读取
///   下层。
///
/// ## 契约（What）
/// - 对端必须以同样的同步刷新方式输出，否则读侧可能一直等待完整块；
/// - [`DeflateStream::get_mut`] 允许在不重置压缩状态的情况下替换下层（例如 TLS 升级）。
pub struct DeflateStream<S> {
    inner: S,
    compress: Compress,
    decompress: Decompress,
    input: Box<[u8]>,
    in_pos: usize,
    in_len: usize,
    output: Vec<u8>,
}

impl<S> DeflateStream<S> {
    pub fn new(inner: S, level: Compression) -> Self {
        Self {
            inner,
            compress: Compress::new(level, false),
            decompress: Decompress::new(false),
            input: vec![0u8; CHUNK].into_boxed_slice(),
            in_pos: 0,
            in_len: 0,
            output: Vec::with_capacity(CHUNK),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn deflate(&mut self, mut data: &[u8], flush: FlushCompress) -> io::Result<()> {
        loop {
            self.output.reserve(CHUNK);
            let before = self.compress.total_in();
            let status = self
                .compress
                .compress_vec(data, &mut self.output, flush)
                .map_err(invalid_data)?;
            let consumed = (self.compress.total_in() - before) as usize;
            data = &data[consumed..];
            let spare = self.output.len() < self.output.capacity();
            if (data.is_empty() && spare) || status == Status::BufError {
                return Ok(());
            }
        }
    }
}

impl<S: Read> Read for DeflateStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(
                    &self.input[self.in_pos..self.in_len],
                    buf,
                    FlushDecompress::None,
                )
                .map_err(invalid_data)?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            self.in_pos += consumed;

            if produced > 0 {
                return Ok(produced);
            }
            if status == Status::StreamEnd {
                return Ok(0);
            }
            if self.in_pos < self.in_len {
                if consumed == 0 {
                    return Err(invalid_data("deflate stream stalled"));
                }
                continue;
            }
            let n = self.inner.read(&mut self.input)?;
            if n == 0 {
                return Ok(0);
            }
            self.in_pos = 0;
            self.in_len = n;
        }
    }
}

impl<S: Write> Write for DeflateStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.deflate(buf, FlushCompress::None)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.deflate(&[], FlushCompress::Sync)?;
        if !self.output.is_empty() {
            self.inner.write_all(&self.output)?;
            self.output.clear();
        }
        self.inner.flush()
    }
}

fn invalid_data<E>(error: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_transport_mem::MemConn;

    #[test]
    fn sync_flushed_lines_decode_on_the_peer() {
        let (a, b) = MemConn::pair("client", "server", 0);
        let mut writer = DeflateStream::new(a, Compression::new(6));
        let mut reader = DeflateStream::new(b, Compression::new(6));

        writer.write_all(b"A1 NOOP\r\n").expect("压缩写入应成功");
        writer.flush().expect("同步刷新应成功");

        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).expect("解压读取应成功");
        assert_eq!(&buf[..n], b"A1 NOOP\r\n");

        writer.write_all(b"A2 LOGOUT\r\n").expect("第二次写入应成功");
        writer.flush().expect("第二次刷新应成功");
        let n = reader.read(&mut buf).expect("压缩状态应跨刷新保留");
        assert_eq!(&buf[..n], b"A2 LOGOUT\r\n");
    }

    #[test]
    fn unflushed_data_stays_buffered() {
        let (a, b) = MemConn::pair("client", "server", 0);
        b.set_timeout(Some(std::time::Duration::ZERO));
        let mut writer = DeflateStream::new(a, Compression::fast());
        writer.write_all(b"pending").expect("写入只进入压缩器");

        let mut raw = [0u8; 16];
        let err = b.recv(&mut raw).expect_err("未刷新前下层不应有数据");
        assert!(err.is_timeout());
    }
}
