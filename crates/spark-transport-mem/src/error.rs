use std::fmt;
use std::io;

use thiserror::Error;

use crate::MemAddr;

/// 阻塞操作的方向，用于错误文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => f.write_str("read"),
            IoOp::Write => f.write_str("write"),
        }
    }
}

/// 内存管道的错误域。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `Timeout`：截止时间或相对超时在阻塞期间到期；属于超时类错误，**不**标记为临时错误，
///   是否重试由调用方自行决定；
/// - `EndOfStream`：对端已关闭写侧，本方向不会再有新字节。
///
/// ## 逻辑（How）
/// - 转换为 [`io::Error`] 时，`Timeout` 映射为 [`io::ErrorKind::TimedOut`]，
///   `EndOfStream` 映射为 [`io::ErrorKind::BrokenPipe`]（与向已关闭套接字写入一致）；
///   读侧的流结束在 `io::Read` 实现中直接表现为 `Ok(0)`；
/// - [`PipeError::from_io`] 可从 `io::Error` 中取回原始错误，便于上层分类。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipeError {
    #[error("mock({addr}): {op} timeout")]
    Timeout { addr: MemAddr, op: IoOp },
    #[error("mock: end of stream")]
    EndOfStream,
}

impl PipeError {
    pub(crate) fn timeout(addr: &MemAddr, op: IoOp) -> Self {
        PipeError::Timeout {
            addr: addr.clone(),
            op,
        }
    }

    /// 是否为超时类错误。
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipeError::Timeout { .. })
    }

    /// 管道错误从不视为临时错误。
    pub fn is_temporary(&self) -> bool {
        false
    }

    /// 从 `io::Error` 中取回内存管道错误（若它来自本 crate）。
    pub fn from_io(error: &io::Error) -> Option<&PipeError> {
        error.get_ref()?.downcast_ref::<PipeError>()
    }
}

impl From<PipeError> for io::Error {
    fn from(error: PipeError) -> Self {
        let kind = match error {
            PipeError::Timeout { .. } => io::ErrorKind::TimedOut,
            PipeError::EndOfStream => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, error)
    }
}
