use std::time::Instant;

use parking_lot::{Condvar, MutexGuard};

use crate::{DeadlineTimer, IoOp, MemAddr, PipeError};

/// 单方向的字节缓冲。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 不变量：`0 <= off <= buf.len() <= cap`；
/// - `eof` 一旦置位永不清除；
/// - `buf = None` 表示通道关闭时缓冲已释放，读侧立即观察到流结束。
///
/// ## 逻辑（How）
/// - 缓冲本身不含锁，由所在 `MemConn` 的共享互斥锁保护；
/// - 阻塞循环见 [`read`] 与 [`write`]，二者在等待时原子地释放锁，被唤醒后重新检查全部状态。
#[derive(Debug)]
pub(crate) struct HalfConn {
    buf: Option<Vec<u8>>,
    off: usize,
    cap: usize,
    eof: bool,
}

impl HalfConn {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            buf: Some(Vec::with_capacity(cap)),
            off: 0,
            cap,
            eof: false,
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.buf.is_none()
    }

    pub(crate) fn release(&mut self) {
        self.buf = None;
        self.off = 0;
    }

    pub(crate) fn set_eof(&mut self) {
        self.eof = true;
    }

    /// 丢弃所有未读字节，但不改变关闭状态。
    pub(crate) fn clear(&mut self) {
        if let Some(buf) = self.buf.as_mut() {
            buf.clear();
        }
        self.off = 0;
    }

    fn pending(&self) -> usize {
        self.buf.as_ref().map_or(0, |buf| buf.len() - self.off)
    }

    /// 缓冲已释放，或写侧已关闭且数据已读尽。
    pub(crate) fn is_exhausted(&self) -> bool {
        self.buf.is_none() || (self.eof && self.pending() == 0)
    }

    fn take(&mut self, dst: &mut [u8]) -> usize {
        let Some(buf) = self.buf.as_mut() else {
            return 0;
        };
        let live = &buf[self.off..];
        let n = live.len().min(dst.len());
        dst[..n].copy_from_slice(&live[..n]);
        self.off += n;
        if self.off == buf.len() {
            buf.clear();
            self.off = 0;
        }
        n
    }

    fn put(&mut self, src: &[u8]) -> usize {
        let Some(buf) = self.buf.as_mut() else {
            return 0;
        };
        if buf.len() - self.off >= self.cap {
            return 0;
        }
        if buf.len() == self.cap {
            buf.drain(..self.off);
            self.off = 0;
        }
        let n = (self.cap - buf.len()).min(src.len());
        buf.extend_from_slice(&src[..n]);
        n
    }
}

/// 从 `half` 选出的缓冲中读取，直到有数据、流结束或超时。
///
/// 检查顺序：缓冲已释放/流结束 → 超时 → 目标为空 → 有数据可读 → 等待。
/// 读到部分数据即返回；每次成功读取都会立即唤醒阻塞的写方。
pub(crate) fn read<P, F>(
    guard: &mut MutexGuard<'_, P>,
    half: F,
    cond: &Condvar,
    dst: &mut [u8],
    timer: DeadlineTimer,
    addr: &MemAddr,
) -> Result<usize, PipeError>
where
    F: Fn(&mut P) -> &mut HalfConn,
{
    loop {
        let conn = half(&mut **guard);
        if conn.is_exhausted() {
            return Err(PipeError::EndOfStream);
        }
        if timer.has_expired(Instant::now()) {
            return Err(PipeError::timeout(addr, IoOp::Read));
        }
        if dst.is_empty() {
            return Ok(0);
        }
        if conn.pending() > 0 {
            let n = conn.take(dst);
            cond.notify_all();
            return Ok(n);
        }
        timer.wait(cond, guard);
    }
}

/// 写入在完成前被截止时间或对端关闭打断。
///
/// `written` 为打断前已进入缓冲的字节数，这些字节对读方仍然可见。
#[derive(Debug)]
pub(crate) struct ShortWrite {
    pub(crate) written: usize,
    pub(crate) error: PipeError,
}

/// 向 `half` 选出的缓冲写入，直到 `src` 全部写完、对端关闭或超时。
///
/// 缓冲满时阻塞；每写入一段立即唤醒读方。未能写完时返回 [`ShortWrite`]，
/// 由调用方决定按错误还是按短写处理。
pub(crate) fn write<P, F>(
    guard: &mut MutexGuard<'_, P>,
    half: F,
    cond: &Condvar,
    src: &[u8],
    timer: DeadlineTimer,
    addr: &MemAddr,
) -> Result<usize, ShortWrite>
where
    F: Fn(&mut P) -> &mut HalfConn,
{
    let mut written = 0;
    loop {
        let conn = half(&mut **guard);
        if conn.eof {
            return Err(ShortWrite {
                written,
                error: PipeError::EndOfStream,
            });
        }
        if timer.has_expired(Instant::now()) {
            return Err(ShortWrite {
                written,
                error: PipeError::timeout(addr, IoOp::Write),
            });
        }
        if written == src.len() {
            return Ok(written);
        }
        let n = conn.put(&src[written..]);
        if n > 0 {
            cond.notify_all();
            written += n;
            if written == src.len() {
                return Ok(written);
            }
        }
        timer.wait(cond, guard);
    }
}
