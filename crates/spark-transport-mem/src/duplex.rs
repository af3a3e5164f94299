use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::half::{self, HalfConn, ShortWrite};
use crate::{DeadlineTimer, MemAddr, PipeError};

/// `buf_size == 0` 时使用的单向缓冲容量。
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Default)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
    timeout: Option<Duration>,
}

/// 互斥锁保护的全部共享状态：两个方向的缓冲以及两端各自的截止时间。
#[derive(Debug)]
struct Pipe {
    halves: [HalfConn; 2],
    deadlines: [Deadlines; 2],
}

#[derive(Debug)]
struct Shared {
    pipe: Mutex<Pipe>,
    ready: [Condvar; 2],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    A,
    B,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    // A 读 `halves[0]`、写 `halves[1]`；B 相反。
    fn reads(self) -> usize {
        self.index()
    }

    fn writes(self) -> usize {
        1 - self.index()
    }
}

/// 内存双工通道的一个端点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 作为真实网络连接的替身交给被测客户端：提供读、写、关闭与截止时间设置，形状与
///   `TcpStream` 一致，无需适配层；
/// - 另一端交给脚本化对端驱动，两端在各自线程上并发阻塞读写。
///
/// ## 逻辑（How）
/// - 两个端点共享一把互斥锁，锁内保存两个方向的 `HalfConn` 与两端的截止时间，
///   因此修改截止时间与进行中的 IO 判定互相原子；
/// - 阻塞等待期间锁被原子释放，对端可以继续推进；
/// - 读侧观察到流结束时关闭整个通道，模拟“客户端半关闭即视为全关闭”的协议管道语义。
///
/// ## 契约（What）
/// - [`MemConn::recv`] / [`MemConn::send`]：返回结构化的 [`PipeError`]；`send` 未写完即报错；
/// - `io::Read`：流结束时返回 `Ok(0)`；`io::Write`：对端关闭后返回 `BrokenPipe`；
/// - [`MemConn::close`] 幂等；端点被丢弃时自动关闭；
/// - [`MemConn::clear`] 仅用于测试：清空两个方向的缓冲并唤醒所有等待者，但不关闭通道。
pub struct MemConn {
    shared: Arc<Shared>,
    side: Side,
    local: MemAddr,
    peer: MemAddr,
}

impl MemConn {
    /// 创建一对互联端点 `(A, B)`。`buf_size` 为每个方向的缓冲容量，0 表示使用默认值。
    pub fn pair(
        addr_a: impl Into<MemAddr>,
        addr_b: impl Into<MemAddr>,
        buf_size: usize,
    ) -> (MemConn, MemConn) {
        let cap = if buf_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buf_size
        };
        let shared = Arc::new(Shared {
            pipe: Mutex::new(Pipe {
                halves: [HalfConn::new(cap), HalfConn::new(cap)],
                deadlines: [Deadlines::default(); 2],
            }),
            ready: [Condvar::new(), Condvar::new()],
        });
        let addr_a = addr_a.into();
        let addr_b = addr_b.into();
        let a = MemConn {
            shared: Arc::clone(&shared),
            side: Side::A,
            local: addr_a.clone(),
            peer: addr_b.clone(),
        };
        let b = MemConn {
            shared,
            side: Side::B,
            local: addr_b,
            peer: addr_a,
        };
        (a, b)
    }

    /// 本端地址。
    pub fn local_addr(&self) -> &MemAddr {
        &self.local
    }

    /// 对端地址。
    pub fn peer_addr(&self) -> &MemAddr {
        &self.peer
    }

    /// 读取当前可用的字节；没有数据时阻塞。流结束时返回 [`PipeError::EndOfStream`]
    /// 并关闭整个通道。
    pub fn recv(&self, dst: &mut [u8]) -> Result<usize, PipeError> {
        let mut pipe = self.shared.pipe.lock();
        let deadlines = pipe.deadlines[self.side.index()];
        let timer = DeadlineTimer::new(deadlines.read, deadlines.timeout);
        let idx = self.side.reads();
        let result = half::read(
            &mut pipe,
            |pipe: &mut Pipe| &mut pipe.halves[idx],
            &self.shared.ready[idx],
            dst,
            timer,
            &self.local,
        );
        if matches!(result, Err(PipeError::EndOfStream)) {
            self.close_locked(&mut pipe);
        }
        result
    }

    /// 写入全部字节；缓冲满时阻塞。
    ///
    /// 只有 `src` 全部写入才返回 `Ok`。中途超时或对端关闭时返回对应错误，
    /// 此前已进入缓冲的字节仍会被对端读到。
    pub fn send(&self, src: &[u8]) -> Result<usize, PipeError> {
        self.write_half(src).map_err(|short| short.error)
    }

    fn write_half(&self, src: &[u8]) -> Result<usize, ShortWrite> {
        let mut pipe = self.shared.pipe.lock();
        let deadlines = pipe.deadlines[self.side.index()];
        let timer = DeadlineTimer::new(deadlines.write, deadlines.timeout);
        let idx = self.side.writes();
        half::write(
            &mut pipe,
            |pipe: &mut Pipe| &mut pipe.halves[idx],
            &self.shared.ready[idx],
            src,
            timer,
            &self.local,
        )
    }

    /// 同时设置读写截止时间；`None` 清除截止时间。
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.update_deadlines(|d| {
            d.read = deadline;
            d.write = deadline;
        });
    }

    /// 设置读截止时间。
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.update_deadlines(|d| d.read = deadline);
    }

    /// 设置写截止时间。
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.update_deadlines(|d| d.write = deadline);
    }

    /// 设置每次读写调用的相对超时；`None` 表示无限期阻塞，`Some(Duration::ZERO)` 表示不等待。
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.update_deadlines(|d| d.timeout = timeout);
    }

    /// 当前相对超时。
    pub fn timeout(&self) -> Option<Duration> {
        self.shared.pipe.lock().deadlines[self.side.index()].timeout
    }

    /// 关闭通道：两个方向都标记流结束，唤醒所有阻塞者。重复关闭不做任何事。
    pub fn close(&self) {
        let mut pipe = self.shared.pipe.lock();
        self.close_locked(&mut pipe);
    }

    /// 通道是否已关闭：任一端调用过 `close`，且本端已无未读字节。
    pub fn is_closed(&self) -> bool {
        self.shared.pipe.lock().halves[self.side.reads()].is_exhausted()
    }

    /// 清空两个方向的未读字节并唤醒所有等待者，不改变关闭状态。
    pub fn clear(&self) {
        let mut pipe = self.shared.pipe.lock();
        for half in pipe.halves.iter_mut() {
            half.clear();
        }
        self.notify_all();
        trace!(addr = %self.local, "mem conn cleared");
    }

    fn update_deadlines(&self, update: impl FnOnce(&mut Deadlines)) {
        let mut pipe = self.shared.pipe.lock();
        update(&mut pipe.deadlines[self.side.index()]);
    }

    fn close_locked(&self, pipe: &mut MutexGuard<'_, Pipe>) {
        let idx = self.side.reads();
        if pipe.halves[idx].is_released() {
            return;
        }
        pipe.halves[idx].release();
        for half in pipe.halves.iter_mut() {
            half.set_eof();
        }
        self.notify_all();
        trace!(addr = %self.local, peer = %self.peer, "mem conn closed");
    }

    fn notify_all(&self) {
        for cond in &self.shared.ready {
            cond.notify_all();
        }
    }
}

impl Drop for MemConn {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MemConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemConn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl io::Read for &MemConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.recv(buf) {
            Ok(n) => Ok(n),
            Err(PipeError::EndOfStream) => Ok(0),
            Err(error) => Err(error.into()),
        }
    }
}

// 短写按 `io::Write` 惯例返回已写字节数，错误留给 `write_all` 的下一次调用。
impl io::Write for &MemConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_half(buf) {
            Ok(n) => Ok(n),
            Err(ShortWrite { written, .. }) if written > 0 => Ok(written),
            Err(ShortWrite { error, .. }) => Err(error.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for MemConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl io::Write for MemConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
