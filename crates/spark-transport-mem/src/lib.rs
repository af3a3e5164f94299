#![doc = r#"
# spark-transport-mem

## 设计动机（Why）
- **替身连接**：为行协议客户端提供一条完全位于进程内的“套接字”，测试无需真实网络即可覆盖
  超时、半关闭与 TLS 升级等时序边界；
- **确定性**：读写只在缓冲区为空/已满时阻塞，且所有阻塞点都可被截止时间打断。

## 核心契约（What）
- [`MemConn::pair`]：创建一对互联端点，A 写入的字节按序出现在 B 的读侧，反之亦然；
- [`MemConn`] 同时实现 [`std::io::Read`] 与 [`std::io::Write`]，形状与真实连接一致；
- 截止时间（[`MemConn::set_deadline`] 等）与相对超时（[`MemConn::set_timeout`]）取较早者生效，
  超时以 [`PipeError::Timeout`] 报告；
- 任一端关闭后，双方所有阻塞及后续操作都会观察到流结束。

## 实现策略（How）
- 两个方向各自持有一个 `HalfConn` 缓冲，共享同一把 `parking_lot::Mutex`；
- 每个方向一个 `Condvar`，读写进度互相唤醒，截止时间通过 `Condvar::wait_until` 实现，
  无需轮询。
"#]

mod addr;
mod deadline;
mod duplex;
mod error;
mod half;

pub use addr::MemAddr;
pub use deadline::DeadlineTimer;
pub use duplex::{DEFAULT_BUFFER_SIZE, MemConn};
pub use error::{IoOp, PipeError};
