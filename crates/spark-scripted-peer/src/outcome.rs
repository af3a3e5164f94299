use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::Duration;

use crate::ScriptError;

/// 一次脚本运行的结果。
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    Failed(ScriptError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// 转换为 `Result`，便于在测试中直接使用 `?`。
    pub fn into_result(self) -> Result<(), ScriptError> {
        match self {
            Outcome::Succeeded => Ok(()),
            Outcome::Failed(error) => Err(error),
        }
    }
}

impl From<Result<(), ScriptError>> for Outcome {
    fn from(result: Result<(), ScriptError>) -> Self {
        match result {
            Ok(()) => Outcome::Succeeded,
            Err(error) => Outcome::Failed(error),
        }
    }
}

/// 等待一次性结果时观察到的状态。
#[derive(Debug)]
pub enum Settle<T> {
    /// 结果尚未送达。
    Pending,
    Ready(T),
    /// 写端在送达前被丢弃，结果永远不会出现。
    Abandoned,
}

/// 创建一对一次性结果通道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 脚本线程与测试线程之间只交换一个值；把“写入一次”编码进类型，而不是靠调用方自律。
///
/// ## 逻辑（How）
/// - 底层是容量为 1 的 `mpsc::sync_channel`；[`Resolver::resolve`] 按值消费自身，
///   因此同一个写端不可能发送两次；
/// - 写端被丢弃而未发送时，读端观察到 [`Settle::Abandoned`]，可与“尚未完成”区分。
///
/// ## 契约（What）
/// - 读端取到 `Ready` 之后再次查询只会得到 `Abandoned`，值只交付一次。
pub fn oneshot<T>() -> (Resolver<T>, Pending<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Resolver { tx }, Pending { rx })
}

/// 一次性结果的写端。
#[derive(Debug)]
pub struct Resolver<T> {
    tx: SyncSender<T>,
}

impl<T> Resolver<T> {
    /// 送达结果；读端已丢弃时静默忽略。
    pub fn resolve(self, value: T) {
        // 容量为 1 且只发送一次，不会阻塞。
        let _ = self.tx.send(value);
    }
}

/// 一次性结果的读端。
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<T>,
}

impl<T> Pending<T> {
    /// 非阻塞查询。
    pub fn poll(&self) -> Settle<T> {
        match self.rx.try_recv() {
            Ok(value) => Settle::Ready(value),
            Err(TryRecvError::Empty) => Settle::Pending,
            Err(TryRecvError::Disconnected) => Settle::Abandoned,
        }
    }

    /// 最多等待 `timeout`。
    pub fn wait(&self, timeout: Duration) -> Settle<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Settle::Ready(value),
            Err(RecvTimeoutError::Timeout) => Settle::Pending,
            Err(RecvTimeoutError::Disconnected) => Settle::Abandoned,
        }
    }
}
