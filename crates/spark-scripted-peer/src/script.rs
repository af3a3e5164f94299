use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::{Surrogate, SurrogateError, TlsMaterial};

/// 控制动作的函数体。
pub type ControlFn = Box<dyn FnOnce(&mut Surrogate) -> Result<(), SurrogateError> + Send + 'static>;

/// 修改对端状态的脚本动作（启用 TLS、启用压缩、关闭连接或自定义函数）。
pub struct Control {
    name: Cow<'static, str>,
    run: ControlFn,
}

impl Control {
    /// 以名称与函数构造自定义控制动作；名称出现在失败报告中。
    pub fn new<F>(name: impl Into<Cow<'static, str>>, run: F) -> Self
    where
        F: FnOnce(&mut Surrogate) -> Result<(), SurrogateError> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    /// STARTTLS：使用 `material` 的服务端身份完成握手。
    pub fn start_tls(material: Arc<TlsMaterial>) -> Self {
        Self::new("STARTTLS", move |surrogate: &mut Surrogate| {
            surrogate.enable_tls(material.server_config())
        })
    }

    /// DEFLATE：启用压缩。
    pub fn deflate(level: u32) -> Self {
        Self::new("DEFLATE", move |surrogate: &mut Surrogate| {
            surrogate.enable_deflate(level)
        })
    }

    /// CLOSE：刷新后关闭连接。
    pub fn close() -> Self {
        Self::new("CLOSE", |surrogate: &mut Surrogate| surrogate.close(true))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn apply(self, surrogate: &mut Surrogate) -> Result<(), SurrogateError> {
        (self.run)(surrogate)
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Control").field(&self.name).finish()
    }
}

/// 脚本中的单个动作。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `SendLine`：对端写出一行（隐式追加行分隔符）并刷新；
/// - `RecvLine`：对端读入一行，与期望文本逐字节比较；
/// - `SendRaw` / `RecvRaw`：按精确字节数收发，无分隔符语义，用于跨行字面量；
/// - `Control`：对对端能力集调用函数，失败即终止本次运行。
///
/// ## 设计取舍（Trade-offs）
/// - 封闭的枚举让解释器穷尽匹配，新增动作类型会在编译期暴露所有未处理的分支。
#[derive(Debug)]
pub enum Action {
    SendLine(String),
    RecvLine(String),
    SendRaw(Vec<u8>),
    RecvRaw(Vec<u8>),
    Control(Control),
}

impl Action {
    /// 动作类别名，用于日志。
    pub fn kind(&self) -> &'static str {
        match self {
            Action::SendLine(_) => "send_line",
            Action::RecvLine(_) => "recv_line",
            Action::SendRaw(_) => "send_raw",
            Action::RecvRaw(_) => "recv_raw",
            Action::Control(_) => "control",
        }
    }
}

impl From<Control> for Action {
    fn from(control: Control) -> Self {
        Action::Control(control)
    }
}

/// 文本形式的脚本条目。
///
/// - 以 `S: ` 开头的文本：对端发送；以 `C: ` 开头的文本：期望客户端发送；
/// - 字节串：沿用最近一条带前缀文本的方向（`S:` 之后为原始发送，`C:` 之后为原始接收）；
/// - 控制动作与已构造好的 [`Action`] 原样保留。
#[derive(Debug)]
pub enum Literal {
    Text(String),
    Bytes(Vec<u8>),
    Action(Action),
}

impl From<&str> for Literal {
    fn from(text: &str) -> Self {
        Literal::Text(text.to_owned())
    }
}

impl From<String> for Literal {
    fn from(text: String) -> Self {
        Literal::Text(text)
    }
}

impl From<Vec<u8>> for Literal {
    fn from(bytes: Vec<u8>) -> Self {
        Literal::Bytes(bytes)
    }
}

impl From<&[u8]> for Literal {
    fn from(bytes: &[u8]) -> Self {
        Literal::Bytes(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Literal {
    fn from(bytes: &[u8; N]) -> Self {
        Literal::Bytes(bytes.to_vec())
    }
}

impl From<Control> for Literal {
    fn from(control: Control) -> Self {
        Literal::Action(Action::Control(control))
    }
}

impl From<Action> for Literal {
    fn from(action: Action) -> Self {
        Literal::Action(action)
    }
}

/// 以字面量语法书写脚本，展开为 `Vec<Literal>`。
///
/// ```ignore
/// peer.script(script![
///     "S: * OK ready",
///     "C: A1 NOOP",
///     "S: A1 OK done",
/// ])?;
/// ```
#[macro_export]
macro_rules! script {
    ($($item:expr),* $(,)?) => {
        ::std::vec![$($crate::Literal::from($item)),*]
    };
}

const SEND_PREFIX: &str = "S: ";
const RECV_PREFIX: &str = "C: ";

#[derive(Clone, Copy)]
enum Direction {
    Send,
    Recv,
}

/// 有序的动作序列。
#[derive(Debug, Default)]
pub struct Script {
    actions: Vec<Action>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析字面量；索引从 1 开始计数。
    pub fn parse<I>(literals: I) -> Result<Self, ScriptError>
    where
        I: IntoIterator<Item = Literal>,
    {
        let mut actions = Vec::new();
        let mut last: Option<Direction> = None;
        for (i, literal) in literals.into_iter().enumerate() {
            let index = i + 1;
            let action = match literal {
                Literal::Text(text) => {
                    if let Some(line) = text.strip_prefix(SEND_PREFIX) {
                        last = Some(Direction::Send);
                        Action::SendLine(line.to_owned())
                    } else if let Some(line) = text.strip_prefix(RECV_PREFIX) {
                        last = Some(Direction::Recv);
                        Action::RecvLine(line.to_owned())
                    } else {
                        return Err(ScriptError::Malformed {
                            index,
                            reason: format!(
                                "{text:?} must be prefixed with {SEND_PREFIX:?} or {RECV_PREFIX:?}"
                            ),
                        });
                    }
                }
                Literal::Bytes(bytes) => match last {
                    Some(Direction::Send) => Action::SendRaw(bytes),
                    Some(Direction::Recv) => Action::RecvRaw(bytes),
                    None => {
                        return Err(ScriptError::Malformed {
                            index,
                            reason: "raw bytes must follow an \"S: \" or \"C: \" line".to_owned(),
                        });
                    }
                },
                Literal::Action(action) => action,
            };
            actions.push(action);
        }
        Ok(Self { actions })
    }

    pub fn push(&mut self, action: impl Into<Action>) {
        self.actions.push(action.into());
    }

    pub fn send_line(mut self, line: impl Into<String>) -> Self {
        self.actions.push(Action::SendLine(line.into()));
        self
    }

    pub fn recv_line(mut self, line: impl Into<String>) -> Self {
        self.actions.push(Action::RecvLine(line.into()));
        self
    }

    pub fn send_raw(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.actions.push(Action::SendRaw(bytes.into()));
        self
    }

    pub fn recv_raw(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.actions.push(Action::RecvRaw(bytes.into()));
        self
    }

    pub fn control(mut self, control: Control) -> Self {
        self.actions.push(Action::Control(control));
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

impl FromIterator<Action> for Script {
    fn from_iter<T: IntoIterator<Item = Action>>(iter: T) -> Self {
        Self {
            actions: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Script {
    type Item = Action;
    type IntoIter = std::vec::IntoIter<Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.actions.into_iter()
    }
}

/// 脚本运行失败的原因；`index` 为动作在脚本中的位置（从 1 开始）。
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("[#{index}] {sent:?} write error: {source}")]
    Write {
        index: usize,
        sent: String,
        #[source]
        source: SurrogateError,
    },
    #[error("[#{index}] expected {expected:?}; got {actual:?}")]
    Mismatch {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("[#{index}] expected {expected:?}; read error: {source}")]
    Read {
        index: usize,
        expected: String,
        #[source]
        source: SurrogateError,
    },
    #[error("[#{index}] control {name} failed: {source}")]
    Control {
        index: usize,
        name: String,
        #[source]
        source: SurrogateError,
    },
    #[error("[#{index}] malformed script entry: {reason}")]
    Malformed { index: usize, reason: String },
    #[error("script run faulted: {message}")]
    Fault { message: String },
}

impl ScriptError {
    /// 失败动作的索引；内部故障没有索引。
    pub fn index(&self) -> Option<usize> {
        match self {
            ScriptError::Write { index, .. }
            | ScriptError::Mismatch { index, .. }
            | ScriptError::Read { index, .. }
            | ScriptError::Control { index, .. }
            | ScriptError::Malformed { index, .. } => Some(*index),
            ScriptError::Fault { .. } => None,
        }
    }
}
