use std::fmt;
use std::sync::Arc;

/// 内存端点的地址：仅是一个可读名称。
///
/// 端点名称出现在超时错误文案中（`mock(<name>): read timeout`），便于在双端同时报错时区分来源。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemAddr(Arc<str>);

impl MemAddr {
    /// 构造地址。
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// 网络类型，固定为 `mock`。
    pub fn network(&self) -> &'static str {
        "mock"
    }

    /// 地址名称。
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemAddr {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MemAddr {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}
