use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 脚本化对端的运行参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 集中描述一次测试会话的时间预算、缓冲大小、行分隔符与证书参数；
/// - 既可在代码中以 `with_*` 链式构造，也可从 TOML 片段加载，便于在多个测试文件间共享配置。
///
/// ## 契约（What）
/// - `io_timeout`：两端每次读写调用的相对超时；
/// - `join_timeout`：`join` 等待脚本结果的总上限，必须大于 `io_timeout`，否则单次 IO 的挂起会被
///   误判为会话超时；
/// - `line_terminator`：写行时追加、读行时剥离的分隔符，不能为空；
/// - `deflate_level`：取值 0..=9；
/// - `buffer_size` 为 0 时使用管道默认容量。
///
/// ## 注意事项（Trade-offs）
/// - TOML 中时间以毫秒/秒整数表示，未出现的字段取默认值，未知字段直接报错。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    server_name: String,
    tls_host: String,
    io_timeout_ms: u64,
    join_timeout_ms: u64,
    buffer_size: usize,
    line_terminator: String,
    deflate_level: u32,
    cert_validity_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server_name: "imap.mock.net".to_owned(),
            tls_host: "localhost".to_owned(),
            io_timeout_ms: 500,
            join_timeout_ms: 5_000,
            buffer_size: 0,
            line_terminator: "\r\n".to_owned(),
            deflate_level: 6,
            cert_validity_secs: 300,
        }
    }
}

impl HarnessConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段之间的约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.line_terminator.is_empty() {
            return Err(ConfigError::invalid("line_terminator", "must not be empty"));
        }
        if self.tls_host.is_empty() {
            return Err(ConfigError::invalid("tls_host", "must not be empty"));
        }
        // 零超时会让每次管道读写在检查数据前就判定过期。
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::invalid("io_timeout_ms", "must be positive"));
        }
        if self.join_timeout_ms <= self.io_timeout_ms {
            return Err(ConfigError::invalid(
                "join_timeout_ms",
                "must be longer than io_timeout_ms",
            ));
        }
        if self.deflate_level > 9 {
            return Err(ConfigError::invalid("deflate_level", "must be within 0..=9"));
        }
        if self.cert_validity_secs == 0 {
            return Err(ConfigError::invalid("cert_validity_secs", "must be positive"));
        }
        Ok(())
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn tls_host(&self) -> &str {
        &self.tls_host
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn line_terminator(&self) -> &str {
        &self.line_terminator
    }

    pub fn deflate_level(&self) -> u32 {
        self.deflate_level
    }

    pub fn cert_validity(&self) -> Duration {
        Duration::from_secs(self.cert_validity_secs)
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_tls_host(mut self, host: impl Into<String>) -> Self {
        self.tls_host = host.into();
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    pub fn with_deflate_level(mut self, level: u32) -> Self {
        self.deflate_level = level;
        self
    }

    pub fn with_cert_validity(mut self, validity: Duration) -> Self {
        self.cert_validity_secs = validity.as_secs();
        self
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// 配置加载与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("harness config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("harness config field `{field}` {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { field, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_mock_server_conventions() {
        let config = HarnessConfig::default();
        assert_eq!(config.server_name(), "imap.mock.net");
        assert_eq!(config.io_timeout(), Duration::from_millis(500));
        assert_eq!(config.join_timeout(), Duration::from_secs(5));
        assert_eq!(config.line_terminator(), "\r\n");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = HarnessConfig::from_toml_str(
            r#"
            io_timeout_ms = 200
            line_terminator = "\n"
            "#,
        )
        .expect("合法 TOML 应被接受");
        assert_eq!(config.io_timeout(), Duration::from_millis(200));
        assert_eq!(config.line_terminator(), "\n");
        assert_eq!(config.tls_host(), "localhost", "未出现的字段保持默认值");
    }

    #[test]
    fn join_timeout_must_exceed_io_timeout() {
        let err = HarnessConfig::from_toml_str("io_timeout_ms = 5000\njoin_timeout_ms = 1000")
            .expect_err("join 上限短于单次 IO 超时必须拒绝");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "join_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = HarnessConfig::from_toml_str("retries = 3").expect_err("未知字段必须报错");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_terminator_is_invalid() {
        let config = HarnessConfig::default().with_line_terminator("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_io_timeout_is_rejected() {
        let config = HarnessConfig::default().with_io_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "io_timeout_ms",
                ..
            })
        ));
        assert!(HarnessConfig::from_toml_str("io_timeout_ms = 0").is_err());
    }
}
