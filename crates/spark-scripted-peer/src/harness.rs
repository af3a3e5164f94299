use std::sync::Arc;

use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use spark_transport_mem::MemConn;
use thiserror::Error;
use tracing::debug;

use crate::{
    ClientError, ConfigError, Control, ConversationEngine, EngineError, HarnessConfig, Literal,
    Script, Surrogate, TlsMaterial, TlsMaterialError,
};

/// 客户端端点名称。
pub const CLIENT_ADDR: &str = "client";
/// 对端端点名称。
pub const SERVER_ADDR: &str = "server";

/// 一次测试会话的夹具：内存管道、脚本引擎与临时 TLS 身份。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“建管道、设超时、包装对端、生成证书”这些样板集中起来，测试只需书写脚本与客户端调用。
///
/// ## 逻辑（How）
/// 1. 按配置创建一对端点，两端都应用 `io_timeout`；
/// 2. 服务端端点包装为 [`Surrogate`] 交给 [`ConversationEngine`]；
/// 3. 客户端端点保留到 [`ScriptedPeer::dial`] 被调用时交出；
/// 4. TLS 身份在构造时生成一次，以 `Arc` 共享给每个 STARTTLS 动作。
///
/// ## 契约（What）
/// - `dial` 只能调用一次，第二次返回 [`HarnessError::AlreadyDialed`]；
/// - `script` / `run` 与 `join` 成对出现，语义同 [`ConversationEngine`]；
/// - `start_tls` / `deflate` / `close` 产生预定义的控制动作，可直接放入 [`crate::script!`]。
///
/// ## 使用示例
/// ```ignore
/// let mut peer = ScriptedPeer::new(HarnessConfig::default())?;
/// let conn = peer.dial()?;
/// peer.script(script!["S: * OK ready", "C: A1 NOOP", "S: A1 OK done"])?;
/// let result = drive_client(conn);
/// peer.join(result)?;
/// ```
#[derive(Debug)]
pub struct ScriptedPeer {
    config: HarnessConfig,
    material: Arc<TlsMaterial>,
    client: Option<MemConn>,
    engine: ConversationEngine,
}

impl ScriptedPeer {
    /// 校验配置并生成本次会话专用的 TLS 身份。
    pub fn new(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let material = TlsMaterial::generate(config.tls_host(), config.cert_validity())?;
        Self::with_material(config, Arc::new(material))
    }

    /// 复用已有的 TLS 身份，适合在同一测试文件的多个会话间共享证书。
    pub fn with_material(
        config: HarnessConfig,
        material: Arc<TlsMaterial>,
    ) -> Result<Self, HarnessError> {
        config.validate()?;
        let (client, server) = MemConn::pair(CLIENT_ADDR, SERVER_ADDR, config.buffer_size());
        client.set_timeout(Some(config.io_timeout()));
        server.set_timeout(Some(config.io_timeout()));
        let surrogate = Surrogate::new(server, config.line_terminator());
        let engine = ConversationEngine::new(surrogate, config.join_timeout());
        debug!(
            server_name = config.server_name(),
            tls_host = material.host(),
            "scripted peer ready"
        );
        Ok(Self {
            config,
            material,
            client: Some(client),
            engine,
        })
    }

    /// 交出客户端端点。
    pub fn dial(&mut self) -> Result<MemConn, HarnessError> {
        self.client.take().ok_or(HarnessError::AlreadyDialed)
    }

    /// 客户端连接时使用的服务器名称。
    pub fn server_name(&self) -> &str {
        self.config.server_name()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn tls_material(&self) -> &Arc<TlsMaterial> {
        &self.material
    }

    /// 客户端发起 TLS 握手所需的信任配置。
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        self.material.client_config()
    }

    /// 客户端握手时校验的名称（证书主体）。
    pub fn tls_server_name(&self) -> ServerName<'static> {
        self.material.server_name()
    }

    /// 以字面量语法启动一次运行。
    pub fn script<I>(&mut self, literals: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Literal>,
    {
        self.engine.run_literals(literals)
    }

    /// 启动一次已构造好的脚本。
    pub fn run(&mut self, script: Script) -> Result<(), EngineError> {
        self.engine.run(script)
    }

    /// 汇合两侧结果，见 [`ConversationEngine::join`]。
    pub fn join<T, E>(&mut self, client: Result<T, E>) -> Result<T, EngineError>
    where
        E: Into<ClientError>,
    {
        self.engine.join(client)
    }

    /// STARTTLS 控制动作。
    pub fn start_tls(&self) -> Control {
        Control::start_tls(Arc::clone(&self.material))
    }

    /// DEFLATE 控制动作，压缩级别取自配置。
    pub fn deflate(&self) -> Control {
        Control::deflate(self.config.deflate_level())
    }

    /// CLOSE 控制动作。
    pub fn close(&self) -> Control {
        Control::close()
    }

    /// 空闲时的对端状态。
    pub fn surrogate(&self) -> Option<&Surrogate> {
        self.engine.surrogate()
    }

    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }
}

/// 夹具构造失败。
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tls(#[from] TlsMaterialError),
    #[error("client endpoint already dialed")]
    AlreadyDialed,
}
