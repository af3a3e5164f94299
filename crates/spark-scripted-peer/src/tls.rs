use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

/// 一次性生成的自签名证书及其配套信任配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 脚本中的 STARTTLS 动作需要服务端身份，被测客户端需要信任该身份；
/// - 由测试夹具在启动时显式构造并以 `Arc` 传入每个 TLS 动作，证书生命周期清晰可见，
///   不存在隐藏的全局可变状态。
///
/// ## 逻辑（How）
/// 1. 借助 `rcgen` 生成 ECDSA 密钥与以 `host` 为 SAN/CN 的自签名证书，有效期从当前时刻起
///    持续 `validity`；
/// 2. 使用 `ring` 密码套件构建 `rustls::ServerConfig`（不要求客户端证书）；
/// 3. 把同一张证书放入 `RootCertStore`，构建只信任它的 `rustls::ClientConfig`。
///
/// ## 契约（What）
/// - `server_config`：交给 [`crate::Surrogate::enable_tls`] 完成服务端握手；
/// - `client_config` + `server_name`：被测客户端发起握手时使用；
/// - 生成失败（例如随机源不可用）返回 [`TlsMaterialError`]，测试夹具无法继续。
pub struct TlsMaterial {
    host: String,
    server_name: ServerName<'static>,
    certificate: CertificateDer<'static>,
    not_after: OffsetDateTime,
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

impl TlsMaterial {
    /// 为 `host` 生成有效期为 `validity` 的证书与配置。
    pub fn generate(host: &str, validity: Duration) -> Result<Self, TlsMaterialError> {
        let server_name = ServerName::try_from(host)
            .map_err(|_| TlsMaterialError::InvalidHost(host.to_owned()))?
            .to_owned();

        let not_before = OffsetDateTime::now_utc();
        let span = time::Duration::try_from(validity).map_err(|_| TlsMaterialError::Validity)?;
        let not_after = not_before
            .checked_add(span)
            .ok_or(TlsMaterialError::Validity)?;

        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![host.to_owned()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.not_before = not_before;
        params.not_after = not_after;
        let certificate = params.self_signed(&key_pair)?.der().clone();
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![certificate.clone()], private_key)?;

        let mut roots = RootCertStore::empty();
        roots.add(certificate.clone())?;
        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        debug!(host, %not_after, "ephemeral tls material generated");
        Ok(Self {
            host: host.to_owned(),
            server_name,
            certificate,
            not_after,
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    /// 证书绑定的主机名。
    pub fn host(&self) -> &str {
        &self.host
    }

    /// 客户端握手时使用的服务器名称。
    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }

    /// 证书 DER 编码。
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// 证书失效时刻。
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// 服务端 TLS 配置。
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server)
    }

    /// 只信任本证书的客户端 TLS 配置。
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client)
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("host", &self.host)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// 证书生成或 TLS 配置构建失败。
#[derive(Debug, Error)]
pub enum TlsMaterialError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("tls configuration failed: {0}")]
    Config(#[from] rustls::Error),
    #[error("`{0}` is not a valid tls server name")]
    InvalidHost(String),
    #[error("certificate validity window out of range")]
    Validity,
}
