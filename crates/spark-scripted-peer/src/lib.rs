#![doc = r#"
# spark-scripted-peer

## 设计动机（Why）
- 行协议客户端的测试需要一个“会说协议”的对端，但真实服务端难以精确构造时序与异常；
- 本 crate 在 [`spark_transport_mem::MemConn`] 的一端上按脚本扮演服务端，另一端交给被测客户端，
  测试线程同步驱动客户端，脚本在独立线程上并发执行。

## 核心契约（What）
- [`ScriptedPeer`]：测试夹具，创建管道、生成临时 TLS 身份、交出客户端端点；
- [`script!`]：以 `"S: ..."`（对端发送）/ `"C: ..."`（期望客户端发送）书写脚本，字节串沿用上一条文本的方向，
  控制动作（STARTTLS、DEFLATE、CLOSE）原样插入；
- [`ConversationEngine`]：按顺序执行 [`Action`]，每次运行恰好产出一个 [`Outcome`]，
  [`ConversationEngine::join`] 同时报告对端与客户端两侧的失败；
- [`Surrogate`]：对端能力集，提供行读写、原始读写、压缩与 TLS 升级；
- [`TlsMaterial`]：显式构造、只读共享的自签名证书与信任配置；
- [`HarnessConfig`]：超时、缓冲、行分隔符与证书参数，可从 TOML 加载。

## 实现策略（How）
- 脚本动作是封闭的枚举，解释器穷尽匹配；
- 一次性结果通道以类型保证“只写一次”，并能区分“尚未完成”“已完成”“写端丢失”；
- TLS 基于 `rustls`（`ring` 密码套件），证书由 `rcgen` 生成，压缩基于 `flate2` 的原始 DEFLATE。
"#]

mod codec;
mod config;
mod engine;
mod harness;
mod outcome;
mod script;
mod surrogate;
mod tls;

pub use codec::DeflateStream;
pub use config::{ConfigError, HarnessConfig};
pub use engine::{ClientError, ConversationEngine, EngineError};
pub use harness::{CLIENT_ADDR, HarnessError, SERVER_ADDR, ScriptedPeer};
pub use outcome::{Outcome, Pending, Resolver, Settle, oneshot};
pub use script::{Action, Control, ControlFn, Literal, Script, ScriptError};
pub use surrogate::{Surrogate, SurrogateError};
pub use tls::{TlsMaterial, TlsMaterialError};
