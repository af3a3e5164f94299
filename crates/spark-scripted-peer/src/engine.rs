use std::any::Any;
use std::error::Error;
use std::io::{self, Read, Write};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::outcome::{self, Outcome, Pending, Settle};
use crate::{Action, Literal, Script, ScriptError, Surrogate, SurrogateError};

/// 被测客户端一侧的错误。
pub type ClientError = Box<dyn Error + Send + Sync + 'static>;

const RUNNER_THREAD: &str = "scripted-peer";

/// 脚本线程交还的运行报告：对端本身与本次运行的结果。
#[derive(Debug)]
struct RunReport {
    surrogate: Surrogate,
    outcome: Outcome,
}

#[derive(Debug)]
enum RunState {
    Idle(Surrogate),
    Running(Pending<RunReport>),
    /// 对端随一次未完成的运行一起丢失，引擎不可再用。
    Lost,
}

/// 在独立线程上对对端执行脚本，并在 `join` 处与测试线程汇合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 测试线程同步驱动真实客户端，脚本线程同时扮演服务端；两者只通过一次性结果通道汇合，
///   任何一侧的失败都在 `join` 中被完整报告。
///
/// ## 逻辑（How）
/// 1. `run` 把对端移交给新线程，线程内按顺序执行动作，以 `catch_unwind` 兜住内部故障；
/// 2. 线程结束时把对端连同结果一起送回，`join` 收回对端，引擎回到空闲状态；
/// 3. `join` 的等待上限是整体超时，必须长于单次 IO 超时，避免把挂起误判为通过。
///
/// ## 契约（What）
/// - 运行仍在进行时再次 `run` 返回 [`EngineError::RunInFlight`]；已结束但未被取走的旧结果会被丢弃；
/// - 未运行时 `join` 返回 [`EngineError::NoActiveRun`]，与成功严格区分；
/// - `join` 超时后对端视为丢失，之后的调用返回 [`EngineError::Lost`]；
/// - 每次运行恰好产生一个结果，包括格式错误的脚本与线程内 panic。
///
/// ## 状态机
/// `Idle --run--> Running --join--> Idle`；`Running --join 超时--> Lost`。
#[derive(Debug)]
pub struct ConversationEngine {
    state: RunState,
    join_timeout: Duration,
}

impl ConversationEngine {
    pub fn new(surrogate: Surrogate, join_timeout: Duration) -> Self {
        Self {
            state: RunState::Idle(surrogate),
            join_timeout,
        }
    }

    /// 空闲时可访问对端，用于检查压缩/加密/关闭状态。
    pub fn surrogate(&self) -> Option<&Surrogate> {
        match &self.state {
            RunState::Idle(surrogate) => Some(surrogate),
            _ => None,
        }
    }

    pub fn surrogate_mut(&mut self) -> Option<&mut Surrogate> {
        match &mut self.state {
            RunState::Idle(surrogate) => Some(surrogate),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running(_))
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    /// 在脚本线程上开始执行 `script`。
    pub fn run(&mut self, script: Script) -> Result<(), EngineError> {
        let mut surrogate = self.reclaim()?;
        let (resolver, pending) = outcome::oneshot();
        debug!(actions = script.len(), "script run started");
        let spawned = thread::Builder::new()
            .name(RUNNER_THREAD.to_owned())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    execute(&mut surrogate, script)
                }))
                .unwrap_or_else(|payload| {
                    Err(ScriptError::Fault {
                        message: panic_message(payload.as_ref()),
                    })
                });
                match &result {
                    Ok(()) => debug!("script run completed"),
                    Err(error) => debug!(%error, "script run failed"),
                }
                resolver.resolve(RunReport {
                    surrogate,
                    outcome: result.into(),
                });
            });
        match spawned {
            Ok(_) => {
                self.state = RunState::Running(pending);
                Ok(())
            }
            // 闭包随失败的 spawn 一同被丢弃，对端也随之关闭。
            Err(error) => Err(EngineError::Spawn(error)),
        }
    }

    /// 解析字面量并运行；格式错误作为本次运行的结果交付，不启动线程。
    pub fn run_literals<I>(&mut self, literals: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Literal>,
    {
        match Script::parse(literals) {
            Ok(script) => self.run(script),
            Err(error) => {
                let surrogate = self.reclaim()?;
                warn!(%error, "malformed script rejected");
                let (resolver, pending) = outcome::oneshot();
                resolver.resolve(RunReport {
                    surrogate,
                    outcome: Outcome::Failed(error),
                });
                self.state = RunState::Running(pending);
                Ok(())
            }
        }
    }

    /// 汇合点：等待脚本结果，并与客户端一侧的结果一起报告。
    ///
    /// 两侧都成功时返回客户端的值；任一侧失败返回 [`EngineError::Failed`]，两侧错误同时保留。
    pub fn join<T, E>(&mut self, client: Result<T, E>) -> Result<T, EngineError>
    where
        E: Into<ClientError>,
    {
        let pending = match mem::replace(&mut self.state, RunState::Lost) {
            RunState::Running(pending) => pending,
            RunState::Idle(surrogate) => {
                self.state = RunState::Idle(surrogate);
                return Err(EngineError::NoActiveRun);
            }
            RunState::Lost => return Err(EngineError::Lost),
        };

        let outcome = match pending.wait(self.join_timeout) {
            Settle::Ready(report) => {
                debug!(success = report.outcome.is_success(), "script outcome collected");
                self.state = RunState::Idle(report.surrogate);
                report.outcome
            }
            Settle::Pending => {
                warn!(timeout = ?self.join_timeout, "script outcome not delivered in time");
                return Err(EngineError::JoinTimeout {
                    timeout: self.join_timeout,
                    client: client.err().map(Into::into),
                });
            }
            Settle::Abandoned => Outcome::Failed(ScriptError::Fault {
                message: "script runner exited without reporting".to_owned(),
            }),
        };

        match (outcome, client) {
            (Outcome::Succeeded, Ok(value)) => Ok(value),
            (outcome, client) => Err(EngineError::Failed {
                surrogate: outcome.into_result().err(),
                client: client.err().map(Into::into),
            }),
        }
    }

    /// 取回空闲的对端；已结束但未被取走的旧结果在此丢弃。
    fn reclaim(&mut self) -> Result<Surrogate, EngineError> {
        match mem::replace(&mut self.state, RunState::Lost) {
            RunState::Idle(surrogate) => Ok(surrogate),
            RunState::Running(pending) => match pending.poll() {
                Settle::Ready(report) => {
                    if let Outcome::Failed(error) = &report.outcome {
                        warn!(%error, "discarding uncollected script outcome");
                    }
                    Ok(report.surrogate)
                }
                Settle::Pending => {
                    self.state = RunState::Running(pending);
                    Err(EngineError::RunInFlight)
                }
                Settle::Abandoned => Err(EngineError::Lost),
            },
            RunState::Lost => Err(EngineError::Lost),
        }
    }
}

fn execute(surrogate: &mut Surrogate, script: Script) -> Result<(), ScriptError> {
    for (i, action) in script.into_iter().enumerate() {
        let index = i + 1;
        debug!(index, kind = action.kind(), "script action");
        match action {
            Action::SendLine(line) => {
                send_line(surrogate, line.as_bytes()).map_err(|source| ScriptError::Write {
                    index,
                    sent: line,
                    source,
                })?;
            }
            Action::SendRaw(bytes) => {
                send_raw(surrogate, &bytes).map_err(|source| ScriptError::Write {
                    index,
                    sent: lossy(&bytes),
                    source,
                })?;
            }
            Action::RecvLine(expected) => match surrogate.read_line() {
                Ok(actual) if actual == expected.as_bytes() => {}
                Ok(actual) => {
                    return Err(ScriptError::Mismatch {
                        index,
                        expected,
                        actual: lossy(&actual),
                    });
                }
                Err(source) => {
                    return Err(ScriptError::Read {
                        index,
                        expected,
                        source,
                    });
                }
            },
            Action::RecvRaw(expected) => {
                let mut actual = vec![0u8; expected.len()];
                match surrogate.read_exact(&mut actual) {
                    Ok(()) if actual == expected => {}
                    Ok(()) => {
                        return Err(ScriptError::Mismatch {
                            index,
                            expected: lossy(&expected),
                            actual: lossy(&actual),
                        });
                    }
                    Err(error) => {
                        return Err(ScriptError::Read {
                            index,
                            expected: lossy(&expected),
                            source: error.into(),
                        });
                    }
                }
            }
            Action::Control(control) => {
                let name = control.name().to_owned();
                control
                    .apply(surrogate)
                    .map_err(|source| ScriptError::Control {
                        index,
                        name,
                        source,
                    })?;
            }
        }
    }
    Ok(())
}

fn send_line(surrogate: &mut Surrogate, line: &[u8]) -> Result<(), SurrogateError> {
    surrogate.write_line(line)?;
    surrogate.flush()
}

fn send_raw(surrogate: &mut Surrogate, bytes: &[u8]) -> Result<(), SurrogateError> {
    surrogate.write_all(bytes)?;
    surrogate.flush()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<unknown panic payload>".to_owned()
    }
}

/// 引擎使用错误与汇合结果。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a script run is still in flight")]
    RunInFlight,
    #[error("join called without an active script run")]
    NoActiveRun,
    #[error("script outcome not delivered within {timeout:?}{}", client_suffix(.client))]
    JoinTimeout {
        timeout: Duration,
        client: Option<ClientError>,
    },
    #[error("{}", describe_failure(.surrogate, .client))]
    Failed {
        surrogate: Option<ScriptError>,
        client: Option<ClientError>,
    },
    #[error("failed to spawn script runner: {0}")]
    Spawn(#[source] io::Error),
    #[error("surrogate lost with an unfinished run")]
    Lost,
}

impl EngineError {
    /// 对端一侧的脚本错误（若有）。
    pub fn surrogate_error(&self) -> Option<&ScriptError> {
        match self {
            EngineError::Failed { surrogate, .. } => surrogate.as_ref(),
            _ => None,
        }
    }

    /// 客户端一侧的错误（若有）。
    pub fn client_error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            EngineError::Failed { client, .. } | EngineError::JoinTimeout { client, .. } => {
                client.as_deref()
            }
            _ => None,
        }
    }
}

fn client_suffix(client: &Option<ClientError>) -> String {
    client
        .as_ref()
        .map(|error| format!("; (client) {error}"))
        .unwrap_or_default()
}

fn describe_failure(surrogate: &Option<ScriptError>, client: &Option<ClientError>) -> String {
    let mut parts = Vec::with_capacity(2);
    if let Some(error) = surrogate {
        parts.push(format!("(surrogate) {error}"));
    }
    if let Some(error) = client {
        parts.push(format!("(client) {error}"));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Control;
    use spark_transport_mem::MemConn;

    fn engine() -> (MemConn, ConversationEngine) {
        let (client, server) = MemConn::pair("client", "server", 0);
        client.set_timeout(Some(Duration::from_secs(2)));
        server.set_timeout(Some(Duration::from_secs(2)));
        let surrogate = Surrogate::new(server, "\r\n");
        (client, ConversationEngine::new(surrogate, Duration::from_secs(5)))
    }

    #[test]
    fn join_without_run_is_not_a_success() {
        let (_client, mut engine) = engine();
        let err = engine.join(Ok::<_, io::Error>(())).expect_err("未运行时 join 必须失败");
        assert!(matches!(err, EngineError::NoActiveRun));
        assert!(engine.surrogate().is_some(), "对端仍归引擎所有");
    }

    #[test]
    fn empty_script_succeeds() {
        let (_client, mut engine) = engine();
        engine.run(Script::new()).expect("启动应成功");
        engine.join(Ok::<_, io::Error>(())).expect("空脚本应成功");
        assert!(!engine.is_running());
    }

    #[test]
    fn panicking_control_becomes_a_fault() {
        let (_client, mut engine) = engine();
        let script = Script::new().control(Control::new("boom", |_: &mut Surrogate| {
            panic!("control exploded")
        }));
        engine.run(script).expect("启动应成功");
        let err = engine.join(Ok::<_, io::Error>(())).expect_err("panic 必须转为失败结果");
        match err.surrogate_error() {
            Some(ScriptError::Fault { message }) => assert_eq!(message, "control exploded"),
            other => panic!("期望 Fault，实际 {other:?}"),
        }
        assert!(engine.surrogate().is_some(), "panic 后对端仍被交还");
    }

    #[test]
    fn stale_outcome_is_discarded_by_the_next_run() {
        let (_client, mut engine) = engine();
        // 格式错误的脚本立即产出结果，但不被取走。
        engine
            .run_literals(crate::script!["bad line"])
            .expect("格式错误作为结果交付");
        engine.run(Script::new()).expect("已结束的旧结果不应阻止新运行");
        engine.join(Ok::<_, io::Error>(())).expect("新运行应成功");
    }

    #[test]
    fn client_and_surrogate_failures_are_both_reported() {
        let (client, mut engine) = engine();
        engine
            .run(Script::new().recv_line("A1 NOOP"))
            .expect("启动应成功");
        client.send(b"A1 LOGOUT\r\n").expect("客户端写入应成功");
        let client_result: Result<(), io::Error> =
            Err(io::Error::other("client gave up"));
        let err = engine.join(client_result).expect_err("两侧都失败");
        assert!(matches!(
            err.surrogate_error(),
            Some(ScriptError::Mismatch { index: 1, .. })
        ));
        assert_eq!(
            err.client_error().map(ToString::to_string).as_deref(),
            Some("client gave up")
        );
        let text = err.to_string();
        assert!(text.contains("(surrogate)") && text.contains("(client)"), "{text}");
    }
}
