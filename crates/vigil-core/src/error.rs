//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为配置解析、数据流、定时调度与服务生命周期提供统一的错误域，调用方只需匹配一个枚举；
//! - 每个变体都映射到稳定错误码（`vigil.*`），日志与告警系统据此聚合，而不依赖自然语言文案。
//!
//! ## 设计要求（What）
//! - 所有变体实现 `thiserror::Error`，可直接 `?` 传播；
//! - [`VigilError::category`] 给出可重试性判断，IO 错误按 `io::ErrorKind` 细分；
//! - 枚举标记为 `#[non_exhaustive]`，下游匹配需保留通配分支。

use std::borrow::Cow;
use std::io;

use thiserror::Error;

use crate::data_flow::DataFlowId;
use crate::service::ServiceState;

/// crate 内统一的 `Result` 别名。
pub type Result<T, E = VigilError> = core::result::Result<T, E>;

/// 稳定错误码表。
///
/// 文案可以演进，错误码一经发布不再修改。
pub mod codes {
    pub const PARSE: &str = "vigil.options.parse";
    pub const NOT_FOUND: &str = "vigil.options.not_found";
    pub const CONFIG: &str = "vigil.config.invalid";
    pub const CONNECT: &str = "vigil.transport.connect_failed";
    pub const TRANSPORT: &str = "vigil.transport.io_failed";
    pub const INVALID_TRANSITION: &str = "vigil.service.invalid_transition";
    pub const LIFECYCLE: &str = "vigil.lifecycle.violation";
    pub const ENCODE: &str = "vigil.record.encode_failed";
}

/// 错误的处置分类。
///
/// - `Retryable`：瞬时故障，下一次定时节拍可以再试；
/// - `NonRetryable`：输入或环境本身有问题，重试无意义；
/// - `Misuse`：调用顺序违反契约，需要修正调用方代码。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    Retryable,
    NonRetryable,
    Misuse,
}

/// vigil 的统一错误类型。
///
/// # 教案式说明
/// - **意图 (Why)**：覆盖配置、传输、状态机与生命周期四类失败，保证上层在一个 `match` 中完成分流；
/// - **契约 (What)**：
///   - 传输类变体携带底层 `io::Error` 作为 `source`，便于保留完整错误链；
///   - 状态机与生命周期变体只描述调用方的误用，不会由网络状况触发；
/// - **注意事项 (Trade-offs)**：上下文字段使用 `String`，牺牲少量分配换取可读的诊断信息。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VigilError {
    /// 配置文本结构不合法（缩进错乱、悬空的子块等）。
    #[error("malformed options at line {line}: {reason}")]
    Parse {
        line: usize,
        reason: Cow<'static, str>,
    },

    /// 语法正确但语义不满足要求：缺少必填项、数值非法、标识重复。
    #[error("invalid configuration for `{key}`: {reason}")]
    Config { key: String, reason: String },

    /// `find_sub_option` 未命中。
    #[error("option `{name}` not found")]
    NotFound { name: String },

    /// 建立连接失败：地址解析失败、对端拒绝或超时。
    #[error("{operation} to {endpoint} failed: {source}")]
    Connect {
        operation: &'static str,
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// 已建立的数据流在发送或关闭时失败，数据流不会自行重试。
    #[error("data flow {flow} {operation} failed: {source}")]
    Transport {
        flow: DataFlowId,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// 服务状态机拒绝的跃迁。
    #[error("service `{service}`: transition {from} -> {to} is not permitted")]
    InvalidStateTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },

    /// 生命周期顺序被破坏，例如环境仍有存活服务时关闭，或在关闭后继续使用。
    #[error("lifecycle violation in {context}: {detail}")]
    Lifecycle {
        context: &'static str,
        detail: String,
    },

    /// 监控记录序列化失败。
    #[error("failed to encode monitoring record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl VigilError {
    pub(crate) fn parse(line: usize, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    /// 构造配置错误，`key` 为出问题的配置项名称。
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// 构造生命周期错误。
    pub fn lifecycle(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Lifecycle {
            context,
            detail: detail.into(),
        }
    }

    /// 构造连接错误，供传输实现使用。
    pub fn connect(operation: &'static str, endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            operation,
            endpoint: endpoint.into(),
            source,
        }
    }

    /// 构造数据流 IO 错误，供传输实现使用。
    pub fn transport(flow: DataFlowId, operation: &'static str, source: io::Error) -> Self {
        Self::Transport {
            flow,
            operation,
            source,
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => codes::PARSE,
            Self::Config { .. } => codes::CONFIG,
            Self::NotFound { .. } => codes::NOT_FOUND,
            Self::Connect { .. } => codes::CONNECT,
            Self::Transport { .. } => codes::TRANSPORT,
            Self::InvalidStateTransition { .. } => codes::INVALID_TRANSITION,
            Self::Lifecycle { .. } => codes::LIFECYCLE,
            Self::Encode(_) => codes::ENCODE,
        }
    }

    /// 返回错误的处置分类。
    ///
    /// 连接与传输错误按底层 `io::ErrorKind` 判定：对端拒绝、连接重置、超时等视为可重试，
    /// 权限不足或平台不支持视为不可重试。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connect { source, .. } | Self::Transport { source, .. } => {
                categorize_io_error(source)
            }
            Self::InvalidStateTransition { .. } | Self::Lifecycle { .. } => ErrorCategory::Misuse,
            Self::Parse { .. } | Self::Config { .. } | Self::NotFound { .. } | Self::Encode(_) => {
                ErrorCategory::NonRetryable
            }
        }
    }

    /// 是否值得在下一次节拍重试。
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Retryable
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}
