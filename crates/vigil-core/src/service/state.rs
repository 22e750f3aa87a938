use std::fmt;

use serde::{Deserialize, Serialize};

/// 服务生命周期状态。
///
/// # 教案式说明
/// - **意图 (Why)**：监控端只需要区分“刚注册”“正常运行”“正在退出”“已关闭”四个阶段；
/// - **契约 (What)**：显式跃迁只允许 `Created → Running → Stopping → Closed`，
///   `Closed` 为吸收态；关闭服务时可从任意非终态直接进入 `Closed`；
/// - **注意事项 (Trade-offs)**：使用封闭枚举而非整数，新增状态需要修改跃迁表并同步监控端。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Created,
    Running,
    Stopping,
    Closed,
}

impl ServiceState {
    pub const ALL: [Self; 4] = [Self::Created, Self::Running, Self::Stopping, Self::Closed];

    /// `set_state` 是否允许从 `self` 跃迁到 `next`。
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Running, Self::Stopping)
                | (Self::Stopping, Self::Closed)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    pub const fn default_name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Closed => "closed",
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Closed => 3,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// 服务类别，随注册通知上报给监控端。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Io,
    Data,
    Control,
    Management,
    Network,
}

impl ServiceType {
    /// 监控端使用的数值编码。
    pub const fn code(self) -> u16 {
        match self {
            Self::Io => 1,
            Self::Data => 2,
            Self::Control => 3,
            Self::Management => 4,
            Self::Network => 5,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Io => "io",
            Self::Data => "data",
            Self::Control => "control",
            Self::Management => "management",
            Self::Network => "network",
        };
        f.write_str(name)
    }
}

/// 每个服务可以为状态起自己的展示名，未设置的沿用默认名。
#[derive(Clone, Debug, Default)]
pub struct StateNames {
    custom: [Option<String>; 4],
}

impl StateNames {
    pub fn get(&self, state: ServiceState) -> &str {
        self.custom[state.slot()]
            .as_deref()
            .unwrap_or(state.default_name())
    }

    pub fn set(&mut self, state: ServiceState, name: impl Into<String>) {
        self.custom[state.slot()] = Some(name.into());
    }

    pub fn reset(&mut self, state: ServiceState) {
        self.custom[state.slot()] = None;
    }
}
