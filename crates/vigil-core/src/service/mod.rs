//! # service 模块说明
//!
//! ## 角色定位（Why）
//! - 服务是被监控的业务单元：持有生命周期状态与单调检查点，由环境按心跳间隔上报；
//! - 注册、状态变更与注销都会向监控端发送通知，收集端据此维护服务视图。
//!
//! ## 行为契约（What）
//! - 状态机：`Created → Running → Stopping → Closed`，`Closed` 为吸收态；
//! - 检查点：调用方保证单调，倒退只记录告警；
//! - 服务必须在环境关闭前关闭。

mod handle;
mod options;
mod state;

pub use handle::{Service, ServiceBuilder, ServiceId, StateChange};
pub use options::{DEFAULT_ACTIVITY_TIMEOUT, ServiceOptions};
pub use state::{ServiceState, ServiceType, StateNames};

pub(crate) use handle::ServiceCell;
