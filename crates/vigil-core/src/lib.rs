#![doc = r#"
# vigil-core

## 设计动机（Why）
- 为进程内的业务服务提供健康监控：服务上报生命周期状态与单调递增的检查点，
  环境按固定间隔把快照（smartbeat）经监控数据流发给外部收集端；
- 调度是协作式的，宿主在自己的事件循环里调用 `dispatch_timer_pools`，库内不创建线程，
  也不依赖异步运行时。

## 核心契约（What）
- [`options`]：缩进式层级配置，支持子块租约与释放统计；
- [`env::Environment`]：持有数据流、服务注册表与定时池，无进程级全局状态；
- [`service::Service`]：`Created → Running → Stopping → Closed` 状态机与检查点；
- [`timer::TimerEngine`]：按到期时刻与插入顺序触发，周期项错过的周期合并为一次；
- [`data_flow`]：传输契约，真实套接字实现位于 `vigil-transport-tcp`；
- [`record`]：线上记录格式，一行一个 JSON 文档。

## 实现策略（How）
- 错误统一为 [`error::VigilError`]，附稳定错误码与可重试分类；
- 日志统一走 `tracing`，库本身不安装订阅者；
- 时间来源经 [`time::Clock`] 注入，测试以 [`time::MockClock`] 逐拍推进。

## 风险与考量（Trade-offs）
- 服务标识由调用方分配，环境只在同一环境内发现重复时告警；
- 发送在数据流表锁内同步完成，慢速对端会拉长调度节拍，发送超时由数据流描述约束。
"#]

pub mod data_flow;
pub mod env;
pub mod error;
pub mod options;
pub mod record;
pub mod service;
pub mod test_stubs;
pub mod time;
pub mod timer;

pub use data_flow::{
    DataFlow, DataFlowConnector, DataFlowDescriptor, DataFlowId, DataFlowInfo, DataFlowProtocol,
    DataFlowStatus,
};
pub use env::{Environment, EnvironmentBuilder, StatsSnapshot, TimerEvent};
pub use error::{ErrorCategory, Result, VigilError};
pub use options::{OptionBlock, SubOptions};
pub use record::{MonitorRecord, SmartbeatRecord};
pub use service::{Service, ServiceId, ServiceState, ServiceType};
pub use time::{Clock, MockClock, SystemClock};
pub use timer::{DispatchReport, PoolId, PoolSelector, Schedule, TimerId};
