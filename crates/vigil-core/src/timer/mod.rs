//! # timer 模块说明
//!
//! ## 角色定位（Why）
//! - 心跳节律、数据流延迟回收与应用自定义定时任务都挂在定时池上，由宿主在事件循环中调度；
//! - 时间来源可注入，追赶与取消语义可以在测试中逐拍验证。
//!
//! ## 行为契约（What）
//! - 池内按到期时刻升序触发，同一时刻按插入顺序；
//! - 周期项错过多个周期时只触发一次，下一次到期时刻从实际触发时刻起算。

mod engine;
mod pool;

pub use engine::{
    DetachedTimer, DispatchReport, Disposition, MAX_TIMER_POOLS, TimerEngine, TimerFiring,
};
pub use pool::{PoolId, PoolSelector, Schedule, TimerId};
