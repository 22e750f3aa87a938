use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// 可注入的时钟。
///
/// # 设计背景（Why）
/// - 定时池的到期判断与心跳时间戳都依赖时间来源；直接读系统时钟会让追赶策略、
///   取消竞态等场景无法在测试中复现；
/// - 调度模型是协作式的，时钟只需回答“现在几点”，不需要提供睡眠能力。
///
/// # 接口约束（What）
/// - `now`：单调时间点，用于到期比较，必须单调不减；
/// - `wall`：墙钟时间，仅用于填充记录时间戳。
///
/// # 使用指引（How）
/// - 通过 `Arc<dyn Clock>` 注入环境；测试注入 [`MockClock`] 并调用 `advance` 推进时间。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;

    /// 返回当前墙钟时间。
    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// 直接读取操作系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 虚拟时钟：时间只在调用 [`MockClock::advance`] 时前进。
///
/// # 行为概览（How）
/// - 记录构造时的单调基准与墙钟基准，两者共享同一个偏移量 `elapsed`；
/// - 克隆体共享状态，测试可以一份交给环境、一份留在手里推进。
///
/// # 契约说明（What）
/// - `advance` 可以多次调用，偏移量单调增加；
/// - `now()` 与 `wall()` 总是同步前进，时间戳与到期判断不会互相漂移。
#[derive(Clone, Debug)]
pub struct MockClock {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Debug)]
struct MockState {
    origin: Instant,
    wall_origin: SystemTime,
    elapsed: Duration,
}

impl MockClock {
    /// 以当前时刻为基准创建虚拟时钟。
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以指定单调基准创建虚拟时钟，墙钟基准取当前系统时间。
    pub fn with_start(origin: Instant) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                origin,
                wall_origin: SystemTime::now(),
                elapsed: Duration::ZERO,
            })),
        }
    }

    /// 固定墙钟基准，便于断言时间戳。
    pub fn with_wall_origin(self, wall_origin: SystemTime) -> Self {
        self.inner.lock().wall_origin = wall_origin;
        self
    }

    /// 推进虚拟时间。
    pub fn advance(&self, delta: Duration) {
        let mut state = self.inner.lock();
        state.elapsed = state.elapsed.saturating_add(delta);
    }

    /// 自构造起累计推进的时长。
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.origin + state.elapsed
    }

    fn wall(&self) -> SystemTime {
        let state = self.inner.lock();
        state.wall_origin + state.elapsed
    }
}

/// 把墙钟时间换算为自 UNIX 纪元起的微秒数；早于纪元时返回 0。
pub fn unix_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| u64::try_from(since.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
