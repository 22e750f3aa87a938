use std::sync::atomic::{AtomicU64, Ordering};

/// 环境发送统计，原子累加。
#[derive(Debug, Default)]
pub(crate) struct EnvironmentStats {
    smartbeats_sent: AtomicU64,
    smartbeats_failed: AtomicU64,
    smartbeats_skipped: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    reconnects: AtomicU64,
}

/// [`Environment::stats`](super::Environment::stats) 返回的快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub smartbeats_sent: u64,
    pub smartbeats_failed: u64,
    /// 触发时服务已关闭而跳过的心跳数。
    pub smartbeats_skipped: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub reconnects: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Counter {
    SmartbeatSent,
    SmartbeatFailed,
    SmartbeatSkipped,
    NotificationSent,
    NotificationFailed,
    Reconnect,
}

impl EnvironmentStats {
    pub(crate) fn bump(&self, counter: Counter) {
        let slot = match counter {
            Counter::SmartbeatSent => &self.smartbeats_sent,
            Counter::SmartbeatFailed => &self.smartbeats_failed,
            Counter::SmartbeatSkipped => &self.smartbeats_skipped,
            Counter::NotificationSent => &self.notifications_sent,
            Counter::NotificationFailed => &self.notifications_failed,
            Counter::Reconnect => &self.reconnects,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            smartbeats_sent: self.smartbeats_sent.load(Ordering::Relaxed),
            smartbeats_failed: self.smartbeats_failed.load(Ordering::Relaxed),
            smartbeats_skipped: self.smartbeats_skipped.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
