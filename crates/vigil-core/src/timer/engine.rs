use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::pool::{PoolId, PoolSelector, Schedule, TimerEntry, TimerId, TimerPool};
use crate::error::{Result, VigilError};
use crate::time::Clock;

/// 单个引擎可同时持有的定时池上限。
pub const MAX_TIMER_POOLS: usize = 25;

/// 触发回调对定时项的处置意见。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// 周期项按节律重新排期；一次性项照常移除。
    Keep,
    /// 无论节律如何都移除。
    Drop,
}

/// 一次触发交给回调的上下文。
#[derive(Debug)]
pub struct TimerFiring<'a, A> {
    pub id: TimerId,
    pub pool: PoolId,
    pub tag: u64,
    /// 定时项原定的到期时刻。
    pub scheduled_for: Instant,
    /// 本次调度节拍的时刻。
    pub now: Instant,
    pub action: &'a mut A,
}

impl<A> TimerFiring<'_, A> {
    /// 实际触发相对原定时刻的延迟。
    pub fn lateness(&self) -> Duration {
        self.now.saturating_duration_since(self.scheduled_for)
    }
}

/// 一次调度节拍的统计。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchReport {
    /// 调用了回调的定时项数。
    pub fired: usize,
    /// 已取出但在触发前被取消而跳过的定时项数。
    pub skipped: usize,
    /// 因回调上限提前结束，仍有到期项留待下一节拍。
    pub exhausted: bool,
}

/// 被移出引擎的定时项，交还调用方处理其动作。
#[derive(Debug)]
pub struct DetachedTimer<A> {
    pub id: TimerId,
    pub tag: u64,
    pub action: A,
}

/// 多池定时引擎。
///
/// # 教案式说明
/// - **意图 (Why)**：心跳、数据流回收与应用定时任务共享同一套协作式调度；调用方在自己的
///   事件循环中周期性调用 [`dispatch`](Self::dispatch)，不依赖任何后台线程；
/// - **逻辑 (How)**：
///   1. 从注入的 [`Clock`] 读取本节拍时刻 `now`；
///   2. 持锁从所选池取出全部到期项，跨池按 `(到期时刻, 插入序号)` 排序并登记为“在途”，随后释放锁；
///   3. 逐个调用回调，回调内可以安全地调度、取消甚至删除池；
///   4. 再次持锁，把未被取消的周期项以 `now + period` 重新排期；
/// - **契约 (What)**：
///   - 同一节拍内每个定时项最多触发一次，错过的周期合并为一次，下一次到期时刻从实际触发时刻起算；
///   - 在途项被取消后不再重新排期；
///   - 节拍内新调度的项即使已到期也留到下一节拍；
/// - **注意事项 (Trade-offs)**：取消在途项只能阻止其重新排期，无法撤回已经开始执行的回调。
pub struct TimerEngine<A> {
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState<A>>,
}

struct EngineState<A> {
    pools: Vec<Option<TimerPool<A>>>,
    next_id: u64,
    next_seq: u64,
    next_generation: u64,
    in_flight: HashSet<TimerId>,
    cancelled: HashSet<TimerId>,
}

impl<A> EngineState<A> {
    fn pool(&self, id: PoolId) -> Option<&TimerPool<A>> {
        self.pools
            .get(id.index())
            .and_then(Option::as_ref)
            .filter(|pool| pool.generation() == id.generation())
    }

    fn pool_mut(&mut self, id: PoolId) -> Option<&mut TimerPool<A>> {
        self.pools
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|pool| pool.generation() == id.generation())
    }

    fn selected(&self, selector: PoolSelector) -> Result<Vec<PoolId>> {
        match selector {
            PoolSelector::All => Ok(self
                .pools
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.as_ref()
                        .map(|pool| PoolId::new(index, pool.generation()))
                })
                .collect()),
            PoolSelector::Pool(id) => {
                if self.pool(id).is_some() {
                    Ok(vec![id])
                } else {
                    Err(unknown_pool(id))
                }
            }
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn unknown_pool(id: PoolId) -> VigilError {
    VigilError::lifecycle("timer.pool", format!("{id} does not exist"))
}

impl<A> TimerEngine<A> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(EngineState {
                pools: Vec::new(),
                next_id: 1,
                next_seq: 0,
                next_generation: 0,
                in_flight: HashSet::new(),
                cancelled: HashSet::new(),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 创建定时池，优先复用空槽位；超过 [`MAX_TIMER_POOLS`] 时返回生命周期错误。
    pub fn create_pool(&self, name: impl Into<String>) -> Result<PoolId> {
        let name = name.into();
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        let index = match state.pools.iter().position(Option::is_none) {
            Some(index) => index,
            None if state.pools.len() < MAX_TIMER_POOLS => {
                state.pools.push(None);
                state.pools.len() - 1
            }
            None => {
                return Err(VigilError::lifecycle(
                    "timer.create_pool",
                    format!("all {MAX_TIMER_POOLS} timer pool slots are in use"),
                ));
            }
        };
        debug!(pool = index, name = %name, "timer pool created");
        state.pools[index] = Some(TimerPool::new(name, generation));
        Ok(PoolId::new(index, generation))
    }

    /// 删除定时池，按到期顺序交还其中尚未触发的定时项。
    pub fn remove_pool(&self, id: PoolId) -> Result<Vec<DetachedTimer<A>>> {
        let mut state = self.state.lock();
        if state.pool(id).is_none() {
            return Err(unknown_pool(id));
        }
        let pool = state.pools[id.index()].take();
        Ok(pool.map(detach_all).unwrap_or_default())
    }

    /// 删除全部定时池。
    pub fn remove_all_pools(&self) -> Vec<DetachedTimer<A>> {
        let mut state = self.state.lock();
        let pools = std::mem::take(&mut state.pools);
        pools.into_iter().flatten().flat_map(detach_all).collect()
    }

    pub fn pool_name(&self, id: PoolId) -> Option<String> {
        self.state.lock().pool(id).map(|pool| pool.name().to_owned())
    }

    /// 在 `delay` 之后调度一个定时项。
    ///
    /// `tag` 由调用方自定义，可用于 [`cancel_tag`](Self::cancel_tag)。
    pub fn schedule(
        &self,
        pool: PoolId,
        tag: u64,
        delay: Duration,
        schedule: Schedule,
        action: A,
    ) -> Result<TimerId> {
        if schedule == Schedule::Every(Duration::ZERO) {
            return Err(VigilError::config(
                "timer.period",
                "periodic timers need a non-zero period",
            ));
        }
        let now = self.clock.now();
        let due = now.checked_add(delay).ok_or_else(|| {
            VigilError::config("timer.delay", format!("{delay:?} is beyond the clock's range"))
        })?;
        if let Schedule::Every(period) = schedule
            && due.checked_add(period).is_none()
        {
            return Err(VigilError::config(
                "timer.period",
                format!("{period:?} is beyond the clock's range"),
            ));
        }
        let mut state = self.state.lock();
        let id = TimerId::new(state.next_id);
        let seq = state.bump_seq();
        let target = state.pool_mut(pool).ok_or_else(|| unknown_pool(pool))?;
        target.insert(TimerEntry {
            id,
            tag,
            due,
            seq,
            schedule,
            action,
        });
        state.next_id += 1;
        trace!(%id, %pool, tag, ?delay, "timer scheduled");
        Ok(id)
    }

    /// 取消定时项。
    ///
    /// 仍在池中的项被移除并交还；正在本节拍触发的项只会被标记为不再排期，返回 `None`。
    pub fn cancel(&self, id: TimerId) -> Option<DetachedTimer<A>> {
        let mut state = self.state.lock();
        let removed = state
            .pools
            .iter_mut()
            .flatten()
            .find_map(|pool| pool.remove(id));
        if removed.is_none() && state.in_flight.contains(&id) {
            state.cancelled.insert(id);
        }
        removed.map(detach)
    }

    /// 取消池中按到期顺序第一个带 `tag` 的定时项。
    pub fn cancel_tag(&self, pool: PoolId, tag: u64) -> Result<Option<DetachedTimer<A>>> {
        let mut state = self.state.lock();
        let target = state.pool_mut(pool).ok_or_else(|| unknown_pool(pool))?;
        Ok(target
            .first_with_tag(tag)
            .and_then(|id| target.remove(id))
            .map(detach))
    }

    pub fn contains(&self, id: TimerId) -> bool {
        let state = self.state.lock();
        (state.in_flight.contains(&id) && !state.cancelled.contains(&id))
            || state.pools.iter().flatten().any(|pool| pool.contains(id))
    }

    /// 所选池中等待触发的定时项数量。
    pub fn pending(&self, selector: PoolSelector) -> Result<usize> {
        let state = self.state.lock();
        let ids = state.selected(selector)?;
        Ok(ids
            .into_iter()
            .filter_map(|id| state.pool(id))
            .map(TimerPool::len)
            .sum())
    }

    /// 距所选池中最早到期项的时长；已到期返回零，没有定时项返回 `None`。
    pub fn next_due_in(&self, selector: PoolSelector) -> Result<Option<Duration>> {
        let now = self.clock.now();
        let state = self.state.lock();
        let ids = state.selected(selector)?;
        Ok(ids
            .into_iter()
            .filter_map(|id| state.pool(id).and_then(TimerPool::next_due))
            .min()
            .map(|due| due.saturating_duration_since(now)))
    }

    /// 执行一次调度节拍。
    ///
    /// # 契约 (What)
    /// - `limit` 限制本节拍最多调用的回调数，剩余到期项保留到下一节拍并在报告中标记 `exhausted`；
    /// - 所选池的到期项合并后按 `(到期时刻, 插入序号)` 升序触发，先调度的项先触发；
    /// - 回调返回 [`Disposition::Drop`] 时周期项不再排期。
    pub fn dispatch<F>(
        &self,
        selector: PoolSelector,
        limit: Option<usize>,
        mut fire: F,
    ) -> Result<DispatchReport>
    where
        F: FnMut(TimerFiring<'_, A>) -> Disposition,
    {
        let now = self.clock.now();
        let mut report = DispatchReport::default();

        let due = {
            let mut state = self.state.lock();
            let selected = state.selected(selector)?;
            let mut due = Vec::new();
            for pool_id in &selected {
                let Some(pool) = state.pool_mut(*pool_id) else {
                    continue;
                };
                while let Some(entry) = pool.pop_due(now) {
                    due.push((*pool_id, entry));
                }
            }
            // 插入序号在引擎内全局递增，跨池合并后仍是稳定的全序
            due.sort_by_key(|(_, entry)| (entry.due, entry.seq));
            if let Some(max) = limit
                && due.len() > max
            {
                report.exhausted = true;
                for (pool_id, entry) in due.split_off(max) {
                    if let Some(pool) = state.pool_mut(pool_id) {
                        pool.insert(entry);
                    }
                }
            }
            state.in_flight.extend(due.iter().map(|(_, entry)| entry.id));
            due
        };

        let mut completed = Vec::with_capacity(due.len());
        for (pool, mut entry) in due {
            if self.state.lock().cancelled.contains(&entry.id) {
                report.skipped += 1;
                completed.push((pool, entry, Disposition::Drop));
                continue;
            }
            let disposition = fire(TimerFiring {
                id: entry.id,
                pool,
                tag: entry.tag,
                scheduled_for: entry.due,
                now,
                action: &mut entry.action,
            });
            report.fired += 1;
            completed.push((pool, entry, disposition));
        }

        let mut finished = Vec::new();
        {
            let mut state = self.state.lock();
            for (pool, mut entry, disposition) in completed {
                state.in_flight.remove(&entry.id);
                let cancelled = state.cancelled.remove(&entry.id);
                match (entry.schedule, disposition, cancelled) {
                    (Schedule::Every(period), Disposition::Keep, false) => {
                        let Some(next) = now.checked_add(period) else {
                            warn!(id = %entry.id, ?period, "periodic timer retired: next due time overflows the clock");
                            finished.push(entry);
                            continue;
                        };
                        entry.due = next;
                        entry.seq = state.bump_seq();
                        match state.pool_mut(pool) {
                            Some(target) => target.insert(entry),
                            None => finished.push(entry),
                        }
                    }
                    _ => finished.push(entry),
                }
            }
        }
        // 动作的析构可能重入引擎，放在锁外进行。
        drop(finished);

        if report.fired > 0 || report.skipped > 0 {
            debug!(
                fired = report.fired,
                skipped = report.skipped,
                exhausted = report.exhausted,
                "timer dispatch tick"
            );
        }
        Ok(report)
    }
}

fn detach<A>(entry: TimerEntry<A>) -> DetachedTimer<A> {
    DetachedTimer {
        id: entry.id,
        tag: entry.tag,
        action: entry.action,
    }
}

fn detach_all<A>(mut pool: TimerPool<A>) -> Vec<DetachedTimer<A>> {
    pool.drain().into_iter().map(detach).collect()
}
