use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// 定时项标识，在同一个引擎内唯一。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// 定时池标识。
///
/// 槽位会被复用，`generation` 区分同一槽位上先后创建的池，过期的标识不会误命中新池。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PoolId {
    index: usize,
    generation: u64,
}

impl PoolId {
    pub(crate) const fn new(index: usize, generation: u64) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> usize {
        self.index
    }

    pub(crate) const fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.index)
    }
}

/// 一次调度作用的池范围。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolSelector {
    All,
    Pool(PoolId),
}

/// 定时项的触发节律。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Schedule {
    /// 触发一次后移除。
    Once,
    /// 每次触发后以实际触发时刻为起点重新排期。
    Every(Duration),
}

#[derive(Debug)]
pub(crate) struct TimerEntry<A> {
    pub(crate) id: TimerId,
    pub(crate) tag: u64,
    pub(crate) due: Instant,
    pub(crate) seq: u64,
    pub(crate) schedule: Schedule,
    pub(crate) action: A,
}

impl<A> TimerEntry<A> {
    fn key(&self) -> (Instant, u64) {
        (self.due, self.seq)
    }
}

/// 按 `(到期时刻, 插入序号)` 排序的定时池。
#[derive(Debug)]
pub(crate) struct TimerPool<A> {
    name: String,
    generation: u64,
    queue: BTreeMap<(Instant, u64), TimerId>,
    entries: HashMap<TimerId, TimerEntry<A>>,
}

impl<A> TimerPool<A> {
    pub(crate) fn new(name: String, generation: u64) -> Self {
        Self {
            name,
            generation,
            queue: BTreeMap::new(),
            entries: HashMap::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn insert(&mut self, entry: TimerEntry<A>) {
        self.queue.insert(entry.key(), entry.id);
        self.entries.insert(entry.id, entry);
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> Option<TimerEntry<A>> {
        let entry = self.entries.remove(&id)?;
        self.queue.remove(&entry.key());
        Some(entry)
    }

    /// 按到期顺序找到第一个带有 `tag` 的定时项。
    pub(crate) fn first_with_tag(&self, tag: u64) -> Option<TimerId> {
        self.queue
            .values()
            .copied()
            .find(|id| self.entries.get(id).is_some_and(|entry| entry.tag == tag))
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// 取出最早到期且 `due <= now` 的定时项。
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerEntry<A>> {
        let (&key, &id) = self.queue.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.queue.remove(&key);
        self.entries.remove(&id)
    }

    /// 按到期顺序清空全部定时项。
    pub(crate) fn drain(&mut self) -> Vec<TimerEntry<A>> {
        let queue = std::mem::take(&mut self.queue);
        queue
            .into_values()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}
