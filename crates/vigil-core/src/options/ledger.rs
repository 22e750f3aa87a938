use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 选项树的分配账本：统计每个逻辑对象（标量或块）的创建与释放次数。
///
/// # 教案式说明
/// - **意图 (Why)**：子块租约可以让子块比父块活得更久，账本用于验证“每个对象恰好释放一次，
///   且不会因父块释放而提前释放仍被租用的子块”；
/// - **契约 (What)**：账本是可选的，通过 [`OptionBlock::parse_tracked`](super::OptionBlock::parse_tracked)
///   或 [`OptionBlock::new_tracked`](super::OptionBlock::new_tracked) 挂载，同一账本可被多棵树共享；
/// - **注意事项 (Trade-offs)**：计数使用原子操作，未挂账本的树不产生任何额外开销。
#[derive(Clone, Debug, Default)]
pub struct AllocationLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Debug, Default)]
pub(crate) struct LedgerInner {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已创建的逻辑对象总数。
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    /// 已释放的逻辑对象总数。
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Acquire)
    }

    /// 仍然存活的逻辑对象数量。
    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }

    pub(crate) fn track(&self) -> Tracked {
        Tracked::register(Some(Arc::clone(&self.inner)))
    }
}

/// 挂在每个逻辑对象上的账本凭据，析构即记一次释放。
#[derive(Debug, Default)]
pub(crate) struct Tracked(Option<Arc<LedgerInner>>);

impl Tracked {
    fn register(ledger: Option<Arc<LedgerInner>>) -> Self {
        if let Some(inner) = &ledger {
            inner.allocated.fetch_add(1, Ordering::AcqRel);
        }
        Self(ledger)
    }

    /// 为同一账本上的新对象签发凭据。
    pub(crate) fn sibling(&self) -> Self {
        Self::register(self.0.clone())
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if let Some(inner) = &self.0 {
            inner.released.fetch_add(1, Ordering::AcqRel);
        }
    }
}
