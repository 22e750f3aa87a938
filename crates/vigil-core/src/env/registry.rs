//! 服务注册表：以环境内部生成的键索引服务，服务标识本身允许重复。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::warn;

use crate::service::ServiceCell;

#[derive(Debug, Default)]
pub(crate) struct ServiceRegistry {
    services: DashMap<u64, Arc<ServiceCell>>,
    next_key: AtomicU64,
}

impl ServiceRegistry {
    pub(crate) fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// 登记服务。标识与现存服务重复时只记录告警，不拒绝注册。
    pub(crate) fn insert(&self, cell: Arc<ServiceCell>) {
        let duplicate = self
            .services
            .iter()
            .any(|entry| entry.value().id() == cell.id());
        if duplicate {
            warn!(
                service_id = %cell.id(),
                service = %cell.name(),
                "service id is already registered in this environment; ids are not validated"
            );
        }
        self.services.insert(cell.key(), cell);
    }

    pub(crate) fn get(&self, key: u64) -> Option<Arc<ServiceCell>> {
        self.services.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, key: u64) -> Option<Arc<ServiceCell>> {
        self.services.remove(&key).map(|(_, cell)| cell)
    }

    pub(crate) fn len(&self) -> usize {
        self.services.len()
    }

    /// 快照当前全部服务，迭代期间不持有分片锁。
    pub(crate) fn snapshot(&self) -> Vec<Arc<ServiceCell>> {
        self.services
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
