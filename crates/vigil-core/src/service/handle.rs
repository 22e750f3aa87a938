use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::options::ServiceOptions;
use super::state::{ServiceState, ServiceType, StateNames};
use crate::env::{EnvShared, Environment};
use crate::error::{Result, VigilError};
use crate::options::OptionBlock;
use crate::record::{MonitorRecord, SmartbeatRecord};
use crate::timer::TimerId;

/// 调用方指定的服务标识；环境不校验其唯一性。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServiceId(u64);

impl ServiceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ServiceId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 状态变更回调收到的事件。
#[derive(Clone, Copy, Debug)]
pub struct StateChange<'a> {
    pub service_id: ServiceId,
    pub service_name: &'a str,
    pub from: ServiceState,
    pub to: ServiceState,
}

pub(crate) type StateChangeHook = Box<dyn Fn(&StateChange<'_>) + Send + Sync>;

/// 服务在环境注册表中的共享状态。
///
/// 句柄与心跳定时项都通过它读取状态与检查点，句柄关闭后 `closed` 置位，
/// 在途的心跳据此跳过。
pub(crate) struct ServiceCell {
    key: u64,
    id: ServiceId,
    name: String,
    kind: ServiceType,
    options: ServiceOptions,
    interval: Duration,
    state: Mutex<ServiceState>,
    names: Mutex<StateNames>,
    checkpoint: AtomicU64,
    closed: AtomicBool,
    timer: Mutex<Option<TimerId>>,
    hook: Option<StateChangeHook>,
}

impl ServiceCell {
    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn id(&self) -> ServiceId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.state().is_terminal()
    }

    pub(crate) fn timer(&self) -> Option<TimerId> {
        *self.timer.lock()
    }

    pub(crate) fn set_timer(&self, timer: Option<TimerId>) {
        *self.timer.lock() = timer;
    }

    pub(crate) fn take_timer(&self) -> Option<TimerId> {
        self.timer.lock().take()
    }

    pub(crate) fn smartbeat(&self, timestamp: u64) -> SmartbeatRecord {
        SmartbeatRecord {
            service_id: self.id.get(),
            service_name: self.name.clone(),
            state: self.state(),
            checkpoint: self.checkpoint.load(Ordering::Acquire),
            timestamp,
        }
    }

    pub(crate) fn created_record(&self, timestamp: u64) -> MonitorRecord {
        MonitorRecord::ServiceCreated {
            service_id: self.id.get(),
            service_name: self.name.clone(),
            service_type: self.kind,
            group: self.options.group.clone(),
            activity_timeout_ms: u64::try_from(
                self.options
                    .effective_activity_timeout(self.interval)
                    .as_millis(),
            )
            .unwrap_or(u64::MAX),
            timestamp,
        }
    }

    pub(crate) fn registration_record(&self, timestamp: u64) -> MonitorRecord {
        MonitorRecord::Registration {
            service_id: self.id.get(),
            service_name: self.name.clone(),
            service_type: self.kind,
            timestamp,
        }
    }

    pub(crate) fn state_record(
        &self,
        from: ServiceState,
        to: ServiceState,
        timestamp: u64,
    ) -> MonitorRecord {
        MonitorRecord::ServiceStateChanged {
            service_id: self.id.get(),
            service_name: self.name.clone(),
            from,
            to,
            state_name: self.names.lock().get(to).to_owned(),
            timestamp,
        }
    }

    pub(crate) fn destroyed_record(&self, timestamp: u64) -> MonitorRecord {
        MonitorRecord::ServiceDestroyed {
            service_id: self.id.get(),
            service_name: self.name.clone(),
            last_state: self.state(),
            timestamp,
        }
    }

    fn announce(&self, env: &Weak<EnvShared>, from: ServiceState, to: ServiceState) {
        debug!(service_id = %self.id, service = %self.name, %from, %to, "service state changed");
        if let Some(hook) = &self.hook {
            hook(&StateChange {
                service_id: self.id,
                service_name: &self.name,
                from,
                to,
            });
        }
        if let Some(env) = env.upgrade() {
            env.on_state_changed(self, from, to);
        }
    }
}

impl fmt::Debug for ServiceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCell")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("checkpoint", &self.checkpoint.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// 被监控服务的句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：业务代码通过句柄推进状态与检查点，环境在每个心跳节拍读取快照上报；
/// - **逻辑 (How)**：句柄持有注册表中共享单元的 `Arc` 与环境的弱引用，环境先于服务释放时，
///   句柄上的操作仍然安全，只是不再产生通知；
/// - **契约 (What)**：
///   - [`set_state`](Self::set_state) 只接受前向跃迁，其余返回 `InvalidStateTransition`；
///   - [`close`](Self::close) 消费句柄，经由 `Stopping` 进入 `Closed`，注销并取消心跳；
///   - 未显式关闭的句柄在析构时补做关闭并记录告警；
/// - **注意事项 (Trade-offs)**：检查点是原子变量，更新无需加锁，但心跳读到的是节拍时刻的最新值，
///   同一节拍内的多次更新只有最后一次可见。
pub struct Service {
    cell: Arc<ServiceCell>,
    env: Weak<EnvShared>,
    closed: bool,
}

impl Service {
    pub fn id(&self) -> ServiceId {
        self.cell.id
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn service_type(&self) -> ServiceType {
        self.cell.kind
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.cell.options
    }

    /// 生效的心跳间隔。
    pub fn smartbeat_interval(&self) -> Duration {
        self.cell.interval
    }

    pub fn state(&self) -> ServiceState {
        self.cell.state()
    }

    pub fn checkpoint(&self) -> u64 {
        self.cell.checkpoint.load(Ordering::Acquire)
    }

    /// 心跳定时项是否已排期；环境没有监控数据流时为 `false`。
    pub fn has_smartbeat_timer(&self) -> bool {
        self.cell.timer().is_some()
    }

    /// 执行一次显式状态跃迁。
    pub fn set_state(&self, next: ServiceState) -> Result<()> {
        let from = {
            let mut state = self.cell.state.lock();
            let from = *state;
            if !from.can_transition_to(next) {
                return Err(VigilError::InvalidStateTransition {
                    service: self.cell.name.clone(),
                    from,
                    to: next,
                });
            }
            *state = next;
            from
        };
        self.cell.announce(&self.env, from, next);
        Ok(())
    }

    /// 写入检查点；新值小于旧值时记录告警但照常写入。
    pub fn update_checkpoint(&self, value: u64) {
        let previous = self.cell.checkpoint.swap(value, Ordering::AcqRel);
        if value < previous {
            warn!(
                service_id = %self.cell.id,
                service = %self.cell.name,
                previous,
                value,
                "checkpoint moved backwards"
            );
        }
    }

    /// 检查点加一并返回新值。
    pub fn bump_checkpoint(&self) -> u64 {
        self.cell
            .checkpoint
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    /// 状态的展示名，未自定义时为默认名。
    pub fn state_name(&self, state: ServiceState) -> String {
        self.cell.names.lock().get(state).to_owned()
    }

    pub fn set_state_name(&self, state: ServiceState, name: impl Into<String>) {
        self.cell.names.lock().set(state, name);
    }

    /// 关闭服务。
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let path: &[(ServiceState, ServiceState)] = {
            let mut state = self.cell.state.lock();
            let path: &[_] = match *state {
                ServiceState::Created => &[(ServiceState::Created, ServiceState::Closed)],
                ServiceState::Running => &[
                    (ServiceState::Running, ServiceState::Stopping),
                    (ServiceState::Stopping, ServiceState::Closed),
                ],
                ServiceState::Stopping => &[(ServiceState::Stopping, ServiceState::Closed)],
                ServiceState::Closed => &[],
            };
            *state = ServiceState::Closed;
            path
        };
        for (from, to) in path {
            self.cell.announce(&self.env, *from, *to);
        }
        self.cell.closed.store(true, Ordering::Release);
        if let Some(env) = self.env.upgrade() {
            env.deregister(&self.cell);
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                service_id = %self.cell.id,
                service = %self.cell.name,
                "service dropped without close; closing it now"
            );
            self.shutdown();
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.cell.id)
            .field("name", &self.cell.name)
            .field("state", &self.state())
            .finish()
    }
}

/// 服务注册构建器，由 [`Environment::service`] 创建。
pub struct ServiceBuilder<'env> {
    env: &'env Environment,
    name: String,
    id: ServiceId,
    kind: ServiceType,
    options: ServiceOptions,
    hook: Option<StateChangeHook>,
}

impl<'env> ServiceBuilder<'env> {
    pub(crate) fn new(
        env: &'env Environment,
        name: String,
        id: ServiceId,
        kind: ServiceType,
    ) -> Self {
        Self {
            env,
            name,
            id,
            kind,
            options: ServiceOptions::default(),
            hook: None,
        }
    }

    /// 从配置块读取服务级配置。
    pub fn options(mut self, block: &OptionBlock) -> Result<Self> {
        self.options = ServiceOptions::from_block(block)?;
        Ok(self)
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// 注册状态变更回调，回调在状态锁之外同步调用。
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StateChange<'_>) + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// 完成注册。
    pub fn register(self) -> Result<Service> {
        let shared = self.env.shared();
        let interval = self.options.effective_interval(shared.smartbeat_interval());
        self.options.validate(shared.smartbeat_interval())?;
        let cell = Arc::new(ServiceCell {
            key: shared.next_service_key(),
            id: self.id,
            name: self.name,
            kind: self.kind,
            options: self.options,
            interval,
            state: Mutex::new(ServiceState::Created),
            names: Mutex::new(StateNames::default()),
            checkpoint: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            timer: Mutex::new(None),
            hook: self.hook,
        });
        shared.register(Arc::clone(&cell))?;
        Ok(Service {
            cell,
            env: Arc::downgrade(shared),
            closed: false,
        })
    }
}
