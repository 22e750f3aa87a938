//! # env 模块说明
//!
//! ## 角色定位（Why）
//! - 环境是一次进程内监控会话的根对象：持有名称服务与监控两条数据流、服务注册表与定时池；
//! - 宿主在自己的事件循环中调用 [`Environment::dispatch_timer_pools`]，环境据此发出心跳，
//!   不创建任何后台线程。
//!
//! ## 行为契约（What）
//! - 创建：解析配置、打开已配置的数据流，任何一步失败都会关闭已打开的数据流并返回错误；
//! - 调度：每个到期的心跳项为对应服务发出一条记录，服务已关闭时跳过；
//! - 关闭：仍有服务存活时拒绝关闭；关闭后数据流与定时池全部释放，重复关闭无副作用。
//!
//! ## 并发说明（Trade-offs）
//! - 注册表与定时池各自加锁，允许服务在其他线程更新检查点；
//! - 发送在数据流表的锁内完成，数据流实现不得回调环境。

mod config;
mod registry;
mod stats;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use config::{DEFAULT_MONITORING_REAP_DELAY, DEFAULT_SMARTBEAT_INTERVAL, EnvironmentConfig};
pub use stats::StatsSnapshot;

use self::registry::ServiceRegistry;
use self::stats::{Counter, EnvironmentStats};
use crate::data_flow::{
    DataFlow, DataFlowConnector, DataFlowId, DataFlowInfo, DataFlowStatus, UnconfiguredConnector,
};
use crate::error::{Result, VigilError};
use crate::options::OptionBlock;
use crate::record::MonitorRecord;
use crate::service::{Service, ServiceBuilder, ServiceCell, ServiceId, ServiceState, ServiceType};
use crate::time::{Clock, SystemClock, unix_micros};
use crate::timer::{
    DetachedTimer, DispatchReport, Disposition, PoolId, PoolSelector, Schedule, TimerEngine,
    TimerFiring, TimerId,
};

/// 应用定时回调收到的事件。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerEvent {
    Expired {
        id: TimerId,
        tag: u64,
        /// 实际触发相对原定时刻的延迟。
        lateness: Duration,
    },
    Cancelled {
        id: TimerId,
        tag: u64,
    },
}

/// 应用定时回调。
pub type TimerCallback = Box<dyn FnMut(TimerEvent) + Send>;

pub(crate) enum EnvTask {
    Smartbeat { service: u64 },
    NameServerBeat,
    Reap(Box<dyn DataFlow>),
    Callback(TimerCallback),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FlowRole {
    NameServer,
    Monitoring,
}

impl FlowRole {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NameServer => "name_server",
            Self::Monitoring => "monitoring",
        }
    }
}

#[derive(Default)]
struct FlowTable {
    flows: BTreeMap<DataFlowId, Box<dyn DataFlow>>,
    name_server: Option<DataFlowId>,
    monitoring: Option<DataFlowId>,
}

impl FlowTable {
    fn role_id(&self, role: FlowRole) -> Option<DataFlowId> {
        match role {
            FlowRole::NameServer => self.name_server,
            FlowRole::Monitoring => self.monitoring,
        }
    }

    fn role_mut(&mut self, role: FlowRole) -> Option<&mut Box<dyn DataFlow>> {
        let id = self.role_id(role)?;
        self.flows.get_mut(&id)
    }

    /// 安装某个角色的数据流，返回被替换下来的旧数据流。
    fn install(&mut self, role: FlowRole, flow: Box<dyn DataFlow>) -> Option<Box<dyn DataFlow>> {
        let id = flow.descriptor().id;
        let slot = match role {
            FlowRole::NameServer => &mut self.name_server,
            FlowRole::Monitoring => &mut self.monitoring,
        };
        let previous = slot.replace(id);
        let replaced = previous.and_then(|old| {
            if old == id {
                None
            } else {
                self.flows.remove(&old)
            }
        });
        let same_id = self.flows.insert(id, flow);
        replaced.or(same_id)
    }

    fn info(&self, id: DataFlowId) -> Option<DataFlowInfo> {
        self.flows.get(&id).map(|flow| DataFlowInfo::of(flow.as_ref()))
    }

    fn close_all(&mut self) {
        for (id, mut flow) in std::mem::take(&mut self.flows) {
            if let Err(err) = flow.close() {
                warn!(flow_id = %id, code = err.code(), error = %err, "data flow close failed");
            }
        }
        self.name_server = None;
        self.monitoring = None;
    }
}

pub(crate) struct EnvShared {
    clock: Arc<dyn Clock>,
    connector: Arc<dyn DataFlowConnector>,
    timers: TimerEngine<EnvTask>,
    smartbeat_pool: PoolId,
    smartbeat_interval: Duration,
    reap_delay: Duration,
    flows: Mutex<FlowTable>,
    services: ServiceRegistry,
    stats: EnvironmentStats,
    closed: AtomicBool,
}

impl EnvShared {
    pub(crate) fn smartbeat_interval(&self) -> Duration {
        self.smartbeat_interval
    }

    pub(crate) fn next_service_key(&self) -> u64 {
        self.services.next_key()
    }

    fn timestamp(&self) -> u64 {
        unix_micros(self.clock.wall())
    }

    fn ensure_open(&self, context: &'static str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VigilError::lifecycle(context, "environment is closed"));
        }
        Ok(())
    }

    /// 登记服务并发出注册通知；存在监控数据流时排期心跳，首次心跳在下一节拍发出。
    pub(crate) fn register(&self, cell: Arc<ServiceCell>) -> Result<()> {
        self.ensure_open("service.register")?;
        self.services.insert(Arc::clone(&cell));
        let has_monitoring = self.flows.lock().monitoring.is_some();
        if has_monitoring && let Err(err) = self.schedule_smartbeat(&cell) {
            self.services.remove(cell.key());
            return Err(err);
        }
        let timestamp = self.timestamp();
        self.notify(FlowRole::Monitoring, &cell.created_record(timestamp));
        self.notify(FlowRole::NameServer, &cell.registration_record(timestamp));
        info!(
            service_id = %cell.id(),
            service = %cell.name(),
            interval_ms = cell.interval().as_millis() as u64,
            smartbeat = has_monitoring,
            "service registered"
        );
        Ok(())
    }

    fn schedule_smartbeat(&self, cell: &ServiceCell) -> Result<()> {
        let timer = self.timers.schedule(
            self.smartbeat_pool,
            cell.id().get(),
            Duration::ZERO,
            Schedule::Every(cell.interval()),
            EnvTask::Smartbeat {
                service: cell.key(),
            },
        )?;
        cell.set_timer(Some(timer));
        Ok(())
    }

    pub(crate) fn on_state_changed(&self, cell: &ServiceCell, from: ServiceState, to: ServiceState) {
        self.notify(
            FlowRole::Monitoring,
            &cell.state_record(from, to, self.timestamp()),
        );
    }

    pub(crate) fn deregister(&self, cell: &ServiceCell) {
        self.services.remove(cell.key());
        if let Some(timer) = cell.take_timer() {
            drop(self.timers.cancel(timer));
        }
        self.notify(FlowRole::Monitoring, &cell.destroyed_record(self.timestamp()));
        info!(service_id = %cell.id(), service = %cell.name(), "service closed");
    }

    fn notify(&self, role: FlowRole, record: &MonitorRecord) {
        match self.emit(role, record) {
            Ok(true) => self.stats.bump(Counter::NotificationSent),
            Ok(false) => {}
            Err(err) => {
                self.stats.bump(Counter::NotificationFailed);
                warn!(
                    flow = role.as_str(),
                    kind = record.kind(),
                    code = err.code(),
                    error = %err,
                    "notification not delivered"
                );
            }
        }
    }

    /// 经指定角色的数据流发送记录；角色未配置时返回 `Ok(false)`。
    ///
    /// 断开的数据流先尝试重连一次，重连失败即本次发送失败，由下一节拍再试。
    fn emit(&self, role: FlowRole, record: &MonitorRecord) -> Result<bool> {
        let mut table = self.flows.lock();
        let Some(flow) = table.role_mut(role) else {
            return Ok(false);
        };
        if flow.status() == DataFlowStatus::Broken {
            flow.reconnect()?;
            self.stats.bump(Counter::Reconnect);
            info!(flow_id = %flow.descriptor().id, flow = role.as_str(), "data flow reconnected");
        }
        flow.send(record)?;
        Ok(true)
    }

    fn fire(&self, firing: TimerFiring<'_, EnvTask>) -> Disposition {
        let lateness = firing.lateness();
        let TimerFiring { id, tag, action, .. } = firing;
        match action {
            EnvTask::Smartbeat { service } => self.fire_smartbeat(*service),
            EnvTask::NameServerBeat => {
                let record = MonitorRecord::NameServerBeat {
                    timestamp: self.timestamp(),
                };
                if let Err(err) = self.emit(FlowRole::NameServer, &record) {
                    warn!(code = err.code(), error = %err, "name server beat not delivered");
                }
                Disposition::Keep
            }
            EnvTask::Reap(flow) => {
                let flow_id = flow.descriptor().id;
                match flow.close() {
                    Ok(()) => info!(%flow_id, "replaced monitoring data flow reaped"),
                    Err(err) => warn!(%flow_id, error = %err, "replaced data flow close failed"),
                }
                Disposition::Drop
            }
            EnvTask::Callback(callback) => {
                callback(TimerEvent::Expired { id, tag, lateness });
                Disposition::Keep
            }
        }
    }

    fn fire_smartbeat(&self, key: u64) -> Disposition {
        let Some(cell) = self.services.get(key) else {
            self.stats.bump(Counter::SmartbeatSkipped);
            return Disposition::Drop;
        };
        if cell.is_closed() {
            self.stats.bump(Counter::SmartbeatSkipped);
            cell.set_timer(None);
            debug!(service_id = %cell.id(), "smartbeat skipped for closed service");
            return Disposition::Drop;
        }
        let record = MonitorRecord::Smartbeat(cell.smartbeat(self.timestamp()));
        match self.emit(FlowRole::Monitoring, &record) {
            Ok(true) => self.stats.bump(Counter::SmartbeatSent),
            Ok(false) => {
                cell.set_timer(None);
                return Disposition::Drop;
            }
            Err(err) => {
                self.stats.bump(Counter::SmartbeatFailed);
                warn!(
                    service_id = %cell.id(),
                    service = %cell.name(),
                    code = err.code(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "smartbeat not delivered"
                );
            }
        }
        Disposition::Keep
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for detached in self.timers.remove_all_pools() {
            retire(detached);
        }
        self.flows.lock().close_all();
        info!("environment closed");
    }
}

/// 处理被移出引擎的定时项：应用回调收到取消事件，待回收的数据流立即关闭。
fn retire(detached: DetachedTimer<EnvTask>) {
    let DetachedTimer { id, tag, action } = detached;
    match action {
        EnvTask::Callback(mut callback) => callback(TimerEvent::Cancelled { id, tag }),
        EnvTask::Reap(mut flow) => {
            if let Err(err) = flow.close() {
                warn!(flow_id = %flow.descriptor().id, error = %err, "data flow close failed");
            }
        }
        EnvTask::Smartbeat { .. } | EnvTask::NameServerBeat => {}
    }
}

/// 环境构建器。
pub struct EnvironmentBuilder {
    clock: Arc<dyn Clock>,
    connector: Arc<dyn DataFlowConnector>,
    smartbeat_interval: Option<Duration>,
    reap_delay: Duration,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            connector: Arc::new(UnconfiguredConnector),
            smartbeat_interval: None,
            reap_delay: DEFAULT_MONITORING_REAP_DELAY,
        }
    }
}

impl EnvironmentBuilder {
    /// 注入时钟，测试中通常为 [`MockClock`](crate::time::MockClock)。
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// 注入打开数据流的连接器。
    pub fn connector(mut self, connector: impl DataFlowConnector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn shared_connector(mut self, connector: Arc<dyn DataFlowConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// 覆盖配置中的心跳间隔。
    pub fn smartbeat_interval(mut self, interval: Duration) -> Self {
        self.smartbeat_interval = Some(interval);
        self
    }

    /// 被替换的监控数据流延迟多久关闭。
    pub fn monitoring_reap_delay(mut self, delay: Duration) -> Self {
        self.reap_delay = delay;
        self
    }

    /// 按配置创建环境。
    pub fn build(self, options: &OptionBlock) -> Result<Environment> {
        let config = EnvironmentConfig::from_options(options)?;
        let smartbeat_interval = self.smartbeat_interval.unwrap_or(config.smartbeat_interval);
        if smartbeat_interval.is_zero() {
            return Err(VigilError::config("smartbeat_interval", "must be positive"));
        }
        let timers = TimerEngine::new(Arc::clone(&self.clock));
        let smartbeat_pool = timers.create_pool("smartbeat")?;

        let mut flows = FlowTable::default();
        for (role, descriptor) in [
            (FlowRole::NameServer, config.name_server),
            (FlowRole::Monitoring, config.monitoring),
        ] {
            let Some(descriptor) = descriptor else {
                continue;
            };
            match self.connector.open(&descriptor) {
                Ok(flow) => {
                    info!(
                        flow = role.as_str(),
                        flow_id = %descriptor.id,
                        name = %descriptor.name,
                        protocol = %descriptor.protocol,
                        endpoint = %descriptor.endpoint(),
                        "data flow opened"
                    );
                    flows.install(role, flow);
                }
                Err(err) => {
                    flows.close_all();
                    return Err(err);
                }
            }
        }
        let has_name_server = flows.name_server.is_some();

        let shared = Arc::new(EnvShared {
            clock: self.clock,
            connector: self.connector,
            timers,
            smartbeat_pool,
            smartbeat_interval,
            reap_delay: self.reap_delay,
            flows: Mutex::new(flows),
            services: ServiceRegistry::default(),
            stats: EnvironmentStats::default(),
            closed: AtomicBool::new(false),
        });
        if has_name_server {
            shared.timers.schedule(
                smartbeat_pool,
                0,
                smartbeat_interval,
                Schedule::Every(smartbeat_interval),
                EnvTask::NameServerBeat,
            )?;
        }
        info!(
            interval_ms = smartbeat_interval.as_millis() as u64,
            name_server = has_name_server,
            "environment created"
        );
        Ok(Environment { shared })
    }
}

/// 监控环境。
///
/// # 教案式说明
/// - **意图 (Why)**：集中持有数据流、服务注册表与定时池，避免任何进程级全局状态，同一进程
///   可以并存多个互不干扰的环境；
/// - **逻辑 (How)**：内部状态位于 `Arc` 中，服务句柄只持有弱引用；环境析构时若尚未关闭，
///   会强制释放资源并对仍存活的服务记录告警；
/// - **契约 (What)**：
///   - [`close`](Self::close) 在仍有服务存活时返回 `Lifecycle` 错误，成功后重复调用无副作用；
///   - 关闭后除查询外的操作都返回 `Lifecycle` 错误；
///   - 所有方法均可跨线程调用，但调度节拍应由单一事件循环驱动。
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// 以系统时钟与给定连接器创建环境。
    pub fn create(options: &OptionBlock, connector: impl DataFlowConnector) -> Result<Self> {
        Self::builder().connector(connector).build(options)
    }

    /// 解析配置文本并创建环境；文本结构错误时返回 `Parse` 错误。
    pub fn from_text(text: &str, connector: impl DataFlowConnector) -> Result<Self> {
        let options = OptionBlock::parse(text)?;
        let environment = Self::create(&options, connector);
        options.release_all();
        environment
    }

    pub(crate) fn shared(&self) -> &Arc<EnvShared> {
        &self.shared
    }

    /// 开始注册一个服务。
    pub fn service(
        &self,
        name: impl Into<String>,
        id: u64,
        service_type: ServiceType,
    ) -> ServiceBuilder<'_> {
        ServiceBuilder::new(self, name.into(), ServiceId::new(id), service_type)
    }

    /// 以默认服务配置注册服务。
    pub fn create_service(
        &self,
        name: impl Into<String>,
        id: u64,
        service_type: ServiceType,
    ) -> Result<Service> {
        self.service(name, id, service_type).register()
    }

    /// 执行一次调度节拍。
    pub fn dispatch_timer_pools(&self, selector: PoolSelector) -> Result<DispatchReport> {
        self.dispatch(selector, None)
    }

    /// 执行一次调度节拍，最多调用 `max_callbacks` 个回调。
    pub fn dispatch_timer_pools_bounded(
        &self,
        selector: PoolSelector,
        max_callbacks: usize,
    ) -> Result<DispatchReport> {
        self.dispatch(selector, Some(max_callbacks))
    }

    fn dispatch(&self, selector: PoolSelector, limit: Option<usize>) -> Result<DispatchReport> {
        let shared = &self.shared;
        shared.ensure_open("environment.dispatch")?;
        shared
            .timers
            .dispatch(selector, limit, |firing| shared.fire(firing))
    }

    /// 距下一个到期定时项的时长，宿主可据此决定事件循环的等待时间。
    pub fn next_timer_in(&self, selector: PoolSelector) -> Result<Option<Duration>> {
        self.shared.ensure_open("environment.next_timer_in")?;
        self.shared.timers.next_due_in(selector)
    }

    /// 所选池中等待触发的定时项数量。
    pub fn pending_timers(&self, selector: PoolSelector) -> Result<usize> {
        self.shared.timers.pending(selector)
    }

    /// 环境内置的心跳定时池。
    pub fn smartbeat_pool(&self) -> PoolId {
        self.shared.smartbeat_pool
    }

    /// 为应用创建定时池。
    pub fn create_timer_pool(&self, name: impl Into<String>) -> Result<PoolId> {
        self.shared.ensure_open("environment.create_timer_pool")?;
        self.shared.timers.create_pool(name)
    }

    /// 删除应用定时池；`notify_cancelled` 为真时剩余回调收到取消事件。
    pub fn free_timer_pool(&self, pool: PoolId, notify_cancelled: bool) -> Result<()> {
        self.guard_application_pool(pool, "environment.free_timer_pool")?;
        for detached in self.shared.timers.remove_pool(pool)? {
            if notify_cancelled {
                retire(detached);
            }
        }
        Ok(())
    }

    /// 在应用定时池中调度回调。
    pub fn schedule_timer<F>(
        &self,
        pool: PoolId,
        tag: u64,
        delay: Duration,
        schedule: Schedule,
        callback: F,
    ) -> Result<TimerId>
    where
        F: FnMut(TimerEvent) + Send + 'static,
    {
        self.guard_application_pool(pool, "environment.schedule_timer")?;
        self.shared
            .timers
            .schedule(pool, tag, delay, schedule, EnvTask::Callback(Box::new(callback)))
    }

    /// 取消尚未触发的应用定时项，回调同步收到取消事件；返回是否取消成功。
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        match self.shared.timers.cancel(id) {
            Some(detached) => {
                retire(detached);
                true
            }
            None => false,
        }
    }

    /// 取消池中按到期顺序第一个带 `tag` 的应用定时项。
    pub fn cancel_timer_tag(&self, pool: PoolId, tag: u64) -> Result<Option<TimerId>> {
        self.guard_application_pool(pool, "environment.cancel_timer_tag")?;
        Ok(self.shared.timers.cancel_tag(pool, tag)?.map(|detached| {
            let id = detached.id;
            retire(detached);
            id
        }))
    }

    fn guard_application_pool(&self, pool: PoolId, context: &'static str) -> Result<()> {
        self.shared.ensure_open(context)?;
        if pool == self.shared.smartbeat_pool {
            return Err(VigilError::lifecycle(
                context,
                "the smartbeat pool is reserved for the environment",
            ));
        }
        Ok(())
    }

    /// 替换监控数据流。
    ///
    /// # 契约 (What)
    /// - `flow_options` 为数据流配置块，协议由块内 `monitoring_data_flow_protocol` 决定；
    /// - 旧数据流不立即关闭，而是在回收延迟后由心跳池关闭；
    /// - 尚无心跳定时项的存活服务在此补排期。
    pub fn set_monitoring_data_flow(&self, flow_options: &OptionBlock) -> Result<DataFlowId> {
        let shared = &self.shared;
        shared.ensure_open("environment.set_monitoring_data_flow")?;
        let descriptor = config::monitoring_descriptor(flow_options, None)?;
        if shared.flows.lock().name_server == Some(descriptor.id) {
            return Err(VigilError::config(
                "data_flow_id",
                format!("{} is already used by the name server flow", descriptor.id),
            ));
        }
        let flow = shared.connector.open(&descriptor)?;
        let replaced = shared.flows.lock().install(FlowRole::Monitoring, flow);
        info!(flow_id = %descriptor.id, endpoint = %descriptor.endpoint(), "monitoring data flow installed");
        if let Some(old) = replaced {
            let old_id = old.descriptor().id;
            shared.timers.schedule(
                shared.smartbeat_pool,
                u64::from(old_id.get()),
                shared.reap_delay,
                Schedule::Once,
                EnvTask::Reap(old),
            )?;
            debug!(flow_id = %old_id, delay = ?shared.reap_delay, "replaced data flow scheduled for reaping");
        }
        for cell in shared.services.snapshot() {
            if cell.timer().is_none() && !cell.is_closed() {
                shared.schedule_smartbeat(&cell)?;
            }
        }
        Ok(descriptor.id)
    }

    pub fn monitoring_data_flow(&self) -> Option<DataFlowInfo> {
        let table = self.shared.flows.lock();
        table.monitoring.and_then(|id| table.info(id))
    }

    pub fn name_server_data_flow(&self) -> Option<DataFlowInfo> {
        let table = self.shared.flows.lock();
        table.name_server.and_then(|id| table.info(id))
    }

    pub fn data_flow(&self, id: DataFlowId) -> Option<DataFlowInfo> {
        self.shared.flows.lock().info(id)
    }

    /// 已注册且尚未关闭的服务数量。
    pub fn live_services(&self) -> usize {
        self.shared.services.len()
    }

    pub fn smartbeat_interval(&self) -> Duration {
        self.shared.smartbeat_interval
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// 关闭环境。
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let live = self.shared.services.len();
        if live > 0 {
            return Err(VigilError::lifecycle(
                "environment.close",
                format!("{live} service(s) must be closed first"),
            ));
        }
        self.shared.shutdown();
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        let live = self.shared.services.len();
        if live > 0 {
            warn!(live, "environment dropped with live services; releasing resources anyway");
        }
        self.shared.shutdown();
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("smartbeat_interval", &self.shared.smartbeat_interval)
            .field("live_services", &self.live_services())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
