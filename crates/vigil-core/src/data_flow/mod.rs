//! # data_flow 模块说明
//!
//! ## 角色定位（Why）
//! - 环境只依赖这里的契约发送监控与注册记录，具体套接字实现位于独立的传输 crate；
//! - 测试可以注入内存实现（见 [`crate::test_stubs`]），无需真实网络。
//!
//! ## 行为契约（What）
//! - [`DataFlowConnector::open`]：按描述建立连接，目标不可达时返回 `ConnectError`；
//! - [`DataFlow::send`]：发送一条记录，连接断开时返回 `TransportError` 且不在内部重试；
//! - [`DataFlow::reconnect`]：由环境在后续节拍按需调用；
//! - [`DataFlow::close`]：幂等，之后的发送均失败。

mod descriptor;

use std::fmt;
use std::io;

pub use descriptor::{
    DEFAULT_CONNECT_ADDRESS, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SEND_TIMEOUT, DataFlowDescriptor,
    DataFlowId, DataFlowProtocol, DataFlowStatus,
};

use crate::error::{Result, VigilError};
use crate::record::MonitorRecord;

/// 一条已打开的单向数据流。
pub trait DataFlow: Send + fmt::Debug {
    fn descriptor(&self) -> &DataFlowDescriptor;

    fn status(&self) -> DataFlowStatus;

    /// 发送一条记录。
    fn send(&mut self, record: &MonitorRecord) -> Result<()>;

    /// 重新建立断开的连接；不支持重连的实现保持默认。
    fn reconnect(&mut self) -> Result<()> {
        Err(VigilError::transport(
            self.descriptor().id,
            "reconnect",
            io::Error::from(io::ErrorKind::Unsupported),
        ))
    }

    /// 关闭数据流，重复调用无副作用。
    fn close(&mut self) -> Result<()>;
}

/// 按描述打开数据流。
pub trait DataFlowConnector: Send + Sync + 'static {
    fn open(&self, descriptor: &DataFlowDescriptor) -> Result<Box<dyn DataFlow>>;
}

/// 未配置连接器时的占位实现，任何打开请求都会失败。
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredConnector;

impl DataFlowConnector for UnconfiguredConnector {
    fn open(&self, descriptor: &DataFlowDescriptor) -> Result<Box<dyn DataFlow>> {
        Err(VigilError::connect(
            "open data flow",
            descriptor.endpoint(),
            io::Error::new(
                io::ErrorKind::Unsupported,
                "no data flow connector configured for this environment",
            ),
        ))
    }
}

/// 数据流的只读快照。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataFlowInfo {
    pub id: DataFlowId,
    pub name: String,
    pub protocol: DataFlowProtocol,
    pub endpoint: String,
    pub status: DataFlowStatus,
}

impl DataFlowInfo {
    pub(crate) fn of(flow: &dyn DataFlow) -> Self {
        let descriptor = flow.descriptor();
        Self {
            id: descriptor.id,
            name: descriptor.name.clone(),
            protocol: descriptor.protocol,
            endpoint: descriptor.endpoint(),
            status: flow.status(),
        }
    }
}
