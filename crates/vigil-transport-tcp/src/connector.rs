use std::time::Duration;

use tracing::debug;
use vigil_core::{DataFlow, DataFlowConnector, DataFlowDescriptor, DataFlowProtocol, Result};

use crate::tcp::{TcpDataFlow, TcpSocketConfig};
use crate::udp::UdpDataFlow;

/// 按描述中的协议打开真实网络数据流的连接器。
///
/// # 契约 (What)
/// - `tcp` 打开 [`TcpDataFlow`]，套接字选项取自描述，`SO_LINGER` 取自连接器；
/// - `udp` 打开 [`UdpDataFlow`]；
/// - 目标不可达时返回 `Connect` 错误，不做重试。
#[derive(Clone, Copy, Debug, Default)]
pub struct NetConnector {
    linger: Option<Duration>,
}

impl NetConnector {
    pub const fn new() -> Self {
        Self { linger: None }
    }

    /// 为之后打开的 TCP 数据流设置 `SO_LINGER`。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }
}

impl DataFlowConnector for NetConnector {
    fn open(&self, descriptor: &DataFlowDescriptor) -> Result<Box<dyn DataFlow>> {
        debug!(
            flow_id = %descriptor.id,
            protocol = %descriptor.protocol,
            endpoint = %descriptor.endpoint(),
            "opening data flow"
        );
        let flow: Box<dyn DataFlow> = match descriptor.protocol {
            DataFlowProtocol::Tcp => {
                let config = TcpSocketConfig::from_descriptor(descriptor).with_linger(self.linger);
                Box::new(TcpDataFlow::connect_with_config(descriptor, config)?)
            }
            DataFlowProtocol::Udp => Box::new(UdpDataFlow::connect(descriptor)?),
        };
        Ok(flow)
    }
}
