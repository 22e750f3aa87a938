//! 内存数据流桩实现。
//!
//! 供单元测试、集成测试与下游 crate 在不触碰网络的情况下验证环境行为：
//! 每条发出的记录都按数据流标识留档，并且可以注入连接拒绝与发送失败。

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::data_flow::{DataFlow, DataFlowConnector, DataFlowDescriptor, DataFlowId, DataFlowStatus};
use crate::error::{Result, VigilError};
use crate::record::{MonitorRecord, SmartbeatRecord};

#[derive(Debug, Default)]
struct MemoryState {
    sent: Vec<(DataFlowId, MonitorRecord)>,
    opened: Vec<DataFlowId>,
    closed: Vec<DataFlowId>,
    refused_ports: HashSet<u16>,
    break_next_send: HashSet<DataFlowId>,
    refuse_reconnect: HashSet<DataFlowId>,
}

/// 记录所有发送的内存连接器，克隆体共享同一份记录。
#[derive(Clone, Debug, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后打开该端口的请求以 `ConnectionRefused` 失败。
    pub fn refuse_port(&self, port: u16) {
        self.state.lock().refused_ports.insert(port);
    }

    /// 数据流的下一次发送以 `BrokenPipe` 失败，数据流随之进入 `Broken`。
    pub fn break_next_send(&self, flow: DataFlowId) {
        self.state.lock().break_next_send.insert(flow);
    }

    /// 切换数据流重连是否被拒绝。
    pub fn set_reconnect_refused(&self, flow: DataFlowId, refused: bool) {
        let mut state = self.state.lock();
        if refused {
            state.refuse_reconnect.insert(flow);
        } else {
            state.refuse_reconnect.remove(&flow);
        }
    }

    /// 全部已发送记录。
    pub fn records(&self) -> Vec<(DataFlowId, MonitorRecord)> {
        self.state.lock().sent.clone()
    }

    /// 经某条数据流发送的记录。
    pub fn records_for(&self, flow: DataFlowId) -> Vec<MonitorRecord> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(id, _)| *id == flow)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// 经某条数据流发送的心跳记录。
    pub fn smartbeats_for(&self, flow: DataFlowId) -> Vec<SmartbeatRecord> {
        self.records_for(flow)
            .into_iter()
            .filter_map(|record| match record {
                MonitorRecord::Smartbeat(beat) => Some(beat),
                _ => None,
            })
            .collect()
    }

    /// 按打开顺序列出数据流，重连也计为一次打开。
    pub fn opened(&self) -> Vec<DataFlowId> {
        self.state.lock().opened.clone()
    }

    /// 按关闭顺序列出数据流。
    pub fn closed(&self) -> Vec<DataFlowId> {
        self.state.lock().closed.clone()
    }
}

impl DataFlowConnector for MemoryConnector {
    fn open(&self, descriptor: &DataFlowDescriptor) -> Result<Box<dyn DataFlow>> {
        let mut state = self.state.lock();
        if state.refused_ports.contains(&descriptor.port) {
            return Err(VigilError::connect(
                "memory connect",
                descriptor.endpoint(),
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ));
        }
        state.opened.push(descriptor.id);
        Ok(Box::new(MemoryDataFlow {
            descriptor: descriptor.clone(),
            status: DataFlowStatus::Open,
            state: Arc::clone(&self.state),
        }))
    }
}

/// [`MemoryConnector`] 打开的数据流。
#[derive(Debug)]
pub struct MemoryDataFlow {
    descriptor: DataFlowDescriptor,
    status: DataFlowStatus,
    state: Arc<Mutex<MemoryState>>,
}

impl DataFlow for MemoryDataFlow {
    fn descriptor(&self) -> &DataFlowDescriptor {
        &self.descriptor
    }

    fn status(&self) -> DataFlowStatus {
        self.status
    }

    fn send(&mut self, record: &MonitorRecord) -> Result<()> {
        let id = self.descriptor.id;
        if self.status != DataFlowStatus::Open {
            return Err(VigilError::transport(
                id,
                "memory send",
                io::Error::from(io::ErrorKind::NotConnected),
            ));
        }
        let mut state = self.state.lock();
        if state.break_next_send.remove(&id) {
            self.status = DataFlowStatus::Broken;
            return Err(VigilError::transport(
                id,
                "memory send",
                io::Error::from(io::ErrorKind::BrokenPipe),
            ));
        }
        state.sent.push((id, record.clone()));
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        let id = self.descriptor.id;
        if self.status == DataFlowStatus::Closed {
            return Err(VigilError::lifecycle(
                "data_flow.reconnect",
                format!("data flow {id} is closed"),
            ));
        }
        let mut state = self.state.lock();
        if state.refuse_reconnect.contains(&id) {
            return Err(VigilError::connect(
                "memory reconnect",
                self.descriptor.endpoint(),
                io::Error::from(io::ErrorKind::ConnectionRefused),
            ));
        }
        state.opened.push(id);
        self.status = DataFlowStatus::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.status != DataFlowStatus::Closed {
            self.status = DataFlowStatus::Closed;
            self.state.lock().closed.push(self.descriptor.id);
        }
        Ok(())
    }
}
