use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::SockRef;
use tracing::{debug, info, trace, warn};
use vigil_core::record::encode_line;
use vigil_core::{
    DataFlow, DataFlowDescriptor, DataFlowStatus, MonitorRecord, Result, VigilError,
};

use crate::error::{self, map_io_error, not_connected};

/// TCP 套接字选项。
///
/// # 教案式说明
/// - **意图 (Why)**：描述中的 `nodelay`、发送超时与发送缓冲区要在每次建连（含重连）后重新写入，
///   集中在一处避免遗漏；
/// - **逻辑 (How)**：`nodelay` 与写超时走标准库接口，`SO_SNDBUF` 与 `SO_LINGER` 经
///   `socket2::SockRef` 写入，不接管套接字所有权；
/// - **契约 (What)**：`linger = None` 沿用内核默认；写超时为 `None` 时写入可能无限阻塞；
/// - **注意事项 (Trade-offs)**：内核可能调整 `SO_SNDBUF` 的实际值（Linux 会翻倍），
///   这里不回读校验。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TcpSocketConfig {
    nodelay: bool,
    write_timeout: Option<Duration>,
    send_buffer_size: Option<usize>,
    linger: Option<Duration>,
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: false,
            write_timeout: None,
            send_buffer_size: None,
            linger: None,
        }
    }

    /// 从数据流描述提取套接字选项；零发送超时视为不设超时。
    pub fn from_descriptor(descriptor: &DataFlowDescriptor) -> Self {
        Self {
            nodelay: descriptor.nodelay,
            write_timeout: (!descriptor.send_timeout.is_zero()).then_some(descriptor.send_timeout),
            send_buffer_size: descriptor.send_buffer_size,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        stream.set_write_timeout(self.write_timeout)?;
        let sock = SockRef::from(stream);
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        sock.set_linger(self.linger)
    }
}

/// 解析描述中的目标地址，依次尝试直到一个连接成功。
fn establish(descriptor: &DataFlowDescriptor, config: &TcpSocketConfig) -> Result<TcpStream> {
    let addrs = (descriptor.address.as_str(), descriptor.port)
        .to_socket_addrs()
        .map_err(|err| map_io_error(error::RESOLVE, descriptor, err))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, descriptor.connect_timeout) {
            Ok(stream) => {
                config
                    .apply(&stream)
                    .map_err(|err| map_io_error(error::CONFIGURE, descriptor, err))?;
                return Ok(stream);
            }
            Err(err) => {
                debug!(flow_id = %descriptor.id, %addr, error = %err, "tcp connect attempt failed");
                last_error = Some(err);
            }
        }
    }
    let err = last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "address resolved to no socket addresses",
        )
    });
    Err(map_io_error(error::CONNECT, descriptor, err))
}

/// 阻塞式 TCP 监控数据流，每条记录编码为一行 JSON 写出。
///
/// # 教案式说明
/// - **意图 (Why)**：环境的调度模型是协作式的，发送发生在宿主的调度节拍内，
///   阻塞写配合写超时即可约束单次节拍的耗时，无需引入异步运行时；
/// - **逻辑 (How)**：
///   1. `connect` 解析地址并在连接超时内逐个尝试，成功后写入 [`TcpSocketConfig`]；
///   2. `send` 使用 `write_all` 写出整行，任何写错误都使数据流进入 `Broken` 并丢弃套接字，
///      避免半行数据破坏对端的分帧；
///   3. `reconnect` 以同一描述重新建连；
/// - **契约 (What)**：`close` 幂等，关闭后 `send`/`reconnect` 均失败；析构时自动关闭；
/// - **注意事项 (Trade-offs)**：对端关闭后的第一次写入可能仍然成功（数据进入内核缓冲区），
///   断开通常在随后的写入上才被发现。
#[derive(Debug)]
pub struct TcpDataFlow {
    descriptor: DataFlowDescriptor,
    config: TcpSocketConfig,
    stream: Option<TcpStream>,
    status: DataFlowStatus,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    bytes_sent: u64,
}

impl TcpDataFlow {
    /// 以描述中的套接字选项建立连接。
    pub fn connect(descriptor: &DataFlowDescriptor) -> Result<Self> {
        Self::connect_with_config(descriptor, TcpSocketConfig::from_descriptor(descriptor))
    }

    pub fn connect_with_config(
        descriptor: &DataFlowDescriptor,
        config: TcpSocketConfig,
    ) -> Result<Self> {
        let stream = establish(descriptor, &config)?;
        let mut flow = Self {
            descriptor: descriptor.clone(),
            config,
            stream: None,
            status: DataFlowStatus::Open,
            local_addr: None,
            peer_addr: None,
            bytes_sent: 0,
        };
        flow.attach(stream);
        info!(
            flow_id = %descriptor.id,
            peer = ?flow.peer_addr,
            nodelay = config.nodelay,
            "tcp data flow connected"
        );
        Ok(flow)
    }

    fn attach(&mut self, stream: TcpStream) {
        self.local_addr = stream.local_addr().ok();
        self.peer_addr = stream.peer_addr().ok();
        self.stream = Some(stream);
        self.status = DataFlowStatus::Open;
    }

    pub fn config(&self) -> &TcpSocketConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// 成功写出的累计字节数。
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn discard_stream(&mut self) {
        if let Some(stream) = self.stream.take()
            && let Err(err) = stream.shutdown(Shutdown::Both)
        {
            trace!(flow_id = %self.descriptor.id, error = %err, "shutdown of broken stream failed");
        }
    }
}

impl DataFlow for TcpDataFlow {
    fn descriptor(&self) -> &DataFlowDescriptor {
        &self.descriptor
    }

    fn status(&self) -> DataFlowStatus {
        self.status
    }

    fn send(&mut self, record: &MonitorRecord) -> Result<()> {
        let line = encode_line(record)?;
        if self.status != DataFlowStatus::Open {
            return Err(not_connected(error::WRITE, &self.descriptor));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(not_connected(error::WRITE, &self.descriptor));
        };
        let written = stream.write_all(&line).and_then(|()| stream.flush());
        match written {
            Ok(()) => {
                self.bytes_sent += line.len() as u64;
                trace!(
                    flow_id = %self.descriptor.id,
                    kind = record.kind(),
                    bytes = line.len(),
                    "record sent"
                );
                Ok(())
            }
            Err(err) => {
                warn!(flow_id = %self.descriptor.id, error = %err, "tcp data flow broken");
                self.status = DataFlowStatus::Broken;
                self.discard_stream();
                Err(map_io_error(error::WRITE, &self.descriptor, err))
            }
        }
    }

    fn reconnect(&mut self) -> Result<()> {
        if self.status == DataFlowStatus::Closed {
            return Err(VigilError::lifecycle(
                "data_flow.reconnect",
                format!("data flow {} is closed", self.descriptor.id),
            ));
        }
        self.discard_stream();
        self.status = DataFlowStatus::Broken;
        let stream = establish(&self.descriptor, &self.config)?;
        self.attach(stream);
        info!(flow_id = %self.descriptor.id, peer = ?self.peer_addr, "tcp data flow reconnected");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.status == DataFlowStatus::Closed {
            return Ok(());
        }
        self.status = DataFlowStatus::Closed;
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        debug!(flow_id = %self.descriptor.id, bytes_sent = self.bytes_sent, "tcp data flow closed");
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io_error(error::SHUTDOWN, &self.descriptor, err)),
        }
    }
}

impl Drop for TcpDataFlow {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(flow_id = %self.descriptor.id, error = %err, "tcp data flow close on drop failed");
        }
    }
}
