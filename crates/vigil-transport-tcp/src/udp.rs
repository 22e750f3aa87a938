use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::SockRef;
use tracing::{debug, info, warn};
use vigil_core::record::encode_line;
use vigil_core::{DataFlow, DataFlowDescriptor, DataFlowStatus, MonitorRecord, Result, VigilError};

use crate::error::{self, map_io_error, not_connected};

/// 已连接的 UDP 监控数据流，每条记录一个数据报。
///
/// 数据报自带边界，记录末尾的换行保留，收集端可以与 TCP 共用按行解析的逻辑。
/// 对端不可达通常以 `ConnectionRefused` 出现在下一次发送上，此时数据流进入 `Broken`。
#[derive(Debug)]
pub struct UdpDataFlow {
    descriptor: DataFlowDescriptor,
    socket: Option<UdpSocket>,
    status: DataFlowStatus,
    peer_addr: Option<SocketAddr>,
    datagrams_sent: u64,
}

fn unspecified_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

fn establish(descriptor: &DataFlowDescriptor) -> Result<(UdpSocket, SocketAddr)> {
    let target = (descriptor.address.as_str(), descriptor.port)
        .to_socket_addrs()
        .map_err(|err| map_io_error(error::RESOLVE, descriptor, err))?
        .next()
        .ok_or_else(|| {
            map_io_error(
                error::RESOLVE,
                descriptor,
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "address resolved to no socket addresses",
                ),
            )
        })?;
    let socket = UdpSocket::bind(unspecified_for(&target))
        .map_err(|err| map_io_error(error::BIND, descriptor, err))?;
    socket
        .connect(target)
        .map_err(|err| map_io_error(error::UDP_CONNECT, descriptor, err))?;
    let configure = |socket: &UdpSocket| -> io::Result<()> {
        if !descriptor.send_timeout.is_zero() {
            socket.set_write_timeout(Some(descriptor.send_timeout))?;
        }
        if let Some(size) = descriptor.send_buffer_size {
            SockRef::from(socket).set_send_buffer_size(size)?;
        }
        Ok(())
    };
    configure(&socket).map_err(|err| map_io_error(error::CONFIGURE, descriptor, err))?;
    Ok((socket, target))
}

impl UdpDataFlow {
    pub fn connect(descriptor: &DataFlowDescriptor) -> Result<Self> {
        let (socket, peer) = establish(descriptor)?;
        info!(flow_id = %descriptor.id, %peer, "udp data flow connected");
        Ok(Self {
            descriptor: descriptor.clone(),
            socket: Some(socket),
            status: DataFlowStatus::Open,
            peer_addr: Some(peer),
            datagrams_sent: 0,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent
    }
}

impl DataFlow for UdpDataFlow {
    fn descriptor(&self) -> &DataFlowDescriptor {
        &self.descriptor
    }

    fn status(&self) -> DataFlowStatus {
        self.status
    }

    fn send(&mut self, record: &MonitorRecord) -> Result<()> {
        let datagram = encode_line(record)?;
        if self.status != DataFlowStatus::Open {
            return Err(not_connected(error::SEND, &self.descriptor));
        }
        let Some(socket) = self.socket.as_ref() else {
            return Err(not_connected(error::SEND, &self.descriptor));
        };
        match socket.send(&datagram) {
            Ok(written) if written == datagram.len() => {
                self.datagrams_sent += 1;
                Ok(())
            }
            Ok(written) => Err(map_io_error(
                error::SEND,
                &self.descriptor,
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("datagram truncated to {written} of {} bytes", datagram.len()),
                ),
            )),
            Err(err) => {
                if err.kind() == io::ErrorKind::ConnectionRefused {
                    warn!(flow_id = %self.descriptor.id, error = %err, "udp peer unreachable");
                    self.status = DataFlowStatus::Broken;
                    self.socket = None;
                }
                Err(map_io_error(error::SEND, &self.descriptor, err))
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
        self.socket = None;
        self.status = DataFlowStatus::Broken;
        let (socket, peer) = establish(&self.descriptor)?;
        self.socket = Some(socket);
        self.peer_addr = Some(peer);
        self.status = DataFlowStatus::Open;
        info!(flow_id = %self.descriptor.id, %peer, "udp data flow reconnected");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.status != DataFlowStatus::Closed {
            self.status = DataFlowStatus::Closed;
            self.socket = None;
            debug!(flow_id = %self.descriptor.id, datagrams = self.datagrams_sent, "udp data flow closed");
        }
        Ok(())
    }
}
