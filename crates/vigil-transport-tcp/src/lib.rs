#![doc = r#"
# vigil-transport-tcp

## 模块使命（Why）
- 为 `vigil-core` 的数据流契约提供真实套接字实现：监控记录经 TCP 或 UDP 送往外部收集端；
- 核心 crate 不感知网络细节，测试可以换用内存连接器，生产环境只需换上 [`NetConnector`]。

## 核心契约（What）
- [`NetConnector`]：按描述中的协议打开 [`TcpDataFlow`] 或 [`UdpDataFlow`]；
- 线上格式为一行一个 JSON 文档，TCP 以换行分帧，UDP 每条记录一个数据报；
- 目标不可达返回 `Connect` 错误；已建立的数据流写失败返回 `Transport` 错误并进入 `Broken`，
  是否重连由环境在下一个调度节拍决定。

## 实现策略（How）
- 使用标准库阻塞套接字，连接超时由 `connect_timeout` 约束，写超时由 `set_write_timeout` 约束；
- 发送缓冲区与 `SO_LINGER` 经 `socket2::SockRef` 写入，不接管套接字所有权。

## 风险与考量（Trade-offs）
- 阻塞写会占用宿主的调度节拍，发送超时应明显短于心跳间隔；
- 对端关闭后的首次写入可能成功，断开要到后续写入才会暴露。
"#]

mod connector;
mod error;
mod tcp;
mod udp;

pub use connector::NetConnector;
pub use tcp::{TcpDataFlow, TcpSocketConfig};
pub use udp::UdpDataFlow;

use vigil_core::{Environment, OptionBlock, Result};

/// 以系统时钟与 [`NetConnector`] 按配置创建环境。
pub fn open_environment(options: &OptionBlock) -> Result<Environment> {
    Environment::create(options, NetConnector::new())
}

/// 解析配置文本并以 [`NetConnector`] 创建环境。
pub fn open_environment_from_text(text: &str) -> Result<Environment> {
    Environment::from_text(text, NetConnector::new())
}
