use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, VigilError};
use crate::options::OptionBlock;

/// 默认连接目标。
pub const DEFAULT_CONNECT_ADDRESS: &str = "127.0.0.1";
/// 建立连接的默认超时。
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// 单次发送的默认超时。
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// 数据流标识，在一个环境内唯一。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DataFlowId(u32);

impl DataFlowId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DataFlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 数据流使用的传输协议。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum DataFlowProtocol {
    #[default]
    Tcp,
    Udp,
}

impl DataFlowProtocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for DataFlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataFlowProtocol {
    type Err = String;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        if text.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if text.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(format!("unsupported data flow protocol `{text}`"))
        }
    }
}

/// 数据流当前的连接状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DataFlowStatus {
    Open,
    /// 连接已断开，可由上层在下一节拍调用 `reconnect`。
    Broken,
    Closed,
}

/// 打开一条数据流所需的全部参数。
///
/// # 教案式说明
/// - **意图 (Why)**：把配置块一次性校验为强类型描述，传输实现不再接触原始文本；
/// - **契约 (What)**：
///   - `data_flow_id` 与 `connect_port` 必填，缺失或非数值时返回配置错误；
///   - `connect_address` 缺省为回环地址，`destination_address`/`destination_port` 为别名；
///   - `nodelay` 缺省关闭，超时以毫秒配置；
/// - **注意事项 (Trade-offs)**：协议不在块内决定，由调用方根据所在配置位置传入。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataFlowDescriptor {
    pub id: DataFlowId,
    pub name: String,
    pub protocol: DataFlowProtocol,
    pub address: String,
    pub port: u16,
    pub nodelay: bool,
    pub send_buffer_size: Option<usize>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
}

impl DataFlowDescriptor {
    /// 以默认参数构造描述，供编程方式创建数据流。
    pub fn new(id: DataFlowId, protocol: DataFlowProtocol, port: u16) -> Self {
        Self {
            id,
            name: format!("{protocol} data flow {id}"),
            protocol,
            address: DEFAULT_CONNECT_ADDRESS.to_owned(),
            port,
            nodelay: false,
            send_buffer_size: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// 从数据流配置块构造描述。
    pub fn from_block(block: &OptionBlock, protocol: DataFlowProtocol) -> Result<Self> {
        let id = block
            .parse_scalar::<u32>("data_flow_id")?
            .map(DataFlowId::new)
            .ok_or_else(|| VigilError::config("data_flow_id", "required key is missing"))?;
        let port = match block.parse_scalar::<u16>("connect_port")? {
            Some(port) => port,
            None => block
                .parse_scalar::<u16>("destination_port")?
                .ok_or_else(|| VigilError::config("connect_port", "required key is missing"))?,
        };
        let mut descriptor = Self::new(id, protocol, port);
        if let Some(name) = block.scalar("data_flow_name") {
            descriptor.name = name.to_owned();
        }
        if let Some(address) = block
            .scalar("connect_address")
            .or_else(|| block.scalar("destination_address"))
        {
            descriptor.address = address.to_owned();
        }
        descriptor.nodelay = block.flag("nodelay")?.unwrap_or(false);
        descriptor.send_buffer_size = block.parse_scalar::<usize>("send_buffer_size")?;
        if let Some(ms) = block.parse_scalar::<u64>("connect_timeout_ms")? {
            descriptor.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = block.parse_scalar::<u64>("send_timeout_ms")? {
            descriptor.send_timeout = Duration::from_millis(ms);
        }
        if descriptor.connect_timeout.is_zero() {
            return Err(VigilError::config("connect_timeout_ms", "must be positive"));
        }
        Ok(descriptor)
    }

    /// `address:port` 形式的连接目标。
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitoring_block_with_defaults() {
        let block =
            OptionBlock::parse("data_flow_id 10001\nconnect_port 20001\nnodelay 1\n").unwrap();
        let descriptor = DataFlowDescriptor::from_block(&block, DataFlowProtocol::Tcp).unwrap();
        assert_eq!(descriptor.id, DataFlowId::new(10001));
        assert_eq!(descriptor.endpoint(), "127.0.0.1:20001");
        assert!(descriptor.nodelay);
        assert_eq!(descriptor.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn destination_aliases_are_accepted() {
        let block = OptionBlock::parse(
            "data_flow_name ns\ndata_flow_id 3\ndestination_address 10.0.0.9\ndestination_port 9\n",
        )
        .unwrap();
        let descriptor = DataFlowDescriptor::from_block(&block, DataFlowProtocol::Udp).unwrap();
        assert_eq!(descriptor.endpoint(), "10.0.0.9:9");
        assert_eq!(descriptor.name, "ns");
    }

    #[test]
    fn missing_or_malformed_keys_are_config_errors() {
        for text in [
            "connect_port 1\n",
            "data_flow_id 1\n",
            "data_flow_id x\nconnect_port 1\n",
            "data_flow_id 1\nconnect_port 70000\n",
            "data_flow_id 1\nconnect_port 1\nnodelay maybe\n",
        ] {
            let block = OptionBlock::parse(text).unwrap();
            let err = DataFlowDescriptor::from_block(&block, DataFlowProtocol::Tcp).unwrap_err();
            assert!(matches!(err, VigilError::Config { .. }), "{text:?}: {err}");
        }
    }

    #[test]
    fn protocol_names_are_case_insensitive() {
        assert_eq!("UDP".parse::<DataFlowProtocol>(), Ok(DataFlowProtocol::Udp));
        assert!("sctp".parse::<DataFlowProtocol>().is_err());
    }
}
