use std::time::Duration;

use crate::data_flow::{DataFlowDescriptor, DataFlowProtocol};
use crate::error::{Result, VigilError};
use crate::options::OptionBlock;

/// 默认心跳间隔。
pub const DEFAULT_SMARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
/// 被替换的监控数据流在关闭前保留的时长，让已排队的记录有机会发完。
pub const DEFAULT_MONITORING_REAP_DELAY: Duration = Duration::from_secs(60);

const NAME_SERVER_OPTIONS: &str = "name_server_options";
const NAME_SERVER_FLOW_OPTIONS: &str = "name_server_data_flow_options";
const NAME_SERVER_PROTOCOL: &str = "name_server_data_flow_protocol";
const INHIBIT_NAME_SERVICE: &str = "inhibit_name_service";
const MONITORING_OPTIONS: &str = "monitoring_data_flow_options";
const MONITORING_PROTOCOL: &str = "monitoring_data_flow_protocol";
const SMARTBEAT_INTERVAL: &str = "smartbeat_interval";

/// 从顶层配置块提取的环境配置。
///
/// # 教案式说明
/// - **意图 (Why)**：在打开任何连接之前完成全部校验，失败时不会留下半初始化的环境；
/// - **契约 (What)**：
///   - `name_server_options`、`monitoring_data_flow_options` 均可缺省；
///   - 名称服务块可以直接写数据流键，也可以嵌套 `name_server_data_flow_options`；
///   - `inhibit_name_service` 为真时忽略名称服务块；
///   - 两条数据流的 `data_flow_id` 不得相同。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvironmentConfig {
    pub name_server: Option<DataFlowDescriptor>,
    pub monitoring: Option<DataFlowDescriptor>,
    pub smartbeat_interval: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name_server: None,
            monitoring: None,
            smartbeat_interval: DEFAULT_SMARTBEAT_INTERVAL,
        }
    }
}

impl EnvironmentConfig {
    pub fn from_options(options: &OptionBlock) -> Result<Self> {
        let name_server = name_server_descriptor(options)?;
        let monitoring = match options.optional_block(MONITORING_OPTIONS)? {
            Some(block) => Some(monitoring_descriptor(block, Some(options))?),
            None => None,
        };
        if let (Some(ns), Some(mon)) = (&name_server, &monitoring)
            && ns.id == mon.id
        {
            return Err(VigilError::config(
                "data_flow_id",
                format!("{} is used by both the name server and monitoring flows", ns.id),
            ));
        }
        let smartbeat_interval = match options.parse_scalar::<u64>(SMARTBEAT_INTERVAL)? {
            Some(0) => return Err(VigilError::config(SMARTBEAT_INTERVAL, "must be positive")),
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_SMARTBEAT_INTERVAL,
        };
        Ok(Self {
            name_server,
            monitoring,
            smartbeat_interval,
        })
    }
}

fn name_server_descriptor(options: &OptionBlock) -> Result<Option<DataFlowDescriptor>> {
    if options.flag(INHIBIT_NAME_SERVICE)?.unwrap_or(false) {
        return Ok(None);
    }
    let Some(block) = options.optional_block(NAME_SERVER_OPTIONS)? else {
        return Ok(None);
    };
    let protocol = block
        .parse_scalar::<DataFlowProtocol>(NAME_SERVER_PROTOCOL)?
        .unwrap_or_default();
    let flow = block.optional_block(NAME_SERVER_FLOW_OPTIONS)?.unwrap_or(block);
    DataFlowDescriptor::from_block(flow, protocol).map(Some)
}

/// 解析监控数据流块；协议优先取块内设置，其次取顶层设置。
pub(crate) fn monitoring_descriptor(
    block: &OptionBlock,
    parent: Option<&OptionBlock>,
) -> Result<DataFlowDescriptor> {
    let protocol = match block.parse_scalar::<DataFlowProtocol>(MONITORING_PROTOCOL)? {
        Some(protocol) => protocol,
        None => match parent {
            Some(parent) => parent
                .parse_scalar::<DataFlowProtocol>(MONITORING_PROTOCOL)?
                .unwrap_or_default(),
            None => DataFlowProtocol::default(),
        },
    };
    DataFlowDescriptor::from_block(block, protocol)
}
