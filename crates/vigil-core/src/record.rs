//! # record 模块说明
//!
//! ## 角色定位（Why）
//! - 定义环境经监控数据流与名称服务数据流发出的全部记录；
//! - 线上编码为“一行一个 JSON 文档”，收集端可以逐行切分，无需额外分帧。
//!
//! ## 行为契约（What）
//! - [`SmartbeatRecord`] 是每个心跳节拍为每个服务发出的记录；
//! - `timestamp` 为自 UNIX 纪元起的微秒数；
//! - [`encode_line`] 输出以 `\n` 结尾，[`decode_line`] 容忍行尾的 `\r\n`。

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::service::{ServiceState, ServiceType};

/// 单个服务在一个心跳节拍上的健康快照。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SmartbeatRecord {
    pub service_id: u64,
    pub service_name: String,
    pub state: ServiceState,
    pub checkpoint: u64,
    pub timestamp: u64,
}

/// 监控链路上的记录类型。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorRecord {
    Smartbeat(SmartbeatRecord),
    ServiceCreated {
        service_id: u64,
        service_name: String,
        service_type: ServiceType,
        group: Option<String>,
        activity_timeout_ms: u64,
        timestamp: u64,
    },
    ServiceStateChanged {
        service_id: u64,
        service_name: String,
        from: ServiceState,
        to: ServiceState,
        state_name: String,
        timestamp: u64,
    },
    ServiceDestroyed {
        service_id: u64,
        service_name: String,
        last_state: ServiceState,
        timestamp: u64,
    },
    /// 发往名称服务的注册记录。
    Registration {
        service_id: u64,
        service_name: String,
        service_type: ServiceType,
        timestamp: u64,
    },
    /// 名称服务链路的保活记录。
    NameServerBeat { timestamp: u64 },
}

impl MonitorRecord {
    pub fn as_smartbeat(&self) -> Option<&SmartbeatRecord> {
        match self {
            Self::Smartbeat(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_smartbeat(&self) -> bool {
        matches!(self, Self::Smartbeat(_))
    }

    /// 记录类别名，与线上 `kind` 字段一致。
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Smartbeat(_) => "smartbeat",
            Self::ServiceCreated { .. } => "service_created",
            Self::ServiceStateChanged { .. } => "service_state_changed",
            Self::ServiceDestroyed { .. } => "service_destroyed",
            Self::Registration { .. } => "registration",
            Self::NameServerBeat { .. } => "name_server_beat",
        }
    }
}

/// 编码为以换行结尾的一行 JSON。
pub fn encode_line(record: &MonitorRecord) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// 解码一行 JSON。
pub fn decode_line(line: &[u8]) -> Result<MonitorRecord> {
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    Ok(serde_json::from_slice(trimmed)?)
}
