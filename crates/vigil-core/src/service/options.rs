use std::time::Duration;

use crate::error::{Result, VigilError};
use crate::options::OptionBlock;

/// 监控端判定服务失活的默认时长。
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_millis(1200);

/// 服务级配置。
///
/// 可识别的键：
/// - `activity_timeout`：毫秒，显式给出时不得小于生效的心跳间隔；未给出时取
///   [`DEFAULT_ACTIVITY_TIMEOUT`] 与心跳间隔中的较大者；
/// - `smartbeat_interval`：毫秒，覆盖环境的心跳间隔；
/// - `svcgrp_name`：服务组名，随注册通知上报。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceOptions {
    pub activity_timeout: Option<Duration>,
    pub smartbeat_interval: Option<Duration>,
    pub group: Option<String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            activity_timeout: None,
            smartbeat_interval: None,
            group: None,
        }
    }
}

impl ServiceOptions {
    pub fn from_block(block: &OptionBlock) -> Result<Self> {
        let mut options = Self::default();
        if let Some(ms) = block.parse_scalar::<u64>("activity_timeout")? {
            options.activity_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = block.parse_scalar::<u64>("smartbeat_interval")? {
            if ms == 0 {
                return Err(VigilError::config("smartbeat_interval", "must be positive"));
            }
            options.smartbeat_interval = Some(Duration::from_millis(ms));
        }
        options.group = block.scalar("svcgrp_name").map(str::to_owned);
        Ok(options)
    }

    /// 生效的心跳间隔：服务覆盖值优先，否则取环境值。
    pub fn effective_interval(&self, environment_default: Duration) -> Duration {
        self.smartbeat_interval.unwrap_or(environment_default)
    }

    /// 上报给监控端的失活时长。
    pub fn effective_activity_timeout(&self, environment_default: Duration) -> Duration {
        self.activity_timeout.unwrap_or_else(|| {
            DEFAULT_ACTIVITY_TIMEOUT.max(self.effective_interval(environment_default))
        })
    }

    /// 显式的失活时长短于心跳间隔时，监控端会在两次心跳之间误判失活。
    pub(crate) fn validate(&self, environment_default: Duration) -> Result<()> {
        let interval = self.effective_interval(environment_default);
        let Some(activity_timeout) = self.activity_timeout else {
            return Ok(());
        };
        if activity_timeout < interval {
            return Err(VigilError::config(
                "activity_timeout",
                format!(
                    "{} ms is shorter than the smartbeat interval of {} ms",
                    activity_timeout.as_millis(),
                    interval.as_millis()
                ),
            ));
        }
        Ok(())
    }
}
