//! 时间来源抽象：生产环境读系统时钟，测试注入虚拟时钟。

mod clock;

pub use clock::{Clock, MockClock, SystemClock, unix_micros};
