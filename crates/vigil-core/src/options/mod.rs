//! # options 模块说明
//!
//! ## 角色定位（Why）
//! - 以缩进文本描述层级配置，是环境、数据流与服务的唯一配置入口；
//! - 子块以租约形式借出，释放顺序由租约计数在调试构建中校验。
//!
//! ## 行为契约（What）
//! - [`OptionBlock::parse`]：文本 → 有序块，结构错误返回 `ParseError`；
//! - [`OptionBlock::find_sub_option`]：直接子块查找，返回 [`SubOptions`] 租约；
//! - [`OptionBlock::release`] / [`OptionBlock::release_all`]：显式释放并返回统计；
//! - [`OptionBlock::render`]：再序列化，解析结果与原文本解析结果结构一致。

mod block;
mod ledger;
mod parse;

pub use block::{OptionBlock, OptionNode, OptionValue, ReleaseReport, ScalarValue, SubOptions};
pub use ledger::AllocationLedger;
