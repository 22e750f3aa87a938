use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use super::ledger::{AllocationLedger, Tracked};
use super::parse;
use crate::error::{Result, VigilError};

/// 一个有序的选项块：同名子项唯一，顺序为首次插入顺序。
///
/// # 教案式说明
/// - **意图 (Why)**：配置文本以缩进表达层级，块是层级的节点；环境、数据流与服务都从块中读取
///   类型化配置；
/// - **逻辑 (How)**：子块以 `Arc` 持有，[`find_sub_option`](Self::find_sub_option) 返回的租约
///   与父块共享同一个子块，子块在最后一个持有者释放时析构；
/// - **契约 (What)**：
///   - 名称比较不区分 ASCII 大小写；
///   - 重复写入同名项时后写覆盖，位置保持首次插入处；
///   - 相等性只比较结构（名称与值），不比较租约或账本；
/// - **注意事项 (Trade-offs)**：通过构建器写入的标量若包含换行或为空，`render` 的结果无法再被
///   解析回同一结构，往返保证只覆盖解析得到的树。
#[derive(Debug, Default)]
pub struct OptionBlock {
    nodes: Vec<OptionNode>,
    leases: AtomicUsize,
    tracked: Tracked,
}

/// 块中的一个命名项。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionNode {
    name: String,
    value: OptionValue,
}

/// 选项值：标量文本或嵌套块。
///
/// 克隆是深拷贝：副本拥有独立的子块，不继承原树的租约。
#[derive(Debug, PartialEq, Eq)]
pub enum OptionValue {
    Scalar(ScalarValue),
    Block(Arc<OptionBlock>),
}

/// 标量文本，随账本记账。
#[derive(Debug)]
pub struct ScalarValue {
    text: String,
    tracked: Tracked,
}

/// `find_sub_option` 返回的子块租约。
///
/// 租约存续期间父块仍可正常读取；父块释放后，子块由租约独占并在租约结束时释放。
#[derive(Debug)]
pub struct SubOptions {
    name: String,
    block: Arc<OptionBlock>,
}

/// 一次释放操作的统计结果。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReleaseReport {
    /// 本次真正析构的逻辑对象数。
    pub released: usize,
    /// 因仍被租用而延后析构的子块数。
    pub deferred: usize,
}

impl OptionBlock {
    /// 创建空块。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建挂载账本的空块，之后插入的项都会记账。
    pub fn new_tracked(ledger: &AllocationLedger) -> Self {
        Self {
            nodes: Vec::new(),
            leases: AtomicUsize::new(0),
            tracked: ledger.track(),
        }
    }

    /// 解析配置文本。
    pub fn parse(text: &str) -> Result<Self> {
        parse::parse_text(text, None)
    }

    /// 解析配置文本，并把每个逻辑对象记入 `ledger`。
    pub fn parse_tracked(text: &str, ledger: &AllocationLedger) -> Result<Self> {
        parse::parse_text(text, Some(ledger))
    }

    /// 读取并解析配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            VigilError::config(path.display().to_string(), format!("cannot read file: {err}"))
        })?;
        Self::parse(&text)
    }

    pub(crate) fn child(&self) -> Self {
        Self {
            nodes: Vec::new(),
            leases: AtomicUsize::new(0),
            tracked: self.tracked.sibling(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionNode> {
        self.nodes.iter()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.name.eq_ignore_ascii_case(name))
    }

    /// 按名称查找直接子项。
    pub fn get(&self, name: &str) -> Option<&OptionNode> {
        self.position(name).map(|index| &self.nodes[index])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// 读取标量值；名称不存在或对应的是块时返回 `None`。
    pub fn scalar(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|node| node.value.as_scalar())
    }

    /// 借用子块；名称不存在或对应的是标量时返回 `None`。
    pub fn block(&self, name: &str) -> Option<&OptionBlock> {
        self.get(name).and_then(|node| node.value.as_block())
    }

    /// 读取可选子块：缺失返回 `Ok(None)`，名称存在但不是块时返回配置错误。
    pub fn optional_block(&self, name: &str) -> Result<Option<&OptionBlock>> {
        match self.get(name) {
            None => Ok(None),
            Some(node) => match &node.value {
                OptionValue::Block(block) => Ok(Some(block)),
                OptionValue::Scalar(_) => Err(VigilError::config(
                    name,
                    "expected an indented block, found a scalar value",
                )),
            },
        }
    }

    /// 把标量解析为 `T`；缺失返回 `Ok(None)`，无法解析时返回配置错误。
    pub fn parse_scalar<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(node) = self.get(name) else {
            return Ok(None);
        };
        let Some(text) = node.value.as_scalar() else {
            return Err(VigilError::config(name, "expected a scalar value, found a block"));
        };
        text.parse::<T>()
            .map(Some)
            .map_err(|err| VigilError::config(name, format!("`{text}`: {err}")))
    }

    /// 读取布尔开关，接受 `1/0`、`true/false`、`yes/no`、`on/off`。
    pub fn flag(&self, name: &str) -> Result<Option<bool>> {
        let Some(node) = self.get(name) else {
            return Ok(None);
        };
        match node.value.as_scalar().map(str::to_ascii_lowercase).as_deref() {
            Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
            Some("0" | "false" | "no" | "off") => Ok(Some(false)),
            Some(other) => Err(VigilError::config(
                name,
                format!("`{other}` is not a boolean flag"),
            )),
            None => Err(VigilError::config(name, "expected a flag, found a block")),
        }
    }

    /// 查找直接子块并返回租约。
    ///
    /// # 契约 (What)
    /// - 只查找直接子项，名称不区分大小写；
    /// - 未命中或命中的是标量时返回 [`VigilError::NotFound`]；
    /// - 租约与父块共享子块，父块此后仍可读取该子块；应先释放租约再释放父块。
    pub fn find_sub_option(&self, name: &str) -> Result<SubOptions> {
        let block = self
            .get(name)
            .and_then(|node| match &node.value {
                OptionValue::Block(block) => Some(block),
                OptionValue::Scalar(_) => None,
            })
            .ok_or_else(|| VigilError::NotFound {
                name: name.to_owned(),
            })?;
        block.leases.fetch_add(1, Ordering::AcqRel);
        Ok(SubOptions {
            name: name.to_owned(),
            block: Arc::clone(block),
        })
    }

    /// 写入标量，同名项存在时覆盖其值。
    pub fn insert_scalar(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let value = OptionValue::Scalar(ScalarValue {
            text: value.into(),
            tracked: self.tracked.sibling(),
        });
        self.upsert(name.into(), value);
        self
    }

    /// 写入子块，同名项存在时覆盖其值。
    pub fn insert_block(&mut self, name: impl Into<String>, block: OptionBlock) -> &mut Self {
        self.upsert(name.into(), OptionValue::Block(Arc::new(block)));
        self
    }

    fn upsert(&mut self, name: String, value: OptionValue) {
        match self.position(&name) {
            Some(index) => self.nodes[index].value = value,
            None => self.nodes.push(OptionNode { name, value }),
        }
    }

    /// 移除直接子项。
    pub fn remove(&mut self, name: &str) -> Option<OptionNode> {
        self.position(name).map(|index| self.nodes.remove(index))
    }

    /// 子树中仍未归还的租约总数。
    pub fn outstanding_leases(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(|node| node.value.as_block())
            .map(|block| block.leases.load(Ordering::Acquire) + block.outstanding_leases())
            .sum()
    }

    /// 释放本块。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：子块租约要求“先子后父”的释放顺序；违反顺序不会造成重复释放，
    ///   但往往意味着调用方遗漏了租约；
    /// - **逻辑 (How)**：先统计未归还租约，再析构本块；被租用的子块只减少一次引用，
    ///   由租约在归还时完成析构；
    /// - **契约 (What)**：调试构建中存在未归还租约时返回 [`VigilError::Lifecycle`]，
    ///   但释放本身已安全完成；发布构建仅记录告警并返回统计。
    pub fn release(self) -> Result<ReleaseReport> {
        let leased = self.outstanding_leases();
        let report = self.release_all();
        if leased > 0 {
            warn!(
                leased,
                deferred = report.deferred,
                "option block released while sub-option leases are outstanding"
            );
            if cfg!(debug_assertions) {
                return Err(VigilError::lifecycle(
                    "options.release",
                    format!("{leased} sub-option lease(s) must be released before their parent"),
                ));
            }
        }
        Ok(report)
    }

    /// 结构化释放整棵子树，不检查租约。
    pub fn release_all(self) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        self.count_into(&mut report);
        report
    }

    fn count_into(&self, report: &mut ReleaseReport) {
        report.released += 1;
        for node in &self.nodes {
            match &node.value {
                OptionValue::Scalar(_) => report.released += 1,
                OptionValue::Block(block) if Arc::strong_count(block) == 1 => {
                    block.count_into(report);
                }
                OptionValue::Block(_) => report.deferred += 1,
            }
        }
    }

    /// 以每层一个空格的缩进重新序列化。
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        for node in &self.nodes {
            out.extend(std::iter::repeat_n(' ', depth));
            out.push_str(&node.name);
            match &node.value {
                OptionValue::Scalar(scalar) => {
                    out.push(' ');
                    out.push_str(&scalar.text);
                    out.push('\n');
                }
                OptionValue::Block(block) => {
                    out.push('\n');
                    block.render_into(out, depth + 1);
                }
            }
        }
    }
}

impl Clone for OptionBlock {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            leases: AtomicUsize::new(0),
            tracked: self.tracked.sibling(),
        }
    }
}

impl Clone for OptionValue {
    fn clone(&self) -> Self {
        match self {
            Self::Scalar(scalar) => Self::Scalar(scalar.clone()),
            Self::Block(block) => Self::Block(Arc::new(OptionBlock::clone(block))),
        }
    }
}

impl PartialEq for OptionBlock {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl Eq for OptionBlock {}

impl fmt::Display for OptionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for OptionBlock {
    type Err = VigilError;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

impl OptionNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &OptionValue {
        &self.value
    }
}

impl OptionValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(scalar) => Some(&scalar.text),
            Self::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&OptionBlock> {
        match self {
            Self::Block(block) => Some(block),
            Self::Scalar(_) => None,
        }
    }
}

impl ScalarValue {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Clone for ScalarValue {
    fn clone(&self) -> Self {
        Self {
            text: self.text.clone(),
            tracked: self.tracked.sibling(),
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for ScalarValue {}

impl SubOptions {
    /// 查找时使用的名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 归还租约；若父块已释放，子块在此析构。
    pub fn release(self) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        if Arc::strong_count(&self.block) == 1 {
            self.block.count_into(&mut report);
        }
        report
    }
}

impl Deref for SubOptions {
    type Target = OptionBlock;

    fn deref(&self) -> &OptionBlock {
        &self.block
    }
}

impl Drop for SubOptions {
    fn drop(&mut self) {
        self.block.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitoring() -> OptionBlock {
        OptionBlock::parse(
            "monitoring_data_flow_options\n data_flow_id 10001\n connect_port 20001\n nodelay 1\n",
        )
        .expect("valid options")
    }

    #[test]
    fn lookups_ignore_ascii_case() {
        let options = monitoring();
        let flow = options.block("MONITORING_DATA_FLOW_OPTIONS").expect("block");
        assert_eq!(flow.scalar("Data_Flow_Id"), Some("10001"));
        assert_eq!(flow.parse_scalar::<u16>("connect_port").unwrap(), Some(20001));
        assert_eq!(flow.flag("nodelay").unwrap(), Some(true));
    }

    #[test]
    fn typed_accessors_reject_mismatched_shapes() {
        let options = monitoring();
        assert!(matches!(
            options.parse_scalar::<u32>("monitoring_data_flow_options"),
            Err(VigilError::Config { .. })
        ));
        let flow = options.block("monitoring_data_flow_options").unwrap();
        assert!(matches!(
            flow.optional_block("nodelay"),
            Err(VigilError::Config { .. })
        ));
        assert!(matches!(
            flow.parse_scalar::<u8>("connect_port"),
            Err(VigilError::Config { .. })
        ));
    }

    #[test]
    fn later_writes_win_and_keep_position() {
        let mut block = OptionBlock::new();
        block
            .insert_scalar("a", "1")
            .insert_scalar("b", "2")
            .insert_scalar("A", "3");
        let names: Vec<_> = block.iter().map(OptionNode::name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(block.scalar("a"), Some("3"));
    }

    #[test]
    fn find_sub_option_misses_scalars_and_unknown_names() {
        let options = monitoring();
        let flow = options.find_sub_option("monitoring_data_flow_options").unwrap();
        assert!(matches!(
            flow.find_sub_option("nodelay"),
            Err(VigilError::NotFound { .. })
        ));
        assert!(matches!(
            options.find_sub_option("name_server_options"),
            Err(VigilError::NotFound { .. })
        ));
        flow.release();
        assert_eq!(options.outstanding_leases(), 0);
    }

    #[test]
    fn clones_own_their_sub_blocks() {
        let ledger = AllocationLedger::new();
        let original = OptionBlock::parse_tracked(
            "outer\n inner\n  depth 2\n width 1\n",
            &ledger,
        )
        .unwrap();
        let before = ledger.live();
        let copy = original.clone();
        assert_eq!(copy, original);
        assert_eq!(ledger.live(), before * 2);

        let lease = original.find_sub_option("outer").unwrap();
        assert_eq!(copy.outstanding_leases(), 0);
        let report = copy.release().unwrap();
        assert_eq!(report.deferred, 0);
        assert_eq!(report.released, before);

        lease.release();
        assert_eq!(original.release_all().deferred, 0);
        assert_eq!(ledger.live(), 0);
    }
}
