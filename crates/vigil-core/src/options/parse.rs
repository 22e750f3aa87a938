//! 缩进式配置文本解析。
//!
//! 每行一个条目：`key value...` 为标量，只有 `key` 的行开启子块，子块由随后缩进更深的行组成。
//! 同一块内的子项必须使用与首个子项相同的缩进。

use tracing::debug;

use super::block::OptionBlock;
use super::ledger::AllocationLedger;
use crate::error::{Result, VigilError};

struct Line<'a> {
    number: usize,
    indent: usize,
    key: &'a str,
    value: Option<&'a str>,
}

fn tokenize(text: &str) -> Vec<Line<'_>> {
    text.lines()
        .enumerate()
        .filter_map(|(index, raw)| {
            let content = raw.trim_start_matches([' ', '\t']);
            let indent = raw.len() - content.len();
            let content = content.trim_end();
            if content.is_empty() {
                return None;
            }
            let (key, rest) = content
                .split_once(char::is_whitespace)
                .unwrap_or((content, ""));
            let rest = rest.trim();
            Some(Line {
                number: index + 1,
                indent,
                key,
                value: (!rest.is_empty()).then_some(rest),
            })
        })
        .collect()
}

pub(crate) fn parse_text(text: &str, ledger: Option<&AllocationLedger>) -> Result<OptionBlock> {
    let lines = tokenize(text);
    let root = match ledger {
        Some(ledger) => OptionBlock::new_tracked(ledger),
        None => OptionBlock::new(),
    };
    let Some(first) = lines.first() else {
        return Ok(root);
    };
    let mut cursor = 0;
    let block = parse_block(root, &lines, &mut cursor, first.indent)?;
    if let Some(line) = lines.get(cursor) {
        return Err(VigilError::parse(
            line.number,
            "line is indented less than the first entry",
        ));
    }
    debug!(entries = block.len(), "parsed option text");
    Ok(block)
}

fn parse_block(
    mut block: OptionBlock,
    lines: &[Line<'_>],
    cursor: &mut usize,
    indent: usize,
) -> Result<OptionBlock> {
    while let Some(line) = lines.get(*cursor) {
        if line.indent < indent {
            break;
        }
        if line.indent > indent {
            return Err(VigilError::parse(
                line.number,
                format!(
                    "unexpected indentation of {} (block entries use {indent})",
                    line.indent
                ),
            ));
        }
        *cursor += 1;
        match line.value {
            Some(value) => {
                block.insert_scalar(line.key, value);
            }
            None => {
                let child = block.child();
                let child = match lines.get(*cursor) {
                    Some(next) if next.indent > indent => {
                        parse_block(child, lines, cursor, next.indent)?
                    }
                    _ => child,
                };
                debug!(scope = line.key, entries = child.len(), "parsed option scope");
                block.insert_block(line.key, child);
            }
        }
    }
    Ok(block)
}
