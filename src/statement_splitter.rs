//! 把回放进程输出的SQL文本切分为语句
//!
//! 支持 `DELIMITER` 指令、引号与块注释中的分隔符、`\g`/`\G` 结束标记，
//! 以及需要立即应用到会话上的字符集切换指令 `\C`（包括 `/*!\C name */` 形式）。
//! 以 `#` 或 `-- ` 开头的注释行不作为语句返回。

use std::io::{self, BufRead};

use crate::error::invalid_data;
use crate::trace_log;

/// 切分出的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// 一条语句，不含分隔符，首尾空白已去除
    Statement(Vec<u8>),
    /// 切换会话字符集
    CharsetSwitch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Normal,
    Quoted(u8),
    BlockComment,
}

pub struct StatementSplitter<R> {
    input: R,
    delimiter: Vec<u8>,
    context: Context,
    /// 当前行，`pos` 之前的部分已处理
    line: Vec<u8>,
    pos: usize,
    statement: Vec<u8>,
    line_number: u64,
}

impl<R: BufRead> StatementSplitter<R> {
    pub fn new(input: R) -> StatementSplitter<R> {
        StatementSplitter {
            input,
            delimiter: b";".to_vec(),
            context: Context::Normal,
            line: Vec::new(),
            pos: 0,
            statement: Vec::new(),
            line_number: 0,
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// 已读取的行数
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    /// 返回下一项，输入结束时返回 `None`
    ///
    /// 输入在一条语句、引号或注释中间结束是格式错误
    pub fn next_item(&mut self) -> io::Result<Option<Item>> {
        loop {
            if self.pos >= self.line.len() {
                self.line.clear();
                self.pos = 0;
                if self.input.read_until(b'\n', &mut self.line)? == 0 {
                    return self.finish();
                }
                self.line_number += 1;

                if self.at_statement_start() {
                    if let Some(item) = self.directive()? {
                        return Ok(Some(item));
                    }
                    if self.pos >= self.line.len() {
                        continue;
                    }
                }
            }

            if let Some(statement) = self.scan_line() {
                if !statement.is_empty() {
                    return Ok(Some(Item::Statement(statement)));
                }
            }
        }
    }

    fn at_statement_start(&self) -> bool {
        self.context == Context::Normal && self.statement.trim_ascii().is_empty()
    }

    fn finish(&mut self) -> io::Result<Option<Item>> {
        match self.context {
            Context::Quoted(quote) => Err(invalid_data(format!(
                "第{}行: 输入在 {} 引号中结束",
                self.line_number, quote as char
            ))),
            Context::BlockComment => Err(invalid_data(format!(
                "第{}行: 输入在注释中结束",
                self.line_number
            ))),
            Context::Normal if !self.statement.trim_ascii().is_empty() => {
                let head = String::from_utf8_lossy(&self.statement[..self.statement.len().min(64)]).into_owned();
                Err(invalid_data(format!(
                    "第{}行: 语句没有以分隔符 {} 结束: {}",
                    self.line_number,
                    String::from_utf8_lossy(&self.delimiter),
                    head.trim()
                )))
            }
            Context::Normal => Ok(None),
        }
    }

    /// 处理行首的客户端指令和注释行，整行被消费时 `pos` 移到行尾
    fn directive(&mut self) -> io::Result<Option<Item>> {
        let text = self.line.trim_ascii();
        let consume_line = text.is_empty()
            || text.starts_with(b"#")
            || text == b"--"
            || text.starts_with(b"-- ")
            || text.starts_with(b"--\t");
        if consume_line {
            self.pos = self.line.len();
            self.statement.clear();
            return Ok(None);
        }

        if let Some(rest) = strip_keyword(text, b"delimiter") {
            let delimiter = rest.trim_ascii();
            if delimiter.is_empty() {
                return Err(invalid_data(format!("第{}行: DELIMITER 缺少参数", self.line_number)));
            }
            trace_log!("分隔符改为 {}", String::from_utf8_lossy(delimiter));
            self.delimiter = delimiter.to_vec();
            self.pos = self.line.len();
            self.statement.clear();
            return Ok(None);
        }

        let charset = text
            .strip_prefix(b"/*!\\C")
            .or_else(|| text.strip_prefix(b"\\C"))
            .filter(|rest| rest.first().is_some_and(u8::is_ascii_whitespace));
        if let Some(rest) = charset {
            let name: Vec<u8> = rest
                .trim_ascii_start()
                .iter()
                .copied()
                .take_while(|b| !b.is_ascii_whitespace() && *b != b'*' && *b != b';')
                .collect();
            if name.is_empty() {
                return Err(invalid_data(format!("第{}行: \\C 缺少字符集", self.line_number)));
            }
            self.pos = self.line.len();
            self.statement.clear();
            return Ok(Some(Item::CharsetSwitch(String::from_utf8_lossy(&name).into_owned())));
        }

        Ok(None)
    }

    /// 在当前行中查找语句结束，找到时返回语句
    fn scan_line(&mut self) -> Option<Vec<u8>> {
        let line = &self.line;
        let mut i = self.pos;

        while i < line.len() {
            let b = line[i];
            match self.context {
                Context::BlockComment => {
                    if b == b'*' && line.get(i + 1) == Some(&b'/') {
                        self.context = Context::Normal;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                Context::Quoted(quote) => {
                    if b == b'\\' {
                        i += 2;
                    } else if b == quote {
                        if line.get(i + 1) == Some(&quote) {
                            i += 2;
                        } else {
                            self.context = Context::Normal;
                            i += 1;
                        }
                    } else {
                        i += 1;
                    }
                }
                Context::Normal => {
                    let terminator_len = if line[i..].starts_with(&self.delimiter) {
                        Some(self.delimiter.len())
                    } else if b == b'\\' && matches!(line.get(i + 1), Some(b'g' | b'G')) {
                        Some(2)
                    } else {
                        None
                    };
                    if let Some(len) = terminator_len {
                        self.statement.extend_from_slice(&line[self.pos..i]);
                        self.pos = i + len;
                        let statement = self.statement.trim_ascii().to_vec();
                        self.statement.clear();
                        return Some(statement);
                    }

                    match b {
                        b'\'' | b'"' | b'`' => {
                            self.context = Context::Quoted(b);
                            i += 1;
                        }
                        b'/' if line.get(i + 1) == Some(&b'*') => {
                            self.context = Context::BlockComment;
                            i += 2;
                        }
                        // 行内注释一直到行尾，其中不再查找分隔符
                        b'#' => i = line.len(),
                        b'-' if line[i..].starts_with(b"-- ") || line[i..].starts_with(b"--\t") => {
                            i = line.len()
                        }
                        _ => i += 1,
                    }
                }
            }
        }

        let end = line.len();
        self.statement.extend_from_slice(&line[self.pos..end]);
        self.pos = end;
        None
    }
}

/// 不区分大小写地去掉开头的关键字，关键字后必须是空白
fn strip_keyword<'a>(text: &'a [u8], keyword: &[u8]) -> Option<&'a [u8]> {
    if text.len() <= keyword.len() || !text[..keyword.len()].eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &text[keyword.len()..];
    rest[0].is_ascii_whitespace().then_some(rest)
}
