//! `LOAD DATA LOCAL INFILE` 语句解析
//!
//! 回放进程输出中的批量导入语句需要在本地读取数据文件，
//! 这里从语句中取出文件路径和行格式（字段分隔符、转义字符、行结束符）。

use std::io;
use std::path::PathBuf;

use crate::error::invalid_data;
use crate::row_boundary::Dialect;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadDataStatement {
    pub path: PathBuf,
    pub dialect: Dialect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(Vec<u8>),
    Punct(u8),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(statement: &[u8]) -> io::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < statement.len() {
        let c = statement[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'/' if statement.get(i + 1) == Some(&b'*') => {
                let end = statement[i + 2..]
                    .windows(2)
                    .position(|w| w == b"*/")
                    .ok_or_else(|| invalid_data("LOAD DATA语句中的注释没有结束"))?;
                i += 2 + end + 2;
            }
            b'\'' | b'"' => {
                let (value, next) = unquote(statement, i)?;
                tokens.push(Token::Str(value));
                i = next;
            }
            b'`' => {
                let end = statement[i + 1..]
                    .iter()
                    .position(|b| *b == b'`')
                    .ok_or_else(|| invalid_data("LOAD DATA语句中的标识符没有结束"))?;
                let name = String::from_utf8_lossy(&statement[i + 1..i + 1 + end]).into_owned();
                tokens.push(Token::Word(name));
                i += end + 2;
            }
            c if c.is_ascii_alphanumeric() || c == b'_' || c == b'$' => {
                let start = i;
                while i < statement.len()
                    && (statement[i].is_ascii_alphanumeric() || matches!(statement[i], b'_' | b'$' | b'.'))
                {
                    i += 1;
                }
                tokens.push(Token::Word(String::from_utf8_lossy(&statement[start..i]).into_owned()));
            }
            c => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

/// 解析从 `start` 开始的引号字符串，返回内容和下一个位置
fn unquote(input: &[u8], start: usize) -> io::Result<(Vec<u8>, usize)> {
    let quote = input[start];
    let mut value = Vec::new();
    let mut i = start + 1;

    while i < input.len() {
        let c = input[i];
        if c == b'\\' && i + 1 < input.len() {
            value.push(match input[i + 1] {
                b'n' => b'\n',
                b't' => b'\t',
                b'r' => b'\r',
                b'0' => 0,
                b'b' => 0x08,
                b'Z' => 0x1a,
                other => other,
            });
            i += 2;
        } else if c == quote {
            if input.get(i + 1) == Some(&quote) {
                value.push(quote);
                i += 2;
            } else {
                return Ok((value, i + 1));
            }
        } else {
            value.push(c);
            i += 1;
        }
    }
    Err(invalid_data("LOAD DATA语句中的字符串没有结束"))
}

/// 跳过空白和块注释，返回下一个单词及其后的位置
fn next_word(statement: &[u8], mut i: usize) -> Option<(&[u8], usize)> {
    loop {
        match statement.get(i)? {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'/' if statement.get(i + 1) == Some(&b'*') => {
                let end = statement[i + 2..].windows(2).position(|w| w == b"*/")?;
                i += 2 + end + 2;
            }
            _ => break,
        }
    }
    let start = i;
    while statement.get(i).is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_') {
        i += 1;
    }
    (i > start).then(|| (&statement[start..i], i))
}

/// 只看开头的两个关键字，其他语句不做完整的词法分析
fn starts_with_load_data(statement: &[u8]) -> bool {
    let Some((first, next)) = next_word(statement, 0) else {
        return false;
    };
    first.eq_ignore_ascii_case(b"LOAD")
        && next_word(statement, next).is_some_and(|(second, _)| second.eq_ignore_ascii_case(b"DATA"))
}

/// 解析 `LOAD DATA ... LOCAL INFILE` 语句
///
/// 不是本地批量导入语句时返回 `Ok(None)`
pub fn parse_load_data(statement: &[u8]) -> io::Result<Option<LoadDataStatement>> {
    if !starts_with_load_data(statement) {
        return Ok(None);
    }
    let tokens = tokenize(statement)?;
    let mut iter = tokens.iter().peekable();

    if !iter.next().is_some_and(|t| t.is_keyword("LOAD")) || !iter.next().is_some_and(|t| t.is_keyword("DATA")) {
        return Ok(None);
    }
    while iter.peek().is_some_and(|t| t.is_keyword("LOW_PRIORITY") || t.is_keyword("CONCURRENT")) {
        iter.next();
    }
    if !iter.next().is_some_and(|t| t.is_keyword("LOCAL")) {
        return Ok(None);
    }
    if !iter.next().is_some_and(|t| t.is_keyword("INFILE")) {
        return Err(invalid_data("LOAD DATA LOCAL之后缺少INFILE"));
    }
    let path = match iter.next() {
        Some(Token::Str(path)) => PathBuf::from(String::from_utf8_lossy(path).into_owned()),
        _ => return Err(invalid_data("LOAD DATA LOCAL INFILE缺少文件名")),
    };

    let mut dialect = Dialect::default();
    let mut in_lines = false;
    while let Some(token) = iter.next() {
        if token.is_keyword("FIELDS") || token.is_keyword("COLUMNS") {
            in_lines = false;
            continue;
        }
        if token.is_keyword("LINES") {
            in_lines = true;
            continue;
        }

        let clause = ["TERMINATED", "ESCAPED", "ENCLOSED", "STARTING"]
            .into_iter()
            .find(|keyword| token.is_keyword(keyword));
        let Some(clause) = clause else {
            continue;
        };
        if !iter.peek().is_some_and(|t| t.is_keyword("BY")) {
            continue;
        }
        iter.next();
        let value = match iter.next() {
            Some(Token::Str(value)) => value.clone(),
            _ => return Err(invalid_data(format!("{} BY之后缺少字符串", clause))),
        };

        match (clause, in_lines) {
            ("TERMINATED", true) => dialect.lines_terminated_by = value,
            ("TERMINATED", false) => dialect.fields_terminated_by = value,
            ("ESCAPED", _) => dialect.fields_escaped_by = value.first().copied(),
            _ => {}
        }
    }

    if dialect.lines_terminated_by.is_empty() {
        return Err(invalid_data("LOAD DATA的行结束符为空"));
    }
    Ok(Some(LoadDataStatement { path, dialect }))
}
