//! 错误分类
//!
//! 全部操作返回 `io::Result`，不同类别的失败通过 `io::ErrorKind` 区分：
//! - 配置错误 => `InvalidInput`
//! - 数据/协议不一致 => `InvalidData`
//! - 事件流被截断 => `UnexpectedEof`
//! - 用户中断 => 携带 `Cancelled` 的错误，用 `is_interrupted` 识别
//! - 能力不支持 => `Unsupported`
//!
//! 取消不使用 `ErrorKind::Interrupted`：标准库的 `read_exact`、`write_all`、
//! `io::copy` 会把它当作瞬时错误无限重试。

use std::fmt::{self, Display};
use std::io;

use fault_injection::annotate;

use crate::warn_log;

/// 取消标记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "操作已被中断")
    }
}

impl std::error::Error for Cancelled {}

/// 用户中断或其他阶段失败导致的取消，不带位置注解以便调用方识别
pub fn interrupted() -> io::Error {
    io::Error::other(Cancelled)
}

/// 判断错误是否为取消
pub fn is_interrupted(error: &io::Error) -> bool {
    error.get_ref().is_some_and(|inner| inner.is::<Cancelled>())
}

pub(crate) fn config_error(msg: impl Display) -> io::Error {
    annotate!(io::Error::new(io::ErrorKind::InvalidInput, msg.to_string()))
}

pub(crate) fn invalid_data(msg: impl Display) -> io::Error {
    annotate!(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
}

pub(crate) fn truncated(msg: impl Display) -> io::Error {
    annotate!(io::Error::new(io::ErrorKind::UnexpectedEof, msg.to_string()))
}

pub(crate) fn unsupported(msg: impl Display) -> io::Error {
    annotate!(io::Error::new(io::ErrorKind::Unsupported, msg.to_string()))
}

/// 给错误加上上下文前缀，保留原始的 `ErrorKind`，取消错误原样返回
pub(crate) fn with_context(error: io::Error, context: impl Display) -> io::Error {
    if is_interrupted(&error) {
        return error;
    }
    io::Error::new(error.kind(), format!("{}: {}", context, error))
}

/// 非致命的逐项错误收集器
///
/// 某一项（例如一个不存在的输入目录）失败时不终止整个运行，
/// 在运行结束时统一报告并强制返回错误
#[derive(Debug, Default)]
pub struct ItemErrors {
    errors: Vec<(String, io::Error)>,
}

impl ItemErrors {
    pub fn new() -> ItemErrors {
        ItemErrors::default()
    }

    pub fn push(&mut self, item: impl Into<String>, error: io::Error) {
        let item = item.into();
        warn_log!("{}: {}", item, error);
        self.errors.push((item, error));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn items(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|(item, _)| item.as_str())
    }

    pub fn extend(&mut self, other: ItemErrors) {
        self.errors.extend(other.errors);
    }

    /// 没有错误时返回 `Ok(())`，否则把所有条目合并为一个错误
    pub fn into_result(self) -> io::Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }

        let details = self
            .errors
            .iter()
            .map(|(item, error)| format!("{}: {}", item, error))
            .collect::<Vec<_>>()
            .join("; ");

        Err(io::Error::other(format!(
            "{} 个条目处理失败: {}",
            self.errors.len(),
            details
        )))
    }
}
