//! 目标服务器会话
//!
//! 加载管道的最后一个阶段只通过 `Session` 执行语句。连接管理不在本crate中，
//! 调用方提供实现；`RecordingSession` 把调用记录在内存中，用于测试和演练。

use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::unsupported;
use crate::load_data::LoadDataStatement;

pub trait Session: Send {
    /// 执行一条语句（不含分隔符）
    fn execute(&mut self, statement: &[u8]) -> io::Result<()>;

    /// 立即切换会话字符集
    fn set_character_set(&mut self, charset: &str) -> io::Result<()>;

    /// 执行 `LOAD DATA LOCAL INFILE`，数据从 `data` 读取直到返回0，返回发送的字节数
    fn load_local_infile(&mut self, statement: &LoadDataStatement, data: &mut dyn Read) -> io::Result<u64> {
        let _ = data;
        Err(unsupported(format!(
            "会话不支持 LOAD DATA LOCAL INFILE: {}",
            statement.path.display()
        )))
    }

    fn commit(&mut self) -> io::Result<()>;
}

/// 会话上的一次调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Execute(Vec<u8>),
    CharacterSet(String),
    /// 文件路径和这次发送的数据
    LoadData(String, Vec<u8>),
    Commit,
}

/// 记录所有调用的会话，克隆共享同一份记录
#[derive(Debug, Clone, Default)]
pub struct RecordingSession {
    calls: Arc<Mutex<Vec<SessionCall>>>,
}

impl RecordingSession {
    pub fn new() -> RecordingSession {
        RecordingSession::default()
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    /// 只取执行过的语句文本
    pub fn statements(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SessionCall::Execute(statement) => Some(String::from_utf8_lossy(statement).into_owned()),
                _ => None,
            })
            .collect()
    }
}

impl Session for RecordingSession {
    fn execute(&mut self, statement: &[u8]) -> io::Result<()> {
        self.calls.lock().push(SessionCall::Execute(statement.to_vec()));
        Ok(())
    }

    fn set_character_set(&mut self, charset: &str) -> io::Result<()> {
        self.calls.lock().push(SessionCall::CharacterSet(charset.to_string()));
        Ok(())
    }

    fn load_local_infile(&mut self, statement: &LoadDataStatement, data: &mut dyn Read) -> io::Result<u64> {
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer)?;
        let sent = buffer.len() as u64;
        self.calls
            .lock()
            .push(SessionCall::LoadData(statement.path.display().to_string(), buffer));
        Ok(sent)
    }

    fn commit(&mut self) -> io::Result<()> {
        self.calls.lock().push(SessionCall::Commit);
        Ok(())
    }
}
