//! 共享中断标志
//!
//! 每次运行一个实例，显式传给所有阶段、队列和worker池，
//! 替代进程级的全局中断状态

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::interrupted;
use crate::warn_log;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Interrupt {
        Interrupt::default()
    }

    /// 设置中断标志，所有阻塞中的push/pop在下一个轮询周期内返回
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// 用户发起的中断（例如Ctrl-C），额外输出一条状态消息
    pub fn set_from_user(&self, what: &str) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            warn_log!("{}: 收到中断请求，正在停止...", what);
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// 已中断时返回取消错误
    pub fn check(&self) -> io::Result<()> {
        if self.is_set() { Err(interrupted()) } else { Ok(()) }
    }
}
