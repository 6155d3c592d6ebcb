//! 外部回放进程
//!
//! 回放程序从标准输入读取binlog字节流，向标准输出写出重建的SQL文本。
//! 两个桥接阶段分别把 "file_data" 队列写进它的标准输入、
//! 把它的标准输出读进 "process_data" 队列。

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fault_injection::fallible;

use crate::error::{interrupted, with_context};
use crate::interrupt::Interrupt;
use crate::memory_queue::{MemoryQueue, POLL_INTERVAL};
use crate::{debug_log, warn_log};

/// 回放进程的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// 自行退出且退出码为0
    Exited(ExitStatus),
    /// 被强制终止，不报告退出码
    Killed,
}

pub struct ReplayProcess {
    child: Child,
    program: String,
}

impl ReplayProcess {
    /// 启动回放进程，返回它的标准输入和标准输出
    pub fn spawn(program: &Path, args: &[String]) -> io::Result<(ReplayProcess, ChildStdin, ChildStdout)> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| with_context(e, format!("无法启动回放程序 {}", program.display())))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("回放进程没有标准输入或标准输出"));
        };

        debug_log!("启动回放进程 {} (pid {})", program.display(), child.id());
        let process = ReplayProcess { child, program: program.display().to_string() };
        Ok((process, stdin, stdout))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// 等待进程自行退出，超时或已被中断时强制终止
    ///
    /// 只有自行退出且退出码非0时返回错误
    pub fn finish(mut self, timeout: Duration, interrupt: &Interrupt) -> io::Result<ProcessExit> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = fallible!(self.child.try_wait()) {
                if status.success() {
                    return Ok(ProcessExit::Exited(status));
                }
                return Err(match status.code() {
                    Some(code) => io::Error::other(format!("{} 退出码 {}", self.program, code)),
                    None => io::Error::other(format!("{} 被信号终止: {}", self.program, status)),
                });
            }

            let now = Instant::now();
            if interrupt.is_set() || now >= deadline {
                if !interrupt.is_set() {
                    warn_log!("{} 在 {:?} 内没有退出，强制终止", self.program, timeout);
                }
                self.kill();
                return Ok(ProcessExit::Killed);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// 强制终止并回收进程
    pub fn kill(&mut self) {
        if let Err(error) = self.child.kill() {
            debug_log!("终止 {} 失败: {}", self.program, error);
        }
        let _ = self.child.wait();
    }
}

/// 把队列中的块依次写进回放进程的标准输入，结束时关闭标准输入
///
/// 回放进程提前关闭标准输入时，剩余的块被丢弃并设置 `input_closed`，
/// 让退出码的检查仍然由读取端完成
pub fn feed_input(queue: &MemoryQueue, stdin: ChildStdin, input_closed: &AtomicBool) -> io::Result<u64> {
    let mut stdin = Some(stdin);
    let mut written = 0u64;

    while let Some(block) = queue.pop() {
        if let Some(pipe) = stdin.as_mut() {
            match pipe.write_all(block.data()) {
                Ok(()) => written += block.len() as u64,
                Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {
                    warn_log!("回放进程提前关闭了标准输入，丢弃剩余的输入");
                    input_closed.store(true, Ordering::SeqCst);
                    stdin = None;
                }
                Err(error) => {
                    queue.free(block);
                    return Err(error);
                }
            }
        }
        queue.free(block);
    }

    if queue.is_interrupted() {
        return Err(interrupted());
    }
    if let Some(mut pipe) = stdin {
        match pipe.flush() {
            Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {
                input_closed.store(true, Ordering::SeqCst);
            }
            result => result?,
        }
    }
    Ok(written)
}

/// 把回放进程的标准输出读进新分配的块并入队，结束时通知消费者
pub fn drain_output<R: Read>(queue: &MemoryQueue, mut stdout: R) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let mut block = queue.allocate();
        let read = loop {
            match stdout.read(block.buffer_mut()) {
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                result => break result,
            }
        };
        let n = match read {
            Ok(n) => n,
            Err(error) => {
                queue.free(block);
                return Err(error);
            }
        };
        if n == 0 {
            queue.free(block);
            break;
        }

        block.set_len(n);
        total += n as u64;
        if !queue.push(block) {
            return Err(interrupted());
        }
    }

    if !queue.done() {
        return Err(interrupted());
    }
    Ok(total)
}
