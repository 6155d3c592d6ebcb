//! 固定线程数的worker池
//!
//! 每个任务分为两半：`produce` 在池线程上执行并返回结果，
//! `process` 在调用 `process()` 的线程上消费这个结果。结果处理因此总在同一个线程上，
//! 可以直接修改调用方的非线程安全状态而不需要额外加锁。
//!
//! 任一任务失败都会设置共享中断标志，让其他线程尽快退出；
//! `process()` 在所有线程结束后返回遇到的第一个错误。

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use fnv::FnvHashMap;

use crate::error::{config_error, interrupted, is_interrupted};
use crate::interrupt::Interrupt;
use crate::memory_queue::POLL_INTERVAL;
use crate::{debug_log, error_log, trace_log};

type Produce<T> = Box<dyn FnOnce() -> io::Result<T> + Send>;
type Process<'a, T> = Box<dyn FnOnce(T) -> io::Result<()> + 'a>;

pub struct WorkerPool<'a, T: Send + 'static> {
    name: &'static str,
    interrupt: Interrupt,
    task_tx: Option<Sender<(u64, Produce<T>)>>,
    task_rx: Receiver<(u64, Produce<T>)>,
    result_rx: Receiver<(u64, io::Result<T>)>,
    handles: Vec<JoinHandle<()>>,
    processors: FnvHashMap<u64, Process<'a, T>>,
    next_id: u64,
    first_error: Option<io::Error>,
}

impl<'a, T: Send + 'static> WorkerPool<'a, T> {
    pub fn new(name: &'static str, threads: usize, interrupt: Interrupt) -> io::Result<WorkerPool<'a, T>> {
        if threads == 0 {
            return Err(config_error(format!("{}: 线程数必须大于0", name)));
        }

        let (task_tx, task_rx) = crossbeam_channel::unbounded::<(u64, Produce<T>)>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let tasks = task_rx.clone();
            let results = result_tx.clone();
            let interrupt = interrupt.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    trace_log!("{}-{} 线程启动", name, index);
                    worker_loop(tasks, results, interrupt);
                    trace_log!("{}-{} 线程退出", name, index);
                })?;
            handles.push(handle);
        }

        Ok(WorkerPool {
            name,
            interrupt,
            task_tx: Some(task_tx),
            task_rx,
            result_rx,
            handles,
            processors: FnvHashMap::default(),
            next_id: 0,
            first_error: None,
        })
    }

    /// 添加一个任务
    pub fn add_task<P, C>(&mut self, produce: P, process: C) -> io::Result<()>
    where
        P: FnOnce() -> io::Result<T> + Send + 'static,
        C: FnOnce(T) -> io::Result<()> + 'a,
    {
        self.interrupt.check()?;
        let Some(task_tx) = &self.task_tx else {
            return Err(config_error(format!("{}: tasks_done之后不能再添加任务", self.name)));
        };

        let id = self.next_id;
        self.next_id += 1;
        self.processors.insert(id, Box::new(process));
        if task_tx.send((id, Box::new(produce))).is_err() {
            self.processors.remove(&id);
            return Err(interrupted());
        }
        Ok(())
    }

    /// 不会再添加任务，线程处理完队列后退出
    pub fn tasks_done(&mut self) {
        self.task_tx = None;
    }

    /// 在当前线程上处理所有任务的结果，直到所有线程结束
    ///
    /// 隐含 `tasks_done()`。返回遇到的第一个错误。
    pub fn process(&mut self) -> io::Result<()> {
        self.tasks_done();

        while let Ok((id, result)) = self.result_rx.recv() {
            let processor = self.processors.remove(&id);
            match (result, processor) {
                (Ok(value), Some(processor)) if self.first_error.is_none() => {
                    if let Err(error) = processor(value) {
                        self.record_error(error);
                    }
                }
                (Ok(_), _) => {}
                (Err(error), _) => self.record_error(error),
            }
        }
        self.join();

        // 线程在中断后不再取任务，这些任务既没有结果也没有错误
        if self.first_error.is_none() && !self.processors.is_empty() {
            debug_log!("{}: 中断后有 {} 个任务没有执行", self.name, self.processors.len());
            self.first_error = Some(interrupted());
        }
        self.processors.clear();

        match self.first_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// 提前终止：设置中断标志、丢弃未开始的任务并等待线程退出
    pub fn terminate(&mut self) {
        self.interrupt.set();
        self.tasks_done();
        while self.task_rx.try_recv().is_ok() {}
        self.join();
        self.processors.clear();
    }

    fn record_error(&mut self, error: io::Error) {
        if !is_interrupted(&error) {
            error_log!("{}: {}", self.name, error);
        }
        self.interrupt.set();

        // 中断引起的取消让位于真正的失败原因
        let replace = match &self.first_error {
            None => true,
            Some(first) => is_interrupted(first) && !is_interrupted(&error),
        };
        if replace {
            self.first_error = Some(error);
        }
    }

    fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error_log!("{}: worker线程异常退出", self.name);
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<'_, T> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            debug_log!("{}: 未处理完的worker池被丢弃，终止所有线程", self.name);
            self.terminate();
        }
    }
}

fn worker_loop<T>(
    tasks: Receiver<(u64, Produce<T>)>,
    results: Sender<(u64, io::Result<T>)>,
    interrupt: Interrupt,
) {
    loop {
        if interrupt.is_set() {
            break;
        }
        let (id, produce) = match tasks.recv_timeout(POLL_INTERVAL) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(produce)).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "未知panic".to_string());
            Err(io::Error::other(format!("任务panic: {}", message)))
        });

        if result.is_err() {
            interrupt.set();
        }
        if results.send((id, result)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_threads_is_config_error() {
        let error = WorkerPool::<()>::new("test", 0, Interrupt::new()).err().unwrap();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_results_processed_on_calling_thread() {
        let total = Cell::new(0u64);
        let seen = RefCell::new(Vec::new());
        {
            let mut pool = WorkerPool::new("sum", 4, Interrupt::new()).unwrap();
            let caller = thread::current().id();
            for i in 0..32u64 {
                let (total, seen) = (&total, &seen);
                pool.add_task(
                    move || Ok(i * 2),
                    move |value| {
                        assert_eq!(thread::current().id(), caller);
                        seen.borrow_mut().push(i);
                        total.set(total.get() + value);
                        Ok(())
                    },
                )
                .unwrap();
            }
            pool.process().unwrap();
        }
        let mut seen = seen.into_inner();
        seen.sort();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
        assert_eq!(total.get(), (0..32u64).map(|i| i * 2).sum::<u64>());
    }

    #[test]
    fn test_first_error_wins_and_interrupts_others() {
        let interrupt = Interrupt::new();
        let started = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("fail", 2, interrupt.clone()).unwrap();

        pool.add_task(|| Err(io::Error::other("第一个失败")), |_: ()| Ok(())).unwrap();
        for _ in 0..8 {
            let started = started.clone();
            let interrupt = interrupt.clone();
            pool.add_task(
                move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    // 模拟一个在中断后退出的长任务
                    while !interrupt.is_set() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(interrupted())
                },
                |_: ()| Ok(()),
            )
            .unwrap();
        }

        let error = pool.process().unwrap_err();
        assert_eq!(error.to_string(), "第一个失败");
        assert!(interrupt.is_set());
        // 中断之后不再开始新任务
        assert!(started.load(Ordering::SeqCst) < 8);
    }

    #[test]
    fn test_process_error_stops_pool() {
        let mut pool = WorkerPool::new("process", 1, Interrupt::new()).unwrap();
        pool.add_task(|| Ok(1), |_| Err(io::Error::other("处理失败"))).unwrap();
        let error = pool.process().unwrap_err();
        assert_eq!(error.to_string(), "处理失败");
    }

    #[test]
    fn test_panic_is_captured() {
        let mut pool = WorkerPool::new("panic", 1, Interrupt::new()).unwrap();
        pool.add_task(|| -> io::Result<()> { panic!("boom") }, |_| Ok(())).unwrap();
        let error = pool.process().unwrap_err();
        assert!(error.to_string().contains("boom"));
    }

    #[test]
    fn test_interrupt_between_tasks_is_not_success() {
        let interrupt = Interrupt::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new("partial", 1, interrupt.clone()).unwrap();

        // 第一个任务等两个任务都入队后才设置中断
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(1);
        let flag = interrupt.clone();
        pool.add_task(
            move || {
                let _ = go_rx.recv();
                flag.set();
                Ok(())
            },
            |_| Ok(()),
        )
        .unwrap();
        let counter = ran.clone();
        pool.add_task(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_| Ok(()),
        )
        .unwrap();
        go_tx.send(()).unwrap();

        let error = pool.process().unwrap_err();
        assert!(is_interrupted(&error));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_terminate_and_add_after_done() {
        let interrupt = Interrupt::new();
        let mut pool = WorkerPool::<()>::new("terminate", 2, interrupt.clone()).unwrap();
        pool.tasks_done();
        assert_eq!(
            pool.add_task(|| Ok(()), |_| Ok(())).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        pool.terminate();
        assert!(interrupt.is_set());
    }
}
