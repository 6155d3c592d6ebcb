//! binlog加载
//!
//! 四个阶段各占一个线程，由两个内存队列串成一条直线：
//!
//! ```text
//! 段文件读取 --file_data--> 写入回放进程 ~~回放进程~~ 读取回放进程 --process_data--> 执行语句
//! ```
//!
//! 段文件读取阶段只在第一个段上跳过目标服务器已执行的事务，
//! 只在最后一个段上处理停止GTID，其余段原样复制。
//! 演练模式下执行阶段只读出并丢弃回放进程的输出，不修改目标服务器。

use std::cell::Cell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use fault_injection::fallible;
use parking_lot::Mutex;

use crate::block_allocator::BlockAllocator;
use crate::compression::open_decoder;
use crate::config::{CompressionAlgorithm, LoadConfig};
use crate::error::{ItemErrors, config_error, interrupted, is_interrupted, with_context};
use crate::event::{BINLOG_MAGIC, Event, EventReader, read_magic};
use crate::event_filter::{Action, EventFilter, FilterOutcome};
use crate::gtid::{Gtid, GtidSet};
use crate::interrupt::Interrupt;
use crate::load_data::{LoadDataStatement, parse_load_data};
use crate::logging::{format_bytes, throughput};
use crate::memory_queue::{MemoryQueue, QueueReader, QueueWriter};
use crate::metadata::{self, SegmentMetadata};
use crate::prefetch::PrefetchReader;
use crate::replay_process::{self, ReplayProcess};
use crate::session::Session;
use crate::statement_splitter::{Item, StatementSplitter};
use crate::storage::Storage;
use crate::transaction_buffer::TransactionBuffer;
use crate::worker_pool::WorkerPool;
use crate::{debug_log, info_log, warn_log};

const READER_STAGE: &str = "段文件读取";
const WRITER_STAGE: &str = "写入回放进程";
const PROCESS_STAGE: &str = "读取回放进程";
const EXECUTOR_STAGE: &str = "执行语句";

/// 要加载的一个段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSegment {
    pub name: String,
    /// 段文件相对存储根目录的路径
    pub file: PathBuf,
    pub compression: CompressionAlgorithm,
    /// 导出时记录的GTID集合
    pub gtid_set: GtidSet,
    pub data_bytes: u64,
    pub file_bytes: u64,
    pub start_position: Option<u64>,
    pub end_position: Option<u64>,
}

impl LoadSegment {
    pub fn from_metadata(dir: &Path, basename: &str, metadata: &SegmentMetadata) -> io::Result<LoadSegment> {
        let gtid_set = metadata
            .gtid_set
            .parse()
            .map_err(|e| with_context(e, format!("{} 的GTID集合", metadata.name)))?;
        Ok(LoadSegment {
            name: metadata.name.clone(),
            file: dir.join(format!("{}{}", basename, metadata.extension)),
            compression: metadata.compression,
            gtid_set,
            data_bytes: metadata.data_bytes,
            file_bytes: metadata.file_bytes,
            start_position: metadata.start_position,
            end_position: metadata.end_position,
        })
    }
}

/// 按顺序加载的段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadPlan {
    pub segments: Vec<LoadSegment>,
}

impl LoadPlan {
    pub fn new(segments: Vec<LoadSegment>) -> LoadPlan {
        LoadPlan { segments }
    }

    /// 根目录下所有已完成导出的段，按导出时间排列
    ///
    /// 未完成或无法读取的导出作为非致命错误收集，不影响其他导出
    pub fn from_dump(storage: &dyn Storage, errors: &mut ItemErrors) -> io::Result<LoadPlan> {
        let mut segments = Vec::new();
        for run in metadata::list_runs(storage, errors)? {
            let dir_name = run.dir.display().to_string();
            if !run.is_complete() {
                errors.push(dir_name, io::Error::new(io::ErrorKind::NotFound, "导出没有完成"));
                continue;
            }

            let mut run_segments = Vec::with_capacity(run.manifest.binlogs.len());
            let loaded: io::Result<()> = run.manifest.binlogs.iter().try_for_each(|name| {
                let metadata = run.segment_metadata(storage, name)?;
                let basename = &run.manifest.basenames[name];
                run_segments.push(LoadSegment::from_metadata(&run.dir, basename, &metadata)?);
                Ok(())
            });
            match loaded {
                Ok(()) => segments.extend(run_segments),
                Err(error) => errors.push(dir_name, error),
            }
        }
        Ok(LoadPlan { segments })
    }

    /// 去掉已经全部执行过的段，以及包含停止GTID的段之后的段
    pub fn prune(&mut self, applied: &GtidSet, stop: Option<&Gtid>) {
        let before = self.segments.len();
        self.segments
            .retain(|segment| segment.gtid_set.is_empty() || !applied.contains_set(&segment.gtid_set));

        if let Some(stop) = stop {
            match self.segments.iter().position(|segment| segment.gtid_set.contains(stop)) {
                Some(index) => self.segments.truncate(index + 1),
                None => {
                    warn_log!("没有段包含停止GTID {}", stop);
                }
            }
        }

        if self.segments.len() != before {
            debug_log!("跳过 {} 个段", before - self.segments.len());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn file_bytes(&self) -> u64 {
        self.segments.iter().map(|segment| segment.file_bytes).sum()
    }
}

#[derive(Debug, Default)]
struct LoadCounters {
    segments: AtomicU64,
    segment_bytes: AtomicU64,
    process_bytes: AtomicU64,
    statements: AtomicU64,
    transactions: AtomicU64,
}

/// 加载统计的快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// 已读完的段数
    pub segments: u64,
    /// 送进回放进程的binlog字节数（含magic头）
    pub segment_bytes: u64,
    /// 回放进程输出的字节数
    pub process_bytes: u64,
    pub statements: u64,
    /// 批量导入提交的事务数
    pub transactions: u64,
}

pub struct Loader {
    config: LoadConfig,
    storage: Arc<dyn Storage>,
    plan: LoadPlan,
    session: Option<Arc<Mutex<Box<dyn Session>>>>,
    interrupt: Interrupt,
    counters: Arc<LoadCounters>,
}

impl Loader {
    /// 段文件从 `storage` 读取。计划会按起始GTID集合和停止GTID裁剪
    pub fn new(config: LoadConfig, storage: Arc<dyn Storage>, mut plan: LoadPlan) -> io::Result<Loader> {
        config.validate()?;
        plan.prune(&config.start_gtid_set, config.stop_gtid());
        Ok(Loader {
            config,
            storage,
            plan,
            session: None,
            interrupt: Interrupt::new(),
            counters: Arc::new(LoadCounters::default()),
        })
    }

    /// 执行语句的目标会话，演练模式下可以不设置
    pub fn with_session(mut self, session: Box<dyn Session>) -> Loader {
        self.session = Some(Arc::new(Mutex::new(session)));
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Loader {
        self.interrupt = interrupt;
        self
    }

    pub fn plan(&self) -> &LoadPlan {
        &self.plan
    }

    pub fn interrupt(&self) {
        self.interrupt.set();
    }

    /// 用户发起的中断（例如信号处理函数中）
    pub fn async_interrupt(&self) {
        self.interrupt.set_from_user("加载");
    }

    pub fn interrupt_flag(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn stats(&self) -> LoadStats {
        let counters = &self.counters;
        LoadStats {
            segments: counters.segments.load(Ordering::Relaxed),
            segment_bytes: counters.segment_bytes.load(Ordering::Relaxed),
            process_bytes: counters.process_bytes.load(Ordering::Relaxed),
            statements: counters.statements.load(Ordering::Relaxed),
            transactions: counters.transactions.load(Ordering::Relaxed),
        }
    }

    pub fn run(&self) -> io::Result<LoadStats> {
        let config = &self.config;
        let session = match (&self.session, config.dry_run) {
            (_, true) => None,
            (Some(session), false) => Some(session.clone()),
            (None, false) => return Err(config_error("没有目标会话，只能以演练模式加载")),
        };

        if self.plan.is_empty() {
            info_log!("没有需要加载的段");
            return Ok(self.stats());
        }

        let started = Instant::now();
        info_log!(
            "开始加载 {} 个段（{}）{}",
            self.plan.segments.len(),
            format_bytes(self.plan.file_bytes()),
            if config.dry_run { "，演练模式" } else { "" }
        );

        let allocator = Arc::new(BlockAllocator::new(config.allocator.block_size, config.allocator.page_size)?);
        let capacity = config.allocator.queue_capacity;
        let file_data = Arc::new(MemoryQueue::new("file_data", allocator.clone(), capacity, self.interrupt.clone()));
        let process_data =
            Arc::new(MemoryQueue::new("process_data", allocator.clone(), capacity, self.interrupt.clone()));

        let (process, stdin, stdout) = ReplayProcess::spawn(&config.replay_program, &config.replay_args)?;
        let input_closed = Arc::new(AtomicBool::new(false));

        let mut pool = WorkerPool::new("binlog-load", 4, self.interrupt.clone())?;

        let reader = SegmentReader {
            segments: self.plan.segments.clone(),
            storage: self.storage.clone(),
            start_gtid_set: config.start_gtid_set.clone(),
            stop: config.stop_gtid().cloned().map(|gtid| (gtid, config.stop_after_gtid.is_some())),
            interrupt: self.interrupt.clone(),
            counters: self.counters.clone(),
        };
        let queue = file_data.clone();
        pool.add_task(move || stage(READER_STAGE, || reader.run(&queue)), |_| Ok(()))?;

        let queue = file_data.clone();
        let closed = input_closed.clone();
        pool.add_task(
            move || stage(WRITER_STAGE, || replay_process::feed_input(&queue, stdin, &closed).map(drop)),
            |_| Ok(()),
        )?;

        let queue = process_data.clone();
        let counters = self.counters.clone();
        let interrupt = self.interrupt.clone();
        let timeout = config.process_exit_timeout;
        pool.add_task(
            move || {
                stage(PROCESS_STAGE, || {
                    let drained = replay_process::drain_output(&queue, stdout);
                    if drained.is_err() {
                        interrupt.set();
                    }
                    let exit = process.finish(timeout, &interrupt);
                    counters.process_bytes.fetch_add(drained?, Ordering::Relaxed);
                    exit.map(drop)
                })
            },
            |_| Ok(()),
        )?;

        let queue = process_data.clone();
        let executor = Executor {
            max_transaction_size: config.max_transaction_size,
            interrupt: self.interrupt.clone(),
            counters: self.counters.clone(),
        };
        pool.add_task(
            move || {
                stage(EXECUTOR_STAGE, || match session {
                    Some(session) => executor.run(&queue, &mut **session.lock()),
                    None => executor.drain(&queue),
                })
            },
            |_| Ok(()),
        )?;

        pool.process()?;
        drop(pool);
        self.interrupt.check()?;

        if input_closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "回放进程在读完输入之前就关闭了标准输入"));
        }

        let stats = self.stats();
        info_log!(
            "加载完成：{} 个段，{}，回放输出 {}，{} 条语句，{}",
            stats.segments,
            format_bytes(stats.segment_bytes),
            format_bytes(stats.process_bytes),
            stats.statements,
            throughput(stats.segment_bytes, started.elapsed())
        );
        Ok(stats)
    }
}

/// 给阶段错误加上阶段名
fn stage(name: &str, body: impl FnOnce() -> io::Result<()>) -> io::Result<()> {
    debug_log!("{} 阶段开始", name);
    let result = body().map_err(|e| with_context(e, format_args!("[{}]", name)));
    if let Err(error) = &result {
        if is_interrupted(error) {
            debug_log!("{} 阶段被中断", name);
        }
    }
    result
}

/// 段文件读取阶段
struct SegmentReader {
    segments: Vec<LoadSegment>,
    storage: Arc<dyn Storage>,
    start_gtid_set: GtidSet,
    /// 停止GTID，以及是否在它之后停止
    stop: Option<(Gtid, bool)>,
    interrupt: Interrupt,
    counters: Arc<LoadCounters>,
}

impl SegmentReader {
    fn run(&self, queue: &MemoryQueue) -> io::Result<()> {
        let mut writer = QueueWriter::new(queue);
        writer.write_all(&BINLOG_MAGIC)?;
        self.counters.segment_bytes.fetch_add(BINLOG_MAGIC.len() as u64, Ordering::Relaxed);

        let total = self.segments.len();
        for (index, segment) in self.segments.iter().enumerate() {
            self.interrupt.check()?;
            info_log!("[{}/{}] 加载 {}（{}）", index + 1, total, segment.name, format_bytes(segment.file_bytes));

            let before = writer.written();
            let stopped = self
                .copy_segment(segment, index == 0, index + 1 == total, &mut writer)
                .map_err(|e| with_context(e, &segment.name))?;
            self.counters
                .segment_bytes
                .fetch_add(writer.written() - before, Ordering::Relaxed);
            self.counters.segments.fetch_add(1, Ordering::Relaxed);

            if stopped {
                break;
            }
        }

        writer.finish()?;
        if !queue.done() {
            return Err(interrupted());
        }
        Ok(())
    }

    /// 返回是否到达了停止GTID
    fn copy_segment(&self, segment: &LoadSegment, first: bool, last: bool, writer: &mut QueueWriter<'_>) -> io::Result<bool> {
        let raw = self.storage.open_file(&segment.file)?;
        let mut input = io::BufReader::new(open_decoder(segment.compression, raw)?);
        read_magic(&mut input)?;

        let applied = (first && !self.start_gtid_set.is_empty()).then_some(&self.start_gtid_set);
        let stop = if last { self.stop.as_ref() } else { None };

        match (applied, stop) {
            (None, None) => {
                io::copy(&mut input, writer)?;
                Ok(false)
            }
            (Some(applied), None) => {
                self.find_beginning(input, applied, writer)?;
                Ok(false)
            }
            (applied, Some((stop, after))) => self.filter_last_segment(input, applied, stop, *after, writer),
        }
    }

    /// 跳过目标服务器已执行的事务，从第一个未执行的事务开始原样复制剩余部分
    fn find_beginning<R: Read>(&self, input: R, applied: &GtidSet, writer: &mut QueueWriter<'_>) -> io::Result<()> {
        let skipping = Cell::new(false);
        let mut filter = EventFilter::new(EventReader::new(input, BINLOG_MAGIC.len() as u64))
            .with_interrupt(self.interrupt.clone());

        let mut on_gtid = |_: &Event<'_>, gtid: &Gtid| {
            if applied.contains(gtid) {
                skipping.set(true);
                Ok(Action::Skip)
            } else {
                Ok(Action::Stop)
            }
        };
        let outcome = filter.filter(
            |_| Ok(if skipping.get() { Action::Skip } else { Action::Write }),
            Some(&mut on_gtid),
            |event| writer.write_all(event.data),
        )?;

        if outcome == FilterOutcome::Stopped {
            let reader = filter.into_reader();
            if let Some(event) = reader.current() {
                debug_log!("从位置 {} 开始复制", event.position);
                writer.write_all(event.data)?;
            }
            io::copy(&mut reader.into_inner(), writer)?;
        }
        Ok(())
    }

    /// 处理最后一个段的停止GTID，第一个段同时还要跳过已执行的事务
    fn filter_last_segment<R: Read>(
        &self,
        input: R,
        applied: Option<&GtidSet>,
        stop: &Gtid,
        stop_after: bool,
        writer: &mut QueueWriter<'_>,
    ) -> io::Result<bool> {
        let skipping = Cell::new(false);
        let reached = Cell::new(false);
        let mut filter = EventFilter::new(EventReader::new(input, BINLOG_MAGIC.len() as u64))
            .with_interrupt(self.interrupt.clone());

        let mut on_gtid = |_: &Event<'_>, gtid: &Gtid| {
            if reached.get() {
                return Ok(Action::Stop);
            }
            if gtid == stop {
                if !stop_after {
                    reached.set(true);
                    return Ok(Action::Stop);
                }
                reached.set(true);
                skipping.set(false);
                return Ok(Action::Write);
            }
            skipping.set(applied.is_some_and(|applied| applied.contains(gtid)));
            Ok(if skipping.get() { Action::Skip } else { Action::Write })
        };
        filter.filter(
            |_| Ok(if skipping.get() { Action::Skip } else { Action::Write }),
            Some(&mut on_gtid),
            |event| writer.write_all(event.data),
        )?;

        if !reached.get() {
            warn_log!("段中没有找到停止GTID {}", stop);
        }
        Ok(reached.get())
    }
}

/// 语句执行阶段
struct Executor {
    max_transaction_size: usize,
    interrupt: Interrupt,
    counters: Arc<LoadCounters>,
}

impl Executor {
    fn run(&self, queue: &MemoryQueue, session: &mut dyn Session) -> io::Result<()> {
        let mut splitter = StatementSplitter::new(QueueReader::new(queue));
        let mut gtid_context: Option<String> = None;

        let result = self.execute_all(&mut splitter, session, &mut gtid_context);
        result.map_err(|error| match &gtid_context {
            Some(gtid) => with_context(error, format_args!("GTID {}", gtid)),
            None => error,
        })
    }

    fn execute_all(
        &self,
        splitter: &mut StatementSplitter<QueueReader<'_>>,
        session: &mut dyn Session,
        gtid_context: &mut Option<String>,
    ) -> io::Result<()> {
        loop {
            // 可能有一条语句执行到一半，中断后不再继续，也不作为错误
            if self.interrupt.is_set() {
                debug_log!("执行阶段在中断后停止");
                return Ok(());
            }

            let Some(item) = splitter.next_item().map_err(|e| {
                with_context(e, format_args!("回放进程输出第{}行", splitter.line_number()))
            })?
            else {
                return Ok(());
            };

            match item {
                Item::CharsetSwitch(charset) => {
                    debug_log!("切换字符集 {}", charset);
                    session.set_character_set(&charset)?;
                }
                Item::Statement(statement) => {
                    if let Some(gtid) = gtid_next(&statement) {
                        *gtid_context = Some(gtid);
                    }
                    match parse_load_data(&statement)? {
                        Some(load) => self.bulk_load(&load, session)?,
                        None => session.execute(&statement)?,
                    }
                    self.counters.statements.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// 按事务字节预算分批发送数据文件，每批提交一次
    fn bulk_load(&self, load: &LoadDataStatement, session: &mut dyn Session) -> io::Result<()> {
        let file = fallible!(File::open(&load.path));
        let path = load.path.display().to_string();
        let mut buffer = TransactionBuffer::new(PrefetchReader::new(file)?, &load.dialect, self.max_transaction_size)?
            .on_oversized_row(move || {
                warn_log!("{}: 有超过事务大小上限的行，单独作为一个事务发送", path);
            });

        while buffer.has_more()? {
            self.interrupt.check()?;
            let sent = session.load_local_infile(load, &mut buffer)?;
            session.commit()?;
            self.counters.transactions.fetch_add(1, Ordering::Relaxed);
            debug_log!("{}: 提交 {} 字节", load.path.display(), sent);
        }
        if buffer.oversized_rows() > 0 {
            warn_log!("{}: {} 行超过事务大小上限", load.path.display(), buffer.oversized_rows());
        }
        Ok(())
    }

    /// 演练模式：读出并丢弃回放进程的输出
    fn drain(&self, queue: &MemoryQueue) -> io::Result<()> {
        let drained = io::copy(&mut QueueReader::new(queue), &mut io::sink())?;
        debug_log!("演练模式丢弃了 {} 字节", drained);
        Ok(())
    }
}

/// 从 `SET @@SESSION.GTID_NEXT= '...'` 中取出GTID
fn gtid_next(statement: &[u8]) -> Option<String> {
    const KEY: &[u8] = b"GTID_NEXT";
    if statement.len() < 3 || !statement[..3].eq_ignore_ascii_case(b"SET") {
        return None;
    }
    let at = statement
        .windows(KEY.len())
        .position(|window| window.eq_ignore_ascii_case(KEY))?;
    let rest = &statement[at + KEY.len()..];
    let rest = rest.trim_ascii_start().strip_prefix(b"=")?.trim_ascii();
    let value = rest
        .strip_prefix(b"'")
        .and_then(|value| value.split(|b| *b == b'\'').next())
        .unwrap_or(rest);
    Some(String::from_utf8_lossy(value).into_owned())
}
