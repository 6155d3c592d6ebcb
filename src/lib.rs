// binlog_shuttle - 二进制日志导出/回放管道
// 按区间把复制binlog流切分为段文件，并通过外部回放进程重放到目标服务器

//! `binlog_shuttle` 把源服务器上一段连续的复制binlog导出为一组段文件，
//! 也可以把这些段文件（或正在增长的binlog）重放到目标服务器。
//!
//! 主要组件：
//! - 按页分配、可复用的内存块与有界块队列，连接多阶段流水线
//! - 流式binlog事件解析，处理FORMAT_DESCRIPTION与GTID事件
//! - 按段并行的导出和四阶段加载流水线
//! - 按行边界切分批量导入数据的事务缓冲
//!
//! ```no_run
//! use std::sync::Arc;
//! use binlog_shuttle::{DumpConfig, Dumper, LocalBinlogSource};
//!
//! # fn main() -> std::io::Result<()> {
//! let source = Arc::new(LocalBinlogSource::new("/var/lib/mysql"));
//! let config = DumpConfig::new().output_root("/backup/binlogs").threads(4);
//! let summary = Dumper::new(config, source)?.run()?;
//! println!("导出了 {} 个段", summary.segments.len());
//! # Ok(())
//! # }
//! ```

pub mod logging;

pub mod block_allocator;
pub mod compression;
pub mod config;
pub mod dump;
pub mod error;
pub mod event;
pub mod event_filter;
pub mod gtid;
pub mod interrupt;
pub mod load;
pub mod load_data;
pub mod memory_queue;
pub mod metadata;
pub mod prefetch;
pub mod replay_process;
pub mod row_boundary;
pub mod session;
pub mod source;
pub mod statement_splitter;
pub mod storage;
pub mod sync_pipe;
pub mod transaction_buffer;
pub mod worker_pool;

pub use crate::block_allocator::{Block, BlockAllocator};
pub use crate::config::{AllocatorConfig, CompressionAlgorithm, DumpConfig, LoadConfig};
pub use crate::dump::{DumpStats, DumpSummary, Dumper};
pub use crate::error::{Cancelled, ItemErrors, is_interrupted};
pub use crate::gtid::{Gtid, GtidSet, Sid};
pub use crate::interrupt::Interrupt;
pub use crate::load::{LoadPlan, LoadSegment, LoadStats, Loader};
pub use crate::memory_queue::MemoryQueue;
pub use crate::row_boundary::{Dialect, chunk_by_max_bytes};
pub use crate::session::{RecordingSession, Session};
pub use crate::source::{BinlogFile, BinlogPosition, BinlogSource, LocalBinlogSource};
pub use crate::storage::{LocalStorage, Removal, Storage};
pub use crate::transaction_buffer::TransactionBuffer;

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<BlockAllocator>();
    assert_send_sync::<MemoryQueue>();
    assert_send_sync::<Interrupt>();
    assert_send_sync::<Dumper>();
    assert_send_sync::<Loader>();
};
