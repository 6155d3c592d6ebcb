//! 固定大小内存块分配器
//!
//! 所有管道缓冲都来自这里。内存按页申请，每页切分为若干等长的块，
//! 块在各阶段之间按所有权移动，由最后一个消费者归还。
//!
//! 主要特性：
//! - 按页地址排序，归还时O(log pages)定位所属页
//! - 保留一个完全空闲的备用页，避免在容量边界反复申请/释放
//! - 单把锁串行化所有操作，可跨线程分配与归还

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::config_error;
use crate::trace_log;

/// 默认块大小 8 KiB
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;
/// 默认页大小 1 MiB
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

/// 一个固定容量的内存块
///
/// `len` 只有在读取/赋值成功之后、交给下一阶段之前才有意义
pub struct Block {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
}

// 块所在的内存由分配器独占管理，同一时刻只有一个持有者
unsafe impl Send for Block {}

impl Block {
    /// 块的容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已填充的字节数
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// 设置已填充的字节数
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity, "块长度{}超过容量{}", len, self.capacity);
        self.len = len;
    }

    /// 已填充部分
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// 整个块的可写视图
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// 追加尽可能多的字节，返回实际写入数
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.capacity - self.len);
        let start = self.len;
        self.buffer_mut()[start..start + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// 一页：若干个连续块及其空闲列表
struct Page {
    base: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    /// 空闲块序号，栈顶优先分配
    free: Vec<usize>,
    block_count: usize,
}

unsafe impl Send for Page {}

impl Page {
    fn new(block_size: usize, block_count: usize) -> Page {
        let layout = Layout::from_size_align(block_size * block_count, 64)
            .expect("页大小在构造分配器时已校验");
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
            Some(base) => base,
            None => alloc::handle_alloc_error(layout),
        };

        Page {
            base,
            layout,
            block_size,
            free: (0..block_count).rev().collect(),
            block_count,
        }
    }

    fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn contains(&self, address: usize) -> bool {
        address >= self.start() && address < self.start() + self.layout.size()
    }

    fn take(&mut self) -> Option<Block> {
        let index = self.free.pop()?;
        let ptr = unsafe { self.base.as_ptr().add(index * self.block_size) };

        Some(Block {
            // 指针位于已分配的页内，不可能为空
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            capacity: self.block_size,
            len: 0,
        })
    }

    fn give_back(&mut self, block: Block) {
        let offset = block.address() - self.start();
        assert_eq!(offset % self.block_size, 0, "块地址未对齐: {:?}", block);
        let index = offset / self.block_size;
        debug_assert!(!self.free.contains(&index), "块被重复归还: {:?}", block);
        self.free.push(index);
    }

    fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }

    fn is_unused(&self) -> bool {
        self.free.len() == self.block_count
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[derive(Default)]
struct Pages {
    /// 至少还有一个空闲块的页，按起始地址排序
    available: BTreeMap<usize, Page>,
    /// 已经分完的页
    exhausted: BTreeMap<usize, Page>,
    /// 保留的完全空闲页
    spare: Option<usize>,
    in_flight: usize,
}

impl Pages {
    fn owner_key(map: &BTreeMap<usize, Page>, address: usize) -> Option<usize> {
        map.range(..=address)
            .next_back()
            .filter(|(_, page)| page.contains(address))
            .map(|(key, _)| *key)
    }
}

/// 块分配器统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub pages: usize,
    pub blocks_in_flight: usize,
    pub free_blocks: usize,
}

/// 固定大小内存块池
pub struct BlockAllocator {
    block_size: usize,
    blocks_per_page: usize,
    pages: Mutex<Pages>,
}

impl BlockAllocator {
    /// 创建分配器
    ///
    /// 块大小为0或页大小不足一个块时返回配置错误
    pub fn new(block_size: usize, page_size: usize) -> io::Result<BlockAllocator> {
        if block_size == 0 {
            return Err(config_error("块大小不能为0"));
        }

        let blocks_per_page = page_size / block_size;
        if blocks_per_page == 0 {
            return Err(config_error(format!(
                "页大小{}小于块大小{}",
                page_size, block_size
            )));
        }

        Ok(BlockAllocator {
            block_size,
            blocks_per_page,
            pages: Mutex::new(Pages::default()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 实际页大小（向下取整为块大小的整数倍）
    pub fn page_size(&self) -> usize {
        self.blocks_per_page * self.block_size
    }

    /// 分配足够容纳 `bytes` 字节的块
    pub fn allocate(&self, bytes: usize) -> Vec<Block> {
        let count = bytes.div_ceil(self.block_size);
        let mut pages = self.pages.lock();
        (0..count).map(|_| self.take_block(&mut pages)).collect()
    }

    /// 分配一个块
    pub fn allocate_block(&self) -> Block {
        let mut pages = self.pages.lock();
        self.take_block(&mut pages)
    }

    fn take_block(&self, pages: &mut Pages) -> Block {
        if pages.available.is_empty() {
            let page = Page::new(self.block_size, self.blocks_per_page);
            trace_log!("新建内存页 {:#x}", page.start());
            pages.available.insert(page.start(), page);
        }

        let mut entry = pages
            .available
            .first_entry()
            .expect("上面已保证至少有一个可用页");
        let key = *entry.key();
        let block = entry.get_mut().take().expect("可用页中必有空闲块");

        if entry.get().is_exhausted() {
            let page = entry.remove();
            pages.exhausted.insert(key, page);
        }
        if pages.spare == Some(key) {
            pages.spare = None;
        }

        pages.in_flight += 1;
        block
    }

    /// 归还一个块
    pub fn free(&self, block: Block) {
        let mut pages = self.pages.lock();
        self.give_back(&mut pages, block);
    }

    /// 归还一批块
    pub fn free_all<I: IntoIterator<Item = Block>>(&self, blocks: I) {
        let mut pages = self.pages.lock();
        for block in blocks {
            self.give_back(&mut pages, block);
        }
    }

    fn give_back(&self, pages: &mut Pages, block: Block) {
        let address = block.address();

        let key = if let Some(key) = Pages::owner_key(&pages.available, address) {
            key
        } else if let Some(key) = Pages::owner_key(&pages.exhausted, address) {
            let page = pages.exhausted.remove(&key).expect("刚刚查到的页");
            pages.available.insert(key, page);
            key
        } else {
            panic!("归还的块不属于此分配器: {:?}", block);
        };

        let page = pages.available.get_mut(&key).expect("页必定在可用集合中");
        page.give_back(block);
        pages.in_flight -= 1;

        if page.is_unused() {
            match pages.spare {
                None => pages.spare = Some(key),
                Some(spare) if spare == key => {}
                Some(_) => {
                    trace_log!("释放内存页 {:#x}", key);
                    pages.available.remove(&key);
                }
            }
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let pages = self.pages.lock();
        AllocatorStats {
            pages: pages.available.len() + pages.exhausted.len(),
            blocks_in_flight: pages.in_flight,
            free_blocks: pages.available.values().map(|p| p.free.len()).sum(),
        }
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("block_size", &self.block_size)
            .field("blocks_per_page", &self.blocks_per_page)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let pages = self.pages.get_mut();
        assert_eq!(pages.in_flight, 0, "分配器销毁时仍有块未归还");
        assert!(pages.exhausted.is_empty(), "分配器销毁时仍有满页");
        assert!(pages.available.len() <= 1, "分配器销毁时有多余的空页");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, TestResult};

    #[test]
    fn test_invalid_configuration() {
        assert_eq!(
            BlockAllocator::new(0, 1024).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            BlockAllocator::new(4096, 1000).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_page_size_rounds_down() {
        let allocator = BlockAllocator::new(1000, 4500).unwrap();
        assert_eq!(allocator.page_size(), 4000);
    }

    #[test]
    fn test_allocate_rounds_up() {
        let allocator = BlockAllocator::new(16, 64).unwrap();

        let blocks = allocator.allocate(33);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.capacity() == 16 && b.is_empty()));
        assert!(allocator.allocate(0).is_empty());

        allocator.free_all(blocks);
        assert_eq!(allocator.stats().blocks_in_flight, 0);
    }

    #[test]
    fn test_new_pages_and_spare() {
        let allocator = BlockAllocator::new(16, 64).unwrap();

        // 4块/页，10块需要3页
        let blocks = allocator.allocate(16 * 10);
        assert_eq!(allocator.stats().pages, 3);

        allocator.free_all(blocks);
        let stats = allocator.stats();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.free_blocks, 4);
        assert_eq!(stats.blocks_in_flight, 0);
    }

    #[test]
    fn test_spare_page_damps_churn() {
        let allocator = BlockAllocator::new(16, 32).unwrap();

        let first = allocator.allocate(32);
        assert_eq!(allocator.stats().pages, 1);

        // 在容量边界上反复申请/释放，备用页一直保留
        for _ in 0..10 {
            let block = allocator.allocate_block();
            assert_eq!(allocator.stats().pages, 2);
            allocator.free(block);
            assert_eq!(allocator.stats().pages, 2);
        }

        allocator.free_all(first);
        assert_eq!(allocator.stats().pages, 1);
    }

    #[test]
    fn test_block_data() {
        let allocator = BlockAllocator::new(8, 64).unwrap();
        let mut block = allocator.allocate_block();

        assert_eq!(block.append(b"hello"), 5);
        assert_eq!(block.append(b"world"), 3);
        assert!(block.is_full());
        assert_eq!(block.data(), b"hellowor");

        block.set_len(2);
        assert_eq!(block.data(), b"he");

        allocator.free(block);
    }

    #[test]
    fn test_cross_thread_free() {
        let allocator = std::sync::Arc::new(BlockAllocator::new(64, 4096).unwrap());
        let blocks = allocator.allocate(64 * 200);

        let other = allocator.clone();
        std::thread::spawn(move || other.free_all(blocks))
            .join()
            .unwrap();

        assert_eq!(allocator.stats().blocks_in_flight, 0);
        assert_eq!(allocator.stats().pages, 1);
    }

    quickcheck! {
        fn prop_balanced_operations_leave_one_free_page(ops: Vec<(bool, u8)>) -> TestResult {
            if ops.is_empty() {
                return TestResult::discard();
            }

            let allocator = BlockAllocator::new(32, 128).unwrap();
            let mut held: Vec<Block> = Vec::new();

            for (allocate, amount) in ops {
                if allocate || held.is_empty() {
                    let requested = amount as usize + 1;
                    let blocks = allocator.allocate(requested);
                    if blocks.len() != requested.div_ceil(32) {
                        return TestResult::failed();
                    }
                    held.extend(blocks);
                } else {
                    let keep = held.len().saturating_sub(amount as usize % 8 + 1);
                    allocator.free_all(held.drain(keep..));
                }

                if allocator.stats().blocks_in_flight != held.len() {
                    return TestResult::failed();
                }
            }

            allocator.free_all(held.drain(..));
            let stats = allocator.stats();
            TestResult::from_bool(
                stats.pages == 1 && stats.blocks_in_flight == 0 && stats.free_blocks == 4,
            )
        }
    }
}
