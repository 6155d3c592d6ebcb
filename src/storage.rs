//! 导出目标的存储抽象
//!
//! 导出与加载只通过 `Storage` 访问文件和目录。删除在某些后端上不受支持
//! （例如只读的预签名URL），此时返回 `Removal::Unsupported` 而不是错误，
//! 调用方据此跳过清理并给出警告。

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use fault_injection::fallible;

/// 删除操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Unsupported,
}

pub trait Storage: Send + Sync {
    /// 用于日志的描述
    fn describe(&self) -> String;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// 创建（或截断）一个文件用于写入
    fn create_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// 创建一个新文件，文件已存在时返回 `AlreadyExists`
    fn create_new_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn open_file(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// 列出目录中的条目名，按名称排序
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    fn remove_file(&self, path: &Path) -> io::Result<Removal>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<Removal>;

    /// 读取整个小文件
    fn read_to_vec(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open_file(path)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// 写入整个小文件
    fn write_all(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = self.create_file(path)?;
        file.write_all(data)?;
        file.flush()
    }
}

/// 本地文件系统，相对路径基于 `root`
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    allow_deletion: bool,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> LocalStorage {
        LocalStorage { root: root.into(), allow_deletion: true }
    }

    /// 禁止删除，模拟不支持删除的后端
    pub fn without_deletion(mut self) -> LocalStorage {
        self.allow_deletion = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

/// 写入结束时同步到磁盘的缓冲文件
struct SyncedFile(BufWriter<File>);

impl Write for SyncedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.get_ref().sync_data()
    }
}

impl Storage for LocalStorage {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fallible!(fs::create_dir_all(self.resolve(path)));
        Ok(())
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        self.resolve(path).try_exists()
    }

    fn create_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = fallible!(File::create(self.resolve(path)));
        Ok(Box::new(SyncedFile(BufWriter::new(file))))
    }

    fn create_new_file(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().write(true).create_new(true).open(self.resolve(path))?;
        Ok(Box::new(SyncedFile(BufWriter::new(file))))
    }

    fn open_file(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let file = fallible!(File::open(self.resolve(path)));
        Ok(Box::new(file))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fallible!(fs::read_dir(self.resolve(path))) {
            let entry = fallible!(entry);
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> io::Result<Removal> {
        if !self.allow_deletion {
            return Ok(Removal::Unsupported);
        }
        fallible!(fs::remove_file(self.resolve(path)));
        Ok(Removal::Removed)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<Removal> {
        if !self.allow_deletion {
            return Ok(Removal::Unsupported);
        }
        fallible!(fs::remove_dir_all(self.resolve(path)));
        Ok(Removal::Removed)
    }
}
