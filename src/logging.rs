//! 日志模块
//!
//! 使用tracing作为日志后端，调试级别日志在release模式下完全零成本

/// 调试级别日志 - 仅在debug模式下编译
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        tracing::debug!($($arg)*);

        #[cfg(not(debug_assertions))]
        {
            // release模式下完全零成本
        }
    };
}

/// 追踪级别日志 - 仅在debug模式下编译
#[macro_export]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        tracing::trace!($($arg)*);
    };
}

/// 信息级别日志 - 面向运维的状态输出（阶段、进度、吞吐），始终保留
#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*);
    };
}

/// 警告级别日志 - 始终保留
#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*);
    };
}

/// 错误级别日志 - 始终保留
#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*);
    };
}

/// 初始化日志系统
///
/// 库代码从不自行安装subscriber，由调用方（命令行工具、测试）决定是否调用
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // 重复初始化（例如多个测试）时忽略错误
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(true)
        .try_init();
}

/// 把字节数格式化为便于阅读的字符串，用于吞吐量状态输出
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// 计算吞吐量（每秒字节数）
pub(crate) fn throughput(bytes: u64, elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return "-".to_string();
    }
    format!("{}/s", format_bytes((bytes as f64 / secs) as u64))
}
