use crate::error::{DeviceError, DeviceResult};
use log::warn;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::time::{Duration, Instant};

/// 使用指数退避策略重试操作
///
/// 库内部不做任何自动重试，USB/Wi-Fi 抖动由调用方决定是否重试，
/// 这里只提供现成的退避助手。
pub fn retry_with_backoff<F, T>(max_retries: u32, initial_delay_ms: u64, f: F) -> DeviceResult<T>
where
    F: Fn() -> DeviceResult<T>,
{
    let mut retries = 0;
    let mut delay = initial_delay_ms;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(e) => {
                retries += 1;
                if retries > max_retries {
                    return Err(e);
                }

                warn!(
                    "操作失败 (重试 {}/{}), 延迟 {}ms: {}",
                    retries, max_retries, delay, e
                );

                std::thread::sleep(Duration::from_millis(delay));
                // 指数退避策略：下次延迟时间翻倍但不超过 10 秒
                delay = (delay * 2).min(10000);
            }
        }
    }
}

/// 带超时执行操作
pub fn with_timeout<F, T>(timeout_ms: u64, f: F) -> DeviceResult<T>
where
    F: FnOnce() -> DeviceResult<T> + Send + 'static,
    T: Send + 'static,
{
    let timeout = Duration::from_millis(timeout_ms);

    // 创建通道用于跨线程通信
    let (sender, receiver) = std::sync::mpsc::channel();

    // 在新线程中执行操作
    std::thread::spawn(move || {
        let result = f();
        let _ = sender.send(result);
    });

    // 等待结果或超时
    match receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(DeviceError::TimeoutError {
            message: "操作超时".to_string(),
            duration: timeout,
        }),
    }
}

/// 根据条件轮询等待
pub fn wait_with_polling<F, C>(
    timeout_ms: u64,
    poll_interval_ms: u64,
    condition_fn: F,
    callback: Option<C>,
) -> DeviceResult<bool>
where
    F: Fn() -> DeviceResult<bool>,
    C: Fn(u64),
{
    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    let interval = Duration::from_millis(poll_interval_ms);

    loop {
        // 检查是否超时
        let elapsed = start.elapsed();
        if elapsed > timeout {
            return Ok(false);
        }

        // 如果提供了回调函数，则执行
        if let Some(cb) = &callback {
            cb(elapsed.as_millis() as u64);
        }

        // 检查条件
        match condition_fn() {
            Ok(true) => return Ok(true),
            Ok(false) => {
                // 条件未满足，继续等待
                std::thread::sleep(interval);
            }
            Err(e) => {
                // 检查条件时出错
                warn!("检查条件时出错: {}", e);
                std::thread::sleep(interval);
            }
        }
    }
}

/// 生成唯一的暂存名称，保留原扩展名
///
/// `Demo.app` 会得到形如 `Demo_20221211_093042_x4k9qz.app` 的名称，
/// 扩展名保留在末尾，后续仍可按扩展名推断包类型。
pub fn staging_name(name: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");

    // 生成随机字符串
    let random_string: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();

    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => {
            format!("{}_{}_{}.{}", stem, timestamp, random_string, extension)
        }
        _ => format!("{}_{}_{}", name, timestamp, random_string),
    }
}

/// 检查名称是否匹配任一给定的 glob 模式
pub fn matches_any(name: &str, patterns: &[String]) -> DeviceResult<bool> {
    for pattern in patterns {
        if glob::Pattern::new(pattern)?.matches(name) {
            return Ok(true);
        }
    }
    Ok(false)
}

// ProductVersion 形如 "16.1.2"，修订号可省略
static PRODUCT_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.(\d+)(?:\.(\d+))?$").unwrap());

/// 解析 ProductVersion 字符串为 (主, 次, 修订) 三元组
pub fn parse_product_version(version: &str) -> Option<(u32, u32, u32)> {
    let caps = PRODUCT_VERSION_RE.captures(version.trim())?;

    let major: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minor: u32 = caps.get(2)?.as_str().parse().ok()?;
    let patch: u32 = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    Some((major, minor, patch))
}

/// 格式化大小 (字节转换为 KB/MB/GB)
pub fn format_size(size_bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size_bytes >= GB {
        format!("{:.2} GB", size_bytes as f64 / GB as f64)
    } else if size_bytes >= MB {
        format!("{:.2} MB", size_bytes as f64 / MB as f64)
    } else if size_bytes >= KB {
        format!("{:.2} KB", size_bytes as f64 / KB as f64)
    } else {
        format!("{} B", size_bytes)
    }
}

/// 将秒数转换为人类可读的时间格式 (HH:MM:SS)
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}
