use serde::{Deserialize, Serialize};

/// 设备管理器配置结构体
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// 设备侧暂存目录，应用包传输的落地位置
    pub staging_dir: String,
    /// 阻塞操作的看门狗超时（毫秒）
    pub timeout: u64,
    /// 重试助手的最大重试次数
    pub max_retries: u32,
    /// 重试延迟（毫秒）
    pub retry_delay: u64,
    /// 日志级别
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// 传输时默认排除的文件模式
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_patterns: Option<Vec<String>>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            staging_dir: "PublicStaging".to_string(),
            timeout: 30000, // 30秒超时
            max_retries: 3,
            retry_delay: 1000,
            log_level: None,
            exclude_patterns: None,
        }
    }
}

/// 设备管理器配置构建器
#[derive(Default)]
pub struct DeviceConfigBuilder {
    staging_dir: Option<String>,
    timeout: Option<u64>,
    max_retries: Option<u32>,
    retry_delay: Option<u64>,
    log_level: Option<String>,
    exclude_patterns: Option<Vec<String>>,
}

impl DeviceConfigBuilder {
    /// 设置设备侧暂存目录
    pub fn staging_dir(mut self, dir: &str) -> Self {
        self.staging_dir = Some(dir.to_string());
        self
    }

    /// 设置看门狗超时
    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// 设置重试延迟
    pub fn retry_delay(mut self, delay: u64) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: &str) -> Self {
        self.log_level = Some(level.to_string());
        self
    }

    /// 添加默认排除的文件模式
    pub fn add_exclude_pattern(mut self, pattern: &str) -> Self {
        if self.exclude_patterns.is_none() {
            self.exclude_patterns = Some(Vec::new());
        }

        if let Some(patterns) = &mut self.exclude_patterns {
            patterns.push(pattern.to_string());
        }

        self
    }

    /// 构建设备管理器配置
    pub fn build(self) -> DeviceConfig {
        let default = DeviceConfig::default();

        DeviceConfig {
            staging_dir: self.staging_dir.unwrap_or(default.staging_dir),
            timeout: self.timeout.unwrap_or(default.timeout),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            retry_delay: self.retry_delay.unwrap_or(default.retry_delay),
            log_level: self.log_level,
            exclude_patterns: self.exclude_patterns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = DeviceConfig::default();
        assert_eq!(config.staging_dir, "PublicStaging");
        assert_eq!(config.timeout, 30000);
        assert_eq!(config.max_retries, 3);
        assert!(config.exclude_patterns.is_none());
    }

    #[test]
    fn builder_overrides_and_defaults() {
        let config = DeviceConfigBuilder::default()
            .staging_dir("Staging")
            .timeout(5000)
            .add_exclude_pattern(".DS_Store")
            .add_exclude_pattern("*.log")
            .build();

        assert_eq!(config.staging_dir, "Staging");
        assert_eq!(config.timeout, 5000);
        // 未设置的字段保持默认值
        assert_eq!(config.max_retries, 3);
        assert_eq!(
            config.exclude_patterns,
            Some(vec![".DS_Store".to_string(), "*.log".to_string()])
        );
    }
}
