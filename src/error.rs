use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// 底层框架返回的数字错误码
pub type ErrorCode = u32;

/// 已知错误码常量，0 是唯一的成功值
pub mod codes {
    use super::ErrorCode;

    pub const SUCCESS: ErrorCode = 0;
    pub const UNDEFINED: ErrorCode = 0xE800_0001;
    pub const NO_RESOURCES: ErrorCode = 0xE800_0003;
    pub const READ_ERROR: ErrorCode = 0xE800_0004;
    pub const WRITE_ERROR: ErrorCode = 0xE800_0005;
    pub const INVALID_ARGUMENT: ErrorCode = 0xE800_0007;
    pub const NOT_FOUND: ErrorCode = 0xE800_0008;
    pub const PERMISSION_DENIED: ErrorCode = 0xE800_000A;
    pub const NOT_CONNECTED: ErrorCode = 0xE800_000B;
    pub const TIMED_OUT: ErrorCode = 0xE800_000F;
    pub const SESSION_ACTIVE: ErrorCode = 0xE800_001D;
    pub const SESSION_INACTIVE: ErrorCode = 0xE800_001E;
    pub const MUX_CONNECT: ErrorCode = 0xE800_001F;
    pub const INVALID_SERVICE: ErrorCode = 0xE800_0022;
    pub const INVALID_PAIR_RECORD: ErrorCode = 0xE800_0025;
    pub const INSTALL_PROHIBITED: ErrorCode = 0xE800_0081;
    pub const INSTALL_FAILED: ErrorCode = 0xE800_0082;
    pub const IMAGE_MOUNT_FAILED: ErrorCode = 0xE800_0083;
}

// 错误码到可读描述的查找表
static ERROR_TEXT: Lazy<HashMap<ErrorCode, &'static str>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(codes::SUCCESS, "成功");
    table.insert(codes::UNDEFINED, "未定义错误");
    table.insert(codes::NO_RESOURCES, "资源不足");
    table.insert(codes::READ_ERROR, "读取失败");
    table.insert(codes::WRITE_ERROR, "写入失败");
    table.insert(codes::INVALID_ARGUMENT, "无效参数");
    table.insert(codes::NOT_FOUND, "未找到请求的值");
    table.insert(codes::PERMISSION_DENIED, "权限不足");
    table.insert(codes::NOT_CONNECTED, "设备未连接");
    table.insert(codes::TIMED_OUT, "操作超时");
    table.insert(codes::SESSION_ACTIVE, "会话已处于激活状态");
    table.insert(codes::SESSION_INACTIVE, "没有激活的会话");
    table.insert(codes::MUX_CONNECT, "无法建立到设备的连接");
    table.insert(codes::INVALID_SERVICE, "服务不存在或无法启动");
    table.insert(codes::INVALID_PAIR_RECORD, "设备配对信任未建立");
    table.insert(codes::INSTALL_PROHIBITED, "设备禁止安装该类型的应用");
    table.insert(codes::INSTALL_FAILED, "安装过程报告了错误");
    table.insert(codes::IMAGE_MOUNT_FAILED, "磁盘镜像挂载失败");
    table
});

/// 返回错误码的可读描述
pub fn error_text(code: ErrorCode) -> &'static str {
    ERROR_TEXT.get(&code).copied().unwrap_or("未知错误码")
}

/// 设备操作相关的错误类型
#[derive(Debug, Error)]
pub enum DeviceError {
    /// 连接建立或断开错误
    #[error("连接错误 (0x{code:08X}): {message}")]
    ConnectionError { code: ErrorCode, message: String },

    /// 会话状态机错误
    #[error("会话错误 (0x{code:08X}): {message}")]
    SessionError { code: ErrorCode, message: String },

    /// 服务不可用
    #[error("服务 {service} 不可用 (0x{code:08X}): {message}")]
    ServiceUnavailableError {
        service: String,
        code: ErrorCode,
        message: String,
    },

    /// 属性查询未命中
    #[error("属性不存在: {0}")]
    NotFoundError(String),

    /// 设备已断开或句柄失效
    #[error("设备不可用: {0}")]
    DeviceUnavailableError(String),

    /// 配对信任错误
    #[error("配对错误 (0x{code:08X}): {message}")]
    PairingError { code: ErrorCode, message: String },

    /// 应用包传输错误
    #[error("传输错误 (0x{code:08X}): {message}")]
    TransferError { code: ErrorCode, message: String },

    /// 应用安装错误，附带最后上报的状态
    #[error("安装错误 (0x{code:08X}): {message}")]
    InstallationError {
        code: ErrorCode,
        message: String,
        last_status: Option<String>,
    },

    /// 磁盘镜像挂载错误
    #[error("挂载错误 (0x{code:08X}): {message}")]
    MountError { code: ErrorCode, message: String },

    /// 无法识别的应用包类型
    #[error("无效的包类型: {0}")]
    InvalidPackageType(String),

    /// 本地文件操作错误
    #[error("文件操作错误: {0}")]
    FileError(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 超时错误
    #[error("操作超时 ({duration:?}): {message}")]
    TimeoutError { message: String, duration: Duration },
}

impl DeviceError {
    /// 返回错误对应的数字错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            DeviceError::ConnectionError { code, .. } => *code,
            DeviceError::SessionError { code, .. } => *code,
            DeviceError::ServiceUnavailableError { code, .. } => *code,
            DeviceError::NotFoundError(_) => codes::NOT_FOUND,
            DeviceError::DeviceUnavailableError(_) => codes::NOT_CONNECTED,
            DeviceError::PairingError { code, .. } => *code,
            DeviceError::TransferError { code, .. } => *code,
            DeviceError::InstallationError { code, .. } => *code,
            DeviceError::MountError { code, .. } => *code,
            DeviceError::InvalidPackageType(_) => codes::INVALID_ARGUMENT,
            DeviceError::FileError(_) => codes::READ_ERROR,
            DeviceError::ConfigError(_) => codes::INVALID_ARGUMENT,
            DeviceError::TimeoutError { .. } => codes::TIMED_OUT,
        }
    }
}

// 为标准错误类型实现 From trait，简化错误处理
impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> Self {
        DeviceError::FileError(error.to_string())
    }
}

impl From<glob::PatternError> for DeviceError {
    fn from(error: glob::PatternError) -> Self {
        DeviceError::ConfigError(format!("排除模式无效: {}", error))
    }
}

// 添加结果类型别名简化使用
pub type DeviceResult<T> = Result<T, DeviceError>;
