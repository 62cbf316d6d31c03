use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DeviceConfig;
use crate::error::DeviceResult;
use crate::notify::NotificationHub;
use crate::registry::{DeviceHandle, Registry};
use crate::transport::{DeviceRecord, DeviceTransport};

/// 知名属性键
pub const DEVICE_NAME_KEY: &str = "DeviceName";
pub const BUILD_VERSION_KEY: &str = "BuildVersion";
pub const PRODUCT_TYPE_KEY: &str = "ProductType";
pub const PRODUCT_VERSION_KEY: &str = "ProductVersion";
pub const DEVICE_CLASS_KEY: &str = "DeviceClass";
pub const DEVICE_TYPE_KEY: &str = "DeviceType";
pub const HARDWARE_MODEL_KEY: &str = "HardwareModel";

/// 设备接口类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceType {
    Any,
    Wired,
    Wireless,
}

impl InterfaceType {
    /// 作为订阅过滤器时是否匹配给定的接口类型
    pub fn matches(&self, other: InterfaceType) -> bool {
        *self == InterfaceType::Any || other == InterfaceType::Any || *self == other
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceType::Any => write!(f, "any"),
            InterfaceType::Wired => write!(f, "usb"),
            InterfaceType::Wireless => write!(f, "wifi"),
        }
    }
}

/// 设备连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    SessionActive,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::SessionActive => write!(f, "session-active"),
        }
    }
}

/// 设备结构体
///
/// 设备是瞬态的，可能随时接入或移除。句柄带代数校验，
/// 设备断开后旧句柄上的所有操作都会失败，不要缓存。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub handle: DeviceHandle,
    pub udid: String,
    pub interface_type: InterfaceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_version: Option<String>,
}

impl Device {
    /// 由原始记录创建未填充属性的设备实例
    pub(crate) fn from_record(handle: DeviceHandle, record: &DeviceRecord) -> Self {
        Self {
            handle,
            udid: record.udid.clone(),
            interface_type: record.interface_type,
            name: None,
            build_version: None,
            device_class: None,
            device_type: None,
            hardware_model: None,
            product_type: None,
            product_version: None,
        }
    }

    /// 展示名称，未读到设备名时退回 UDID
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.udid)
    }

    /// 是否经无线接口接入
    pub fn is_wireless(&self) -> bool {
        self.interface_type == InterfaceType::Wireless
    }

    /// 解析 ProductVersion 为 (主, 次, 修订) 三元组
    pub fn product_version_components(&self) -> Option<(u32, u32, u32)> {
        crate::utils::parse_product_version(self.product_version.as_deref()?)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (UDID: {}, 型号: {}, 版本: {}, 接口: {})",
            self.display_name(),
            self.udid,
            self.product_type.as_deref().unwrap_or("?"),
            self.product_version.as_deref().unwrap_or("?"),
            self.interface_type
        )
    }
}

/// 设备管理器主结构体
///
/// 持有设备注册表与通知中心，所有设备操作都经由它发起。
/// 同一设备不要从两个线程同时发起操作。
#[derive(Clone)]
pub struct DeviceManager {
    pub config: DeviceConfig,
    pub(crate) transport: Arc<dyn DeviceTransport>,
    pub(crate) registry: Arc<Mutex<Registry>>,
    pub(crate) hub: Arc<NotificationHub>,
}

impl DeviceManager {
    /// 创建新的设备管理器实例
    pub fn new(transport: Arc<dyn DeviceTransport>, config: Option<DeviceConfig>) -> Self {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let hub = Arc::new(NotificationHub::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
        ));

        Self {
            config: config.unwrap_or_default(),
            transport,
            registry,
            hub,
        }
    }

    pub(crate) fn registry_lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 使用指数退避策略重试操作
    pub fn with_retry<F, T>(&self, f: F) -> DeviceResult<T>
    where
        F: Fn() -> DeviceResult<T>,
    {
        crate::utils::retry_with_backoff(self.config.max_retries, self.config.retry_delay, f)
    }

    /// 带超时的操作执行
    pub fn with_timeout<F, T>(&self, f: F) -> DeviceResult<T>
    where
        F: FnOnce() -> DeviceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        crate::utils::with_timeout(self.config.timeout, f)
    }
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .finish()
    }
}
