use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;

use crate::device::InterfaceType;
use crate::error::ErrorCode;
use crate::status::StatusDict;

/// 属性查询与状态字典中的值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Text(String),
    Number(i64),
    Boolean(bool),
    Data(Vec<u8>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) => write!(f, "{}", s),
            PropertyValue::Number(n) => write!(f, "{}", n),
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::Data(bytes) => write!(f, "<{} 字节>", bytes.len()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Text(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Boolean(b)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(bytes: Vec<u8>) -> Self {
        PropertyValue::Data(bytes)
    }
}

/// 传输层上报的原始设备记录
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub udid: String,
    pub interface_type: InterfaceType,
}

/// 传输层上报的设备接入/移除事件
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Attached(DeviceRecord),
    Detached { udid: String },
}

/// 与底层设备框架对接的传输接口
///
/// 这是整个库与不公开协议之间唯一的边界：线缆协议、配对握手和
/// 文件通道的帧格式都在实现内部，调用面只有原始错误码与状态字典。
/// 所有方法都是阻塞调用。
pub trait DeviceTransport: Send + Sync {
    /// 枚举当前接入的设备，调用时快照
    fn scan_devices(&self) -> Vec<DeviceRecord>;

    /// 订阅设备接入/移除事件，每次调用返回一个新的接收端
    fn subscribe_events(&self) -> mpsc::Receiver<TransportEvent>;

    fn connect(&self, udid: &str) -> ErrorCode;
    fn disconnect(&self, udid: &str) -> ErrorCode;
    fn start_session(&self, udid: &str) -> ErrorCode;
    fn stop_session(&self, udid: &str) -> ErrorCode;
    fn validate_pairing(&self, udid: &str) -> ErrorCode;

    /// 读取设备属性，`domain` 为空时查询全局域
    fn copy_value(
        &self,
        udid: &str,
        domain: Option<&str>,
        key: &str,
    ) -> Result<PropertyValue, ErrorCode>;

    fn interface_type(&self, udid: &str) -> InterfaceType;

    /// 查询开发者模式开关，布尔值仅在错误码为成功时有意义
    fn developer_mode_status(&self, udid: &str) -> (bool, ErrorCode);

    /// 在设备上启动命名服务，返回原始服务连接标识
    fn start_service(
        &self,
        udid: &str,
        service_name: &str,
        options: Option<&HashMap<String, PropertyValue>>,
    ) -> Result<u64, ErrorCode>;

    fn close_service(&self, udid: &str, raw: u64) -> ErrorCode;

    // 文件通道原语
    fn conduit_make_directory(&self, raw: u64, path: &str) -> ErrorCode;
    fn conduit_write(&self, raw: u64, path: &str, data: &[u8], offset: u64) -> ErrorCode;
    fn conduit_remove_path(&self, raw: u64, path: &str) -> ErrorCode;

    /// 驱动设备侧安装引擎，状态字典经回调流式上报
    fn install_application(
        &self,
        udid: &str,
        bundle_path: &str,
        options: &HashMap<String, PropertyValue>,
        on_status: &mut dyn FnMut(StatusDict),
    ) -> ErrorCode;

    /// 驱动设备侧镜像挂载引擎
    fn mount_image(
        &self,
        udid: &str,
        image_path: &str,
        options: &HashMap<String, PropertyValue>,
        on_status: &mut dyn FnMut(StatusDict),
    ) -> ErrorCode;
}
