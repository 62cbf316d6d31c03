use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;

use crate::device::{
    ConnectionState, Device, DeviceManager, InterfaceType, BUILD_VERSION_KEY, DEVICE_CLASS_KEY,
    DEVICE_NAME_KEY, DEVICE_TYPE_KEY, HARDWARE_MODEL_KEY, PRODUCT_TYPE_KEY, PRODUCT_VERSION_KEY,
};
use crate::error::{codes, error_text, DeviceError, DeviceResult};
use crate::transport::{DeviceRecord, DeviceTransport, PropertyValue};

/// 代数校验的设备句柄
///
/// 设备断开后槽位代数递增，旧句柄随之失效，
/// 解析失效句柄得到 `DeviceUnavailableError` 而不是访问到错误的设备。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// 会话期间打开的服务连接记录
pub(crate) struct ServiceEntry {
    pub raw: u64,
    pub name: String,
    pub busy: bool,
}

/// 注册表中的设备条目
pub(crate) struct DeviceEntry {
    pub record: DeviceRecord,
    pub state: ConnectionState,
    pub services: Vec<ServiceEntry>,
}

struct Slot {
    generation: u32,
    entry: Option<DeviceEntry>,
}

/// 设备注册表，独占持有设备条目的生命周期
pub(crate) struct Registry {
    slots: Vec<Slot>,
    index_by_udid: HashMap<String, u32>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index_by_udid: HashMap::new(),
        }
    }

    /// 登记设备，已存在时更新记录并返回原句柄
    pub fn upsert(&mut self, record: DeviceRecord) -> DeviceHandle {
        if let Some(&index) = self.index_by_udid.get(&record.udid) {
            let slot = &mut self.slots[index as usize];
            if let Some(entry) = slot.entry.as_mut() {
                entry.record = record;
                return DeviceHandle {
                    index,
                    generation: slot.generation,
                };
            }
        }

        // 复用空槽位，没有空槽位时扩容
        let index = match self.slots.iter().position(|slot| slot.entry.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };

        self.index_by_udid.insert(record.udid.clone(), index as u32);
        let slot = &mut self.slots[index];
        slot.entry = Some(DeviceEntry {
            record,
            state: ConnectionState::Disconnected,
            services: Vec::new(),
        });

        DeviceHandle {
            index: index as u32,
            generation: slot.generation,
        }
    }

    /// 移除设备条目并递增槽位代数，使既有句柄失效
    pub fn vacate(&mut self, udid: &str) -> bool {
        match self.index_by_udid.remove(udid) {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, handle: DeviceHandle) -> DeviceResult<&DeviceEntry> {
        let slot = self.slots.get(handle.index as usize).ok_or_else(|| {
            DeviceError::DeviceUnavailableError(format!("无效的设备句柄 (槽位 {})", handle.index))
        })?;

        if slot.generation != handle.generation {
            return Err(DeviceError::DeviceUnavailableError(format!(
                "设备句柄已失效 (槽位 {})",
                handle.index
            )));
        }

        slot.entry.as_ref().ok_or_else(|| {
            DeviceError::DeviceUnavailableError(format!("设备已断开 (槽位 {})", handle.index))
        })
    }

    pub fn resolve_mut(&mut self, handle: DeviceHandle) -> DeviceResult<&mut DeviceEntry> {
        let slot = self.slots.get_mut(handle.index as usize).ok_or_else(|| {
            DeviceError::DeviceUnavailableError(format!("无效的设备句柄 (槽位 {})", handle.index))
        })?;

        if slot.generation != handle.generation {
            return Err(DeviceError::DeviceUnavailableError(format!(
                "设备句柄已失效 (槽位 {})",
                handle.index
            )));
        }

        slot.entry.as_mut().ok_or_else(|| {
            DeviceError::DeviceUnavailableError(format!("设备已断开 (槽位 {})", handle.index))
        })
    }

    pub fn handle_of(&self, udid: &str) -> Option<DeviceHandle> {
        let &index = self.index_by_udid.get(udid)?;
        let slot = &self.slots[index as usize];
        slot.entry.as_ref()?;

        Some(DeviceHandle {
            index,
            generation: slot.generation,
        })
    }

    pub fn udids(&self) -> Vec<String> {
        self.index_by_udid.keys().cloned().collect()
    }
}

/// 读取设备的知名属性，未连接的设备按原始枚举的方式
/// 短暂建立连接与会话，读完即还原
pub(crate) fn read_device(
    transport: &dyn DeviceTransport,
    handle: DeviceHandle,
    record: &DeviceRecord,
    state: ConnectionState,
) -> Device {
    let udid = record.udid.as_str();
    let bracket = state == ConnectionState::Disconnected;

    if bracket {
        let code = transport.connect(udid);
        if code != codes::SUCCESS {
            trace!("读取设备 {} 属性前连接失败: {}", udid, error_text(code));
            return Device::from_record(handle, record);
        }
        // 基础属性不强制要求会话，能建则建
        let _ = transport.start_session(udid);
    }

    let read = |key: &str| {
        transport
            .copy_value(udid, None, key)
            .ok()
            .and_then(PropertyValue::into_text)
    };

    let mut device = Device::from_record(handle, record);
    device.name = read(DEVICE_NAME_KEY);
    device.build_version = read(BUILD_VERSION_KEY);
    device.device_class = read(DEVICE_CLASS_KEY);
    device.device_type = read(DEVICE_TYPE_KEY);
    device.hardware_model = read(HARDWARE_MODEL_KEY);
    device.product_type = read(PRODUCT_TYPE_KEY);
    device.product_version = read(PRODUCT_VERSION_KEY);

    if bracket {
        let _ = transport.stop_session(udid);
        let _ = transport.disconnect(udid);
    }

    device
}

impl DeviceManager {
    /// 枚举当前接入的设备，返回调用时的快照
    pub fn list_devices(&self) -> DeviceResult<Vec<Device>> {
        let records = self.transport.scan_devices();
        let mut registry = self.registry_lock();

        // 与扫描结果对账，消失的设备移出注册表
        let seen: Vec<String> = records.iter().map(|r| r.udid.clone()).collect();
        for udid in registry.udids() {
            if !seen.contains(&udid) {
                debug!("设备 {} 已不在扫描结果中，移出注册表", udid);
                registry.vacate(&udid);
            }
        }

        let mut devices = Vec::with_capacity(records.len());
        for record in records {
            let handle = registry.upsert(record.clone());
            let state = registry.resolve(handle)?.state;
            devices.push(read_device(self.transport.as_ref(), handle, &record, state));
        }

        info!("发现 {} 个设备", devices.len());
        Ok(devices)
    }

    /// 按键读取设备属性
    ///
    /// 键在域中不存在时返回 `NotFoundError`，
    /// 设备已断开时返回 `DeviceUnavailableError`。
    pub fn get_value(
        &self,
        handle: DeviceHandle,
        domain: Option<&str>,
        key: &str,
    ) -> DeviceResult<PropertyValue> {
        let registry = self.registry_lock();
        let entry = registry.resolve(handle)?;
        let udid = entry.record.udid.clone();

        match self.transport.copy_value(&udid, domain, key) {
            Ok(value) => {
                trace!("设备 {} 属性 {}: {}", udid, key, value);
                Ok(value)
            }
            Err(code) if code == codes::NOT_FOUND => Err(DeviceError::NotFoundError(
                match domain {
                    Some(domain) => format!("{}/{}", domain, key),
                    None => key.to_string(),
                },
            )),
            Err(code) if code == codes::NOT_CONNECTED || code == codes::MUX_CONNECT => Err(
                DeviceError::DeviceUnavailableError(format!("设备 {} 已断开", udid)),
            ),
            Err(code) => Err(DeviceError::ConnectionError {
                code,
                message: format!("读取设备 {} 的属性 {} 失败: {}", udid, key, error_text(code)),
            }),
        }
    }

    /// 查询设备的接口类型，只在句柄无效时失败
    pub fn get_interface_type(&self, handle: DeviceHandle) -> DeviceResult<InterfaceType> {
        let registry = self.registry_lock();
        let entry = registry.resolve(handle)?;
        Ok(self.transport.interface_type(&entry.record.udid))
    }

    /// 查询开发者模式开关
    ///
    /// 底层框架在失败路径上也可能填充布尔值，
    /// 因此必须先检查错误码，码不为成功时布尔值一律不可信。
    pub fn get_developer_mode_status(&self, handle: DeviceHandle) -> DeviceResult<bool> {
        let registry = self.registry_lock();
        let entry = registry.resolve(handle)?;
        let udid = entry.record.udid.clone();

        let (enabled, code) = self.transport.developer_mode_status(&udid);
        if code != codes::SUCCESS {
            return Err(DeviceError::ConnectionError {
                code,
                message: format!("查询设备 {} 的开发者模式失败: {}", udid, error_text(code)),
            });
        }

        Ok(enabled)
    }

    /// 等待指定设备接入
    pub fn wait_for_device(&self, udid: &str, timeout_ms: Option<u64>) -> DeviceResult<bool> {
        let timeout = timeout_ms.unwrap_or(30000);
        let poll_interval = 500;

        info!("等待设备 {} 接入...", udid);

        let result = crate::utils::wait_with_polling(
            timeout,
            poll_interval,
            || {
                Ok(self
                    .transport
                    .scan_devices()
                    .iter()
                    .any(|record| record.udid == udid))
            },
            Some(|elapsed: u64| {
                if elapsed > 0 && elapsed % 5000 == 0 {
                    debug!("等待设备 {} 接入，已等待 {}s...", udid, elapsed / 1000);
                }
            }),
        )?;

        if result {
            info!("设备 {} 已接入", udid);
        } else {
            warn!("等待设备 {} 接入超时", udid);
        }

        Ok(result)
    }

    /// 按 UDID 查找设备
    pub fn device_by_udid(&self, udid: &str) -> DeviceResult<Option<Device>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|device| device.udid == udid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevice, LoopbackTransport};
    use std::sync::Arc;

    fn manager_with(devices: Vec<LoopbackDevice>) -> (DeviceManager, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        for device in devices {
            transport.attach(device);
        }
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        (manager, transport)
    }

    #[test]
    fn list_devices_returns_populated_snapshot() {
        let (manager, _transport) = manager_with(vec![LoopbackDevice::new("udid-1")
            .with_property(DEVICE_NAME_KEY, "测试机")
            .with_property(PRODUCT_TYPE_KEY, "iPhone14,2")
            .with_property(PRODUCT_VERSION_KEY, "16.1.2")]);

        let devices = manager.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].udid, "udid-1");
        assert_eq!(devices[0].name.as_deref(), Some("测试机"));
        assert_eq!(devices[0].product_version_components(), Some((16, 1, 2)));
    }

    #[test]
    fn get_value_missing_key_is_not_found() {
        let (manager, _transport) = manager_with(vec![LoopbackDevice::new("udid-1")]);
        let device = &manager.list_devices().unwrap()[0];

        let err = manager
            .get_value(device.handle, None, "NoSuchKey")
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFoundError(_)));
        assert_eq!(err.code(), codes::NOT_FOUND);
    }

    #[test]
    fn get_value_with_domain_qualifier() {
        let (manager, _transport) = manager_with(vec![LoopbackDevice::new("udid-1")
            .with_property("com.apple.mobile.battery/BatteryCurrentCapacity", 80i64)]);
        let device = &manager.list_devices().unwrap()[0];

        let value = manager
            .get_value(
                device.handle,
                Some("com.apple.mobile.battery"),
                "BatteryCurrentCapacity",
            )
            .unwrap();
        assert_eq!(value.as_i64(), Some(80));
    }

    #[test]
    fn stale_handle_after_detach() {
        let (manager, transport) = manager_with(vec![LoopbackDevice::new("udid-1")]);
        let handle = manager.list_devices().unwrap()[0].handle;

        transport.detach("udid-1");
        // 重新枚举触发对账，旧句柄随之失效
        assert!(manager.list_devices().unwrap().is_empty());

        let err = manager.get_value(handle, None, DEVICE_NAME_KEY).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailableError(_)));
    }

    #[test]
    fn reattach_invalidates_old_generation() {
        let (manager, transport) = manager_with(vec![LoopbackDevice::new("udid-1")]);
        let old = manager.list_devices().unwrap()[0].handle;

        transport.detach("udid-1");
        manager.list_devices().unwrap();
        transport.attach(LoopbackDevice::new("udid-1"));
        let new = manager.list_devices().unwrap()[0].handle;

        assert_ne!(old, new);
        assert!(manager.get_interface_type(old).is_err());
        assert!(manager.get_interface_type(new).is_ok());
    }

    #[test]
    fn developer_mode_error_code_is_checked_first() {
        let (manager, transport) = manager_with(vec![
            LoopbackDevice::new("udid-1").with_developer_mode(true)
        ]);
        let handle = manager.list_devices().unwrap()[0].handle;

        assert!(manager.get_developer_mode_status(handle).unwrap());

        // 注入失败后即使布尔值可用也必须报错
        transport.fail_next("developer_mode", codes::PERMISSION_DENIED);
        let err = manager.get_developer_mode_status(handle).unwrap_err();
        assert_eq!(err.code(), codes::PERMISSION_DENIED);
    }

    #[test]
    fn wait_for_device_times_out() {
        let (manager, _transport) = manager_with(vec![]);
        let found = manager.wait_for_device("missing", Some(200)).unwrap();
        assert!(!found);
    }
}
