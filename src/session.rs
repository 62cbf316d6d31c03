use log::{debug, info, warn};
use std::collections::HashMap;

use crate::device::{ConnectionState, DeviceManager};
use crate::error::{codes, error_text, DeviceError, DeviceResult};
use crate::registry::{DeviceHandle, ServiceEntry};
use crate::transport::PropertyValue;

/// 文件通道服务的服务名
pub const AFC_SERVICE_NAME: &str = "com.apple.afc";
/// 磁盘镜像挂载服务的服务名
pub const MOBILE_IMAGE_MOUNTER_SERVICE_NAME: &str = "com.apple.mobile.mobile_image_mounter";

/// 会话内打开的服务连接
///
/// 服务连接是会话的子资源：会话停止或设备断开后连接随之失效。
/// 关闭时移交所有权，关闭后的连接无法再被使用。
#[derive(Debug)]
pub struct ServiceConnection {
    pub(crate) device: DeviceHandle,
    pub(crate) raw: u64,
    name: String,
}

impl ServiceConnection {
    /// 服务名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 所属设备的句柄
    pub fn device(&self) -> DeviceHandle {
        self.device
    }
}

impl DeviceManager {
    /// 建立到设备的连接
    pub fn connect(&self, handle: DeviceHandle) -> DeviceResult<()> {
        let mut registry = self.registry_lock();
        let entry = registry.resolve_mut(handle)?;
        let udid = entry.record.udid.clone();

        match entry.state {
            ConnectionState::Connected | ConnectionState::SessionActive => {
                debug!("设备 {} 已处于连接状态", udid);
                Ok(())
            }
            ConnectionState::Disconnected => {
                let code = self.transport.connect(&udid);
                if code != codes::SUCCESS {
                    return Err(DeviceError::ConnectionError {
                        code,
                        message: format!("连接设备 {} 失败: {}", udid, error_text(code)),
                    });
                }

                entry.state = ConnectionState::Connected;
                info!("已连接设备 {}", udid);
                Ok(())
            }
        }
    }

    /// 断开与设备的连接
    ///
    /// 会话仍处于激活状态时拒绝断开，调用方必须先停止会话。
    pub fn disconnect(&self, handle: DeviceHandle) -> DeviceResult<()> {
        let mut registry = self.registry_lock();
        let entry = registry.resolve_mut(handle)?;
        let udid = entry.record.udid.clone();

        match entry.state {
            ConnectionState::SessionActive => Err(DeviceError::SessionError {
                code: codes::SESSION_ACTIVE,
                message: format!("设备 {} 的会话仍处于激活状态，断开前须先停止会话", udid),
            }),
            ConnectionState::Disconnected => Err(DeviceError::ConnectionError {
                code: codes::NOT_CONNECTED,
                message: format!("设备 {} 未连接", udid),
            }),
            ConnectionState::Connected => {
                for service in entry.services.drain(..) {
                    let _ = self.transport.close_service(&udid, service.raw);
                }

                let code = self.transport.disconnect(&udid);
                if code != codes::SUCCESS {
                    return Err(DeviceError::ConnectionError {
                        code,
                        message: format!("断开设备 {} 失败: {}", udid, error_text(code)),
                    });
                }

                entry.state = ConnectionState::Disconnected;
                info!("已断开设备 {}", udid);
                Ok(())
            }
        }
    }

    /// 启动与设备的会话
    ///
    /// 会话已激活时必须先停止再启动，重复启动是错误。
    pub fn start_session(&self, handle: DeviceHandle) -> DeviceResult<()> {
        let mut registry = self.registry_lock();
        let entry = registry.resolve_mut(handle)?;
        let udid = entry.record.udid.clone();

        match entry.state {
            ConnectionState::Disconnected => Err(DeviceError::SessionError {
                code: codes::NOT_CONNECTED,
                message: format!("设备 {} 未连接，无法启动会话", udid),
            }),
            ConnectionState::SessionActive => Err(DeviceError::SessionError {
                code: codes::SESSION_ACTIVE,
                message: format!("设备 {} 的会话已激活，不能重复启动", udid),
            }),
            ConnectionState::Connected => {
                let code = self.transport.start_session(&udid);
                if code != codes::SUCCESS {
                    return Err(DeviceError::SessionError {
                        code,
                        message: format!("启动设备 {} 的会话失败: {}", udid, error_text(code)),
                    });
                }

                entry.state = ConnectionState::SessionActive;
                debug!("已启动设备 {} 的会话", udid);
                Ok(())
            }
        }
    }

    /// 停止与设备的会话
    ///
    /// 没有激活的会话时报错，便于发现状态机使用上的错误。
    pub fn stop_session(&self, handle: DeviceHandle) -> DeviceResult<()> {
        let mut registry = self.registry_lock();
        let entry = registry.resolve_mut(handle)?;
        let udid = entry.record.udid.clone();

        if entry.state != ConnectionState::SessionActive {
            return Err(DeviceError::SessionError {
                code: codes::SESSION_INACTIVE,
                message: format!("设备 {} 没有激活的会话", udid),
            });
        }

        // 服务连接是会话的子资源，停止会话前先逐个关闭
        for service in entry.services.drain(..) {
            let code = self.transport.close_service(&udid, service.raw);
            if code != codes::SUCCESS {
                warn!(
                    "关闭设备 {} 的服务 {} 失败: {}",
                    udid,
                    service.name,
                    error_text(code)
                );
            }
        }

        let code = self.transport.stop_session(&udid);
        if code != codes::SUCCESS {
            return Err(DeviceError::SessionError {
                code,
                message: format!("停止设备 {} 的会话失败: {}", udid, error_text(code)),
            });
        }

        entry.state = ConnectionState::Connected;
        debug!("已停止设备 {} 的会话", udid);
        Ok(())
    }

    /// 校验与设备的配对信任
    pub fn validate_pairing(&self, handle: DeviceHandle) -> DeviceResult<()> {
        let registry = self.registry_lock();
        let entry = registry.resolve(handle)?;
        let udid = entry.record.udid.clone();

        if entry.state == ConnectionState::Disconnected {
            return Err(DeviceError::ConnectionError {
                code: codes::NOT_CONNECTED,
                message: format!("设备 {} 未连接，无法校验配对", udid),
            });
        }

        let code = self.transport.validate_pairing(&udid);
        if code != codes::SUCCESS {
            return Err(DeviceError::PairingError {
                code,
                message: format!("设备 {} 配对校验失败: {}", udid, error_text(code)),
            });
        }

        debug!("设备 {} 配对校验通过", udid);
        Ok(())
    }

    /// 在设备上启动命名服务
    ///
    /// 只能在会话激活时调用。服务不存在或权限不足
    /// （未建立信任、未开启开发者模式）时返回 `ServiceUnavailableError`。
    pub fn start_service(
        &self,
        handle: DeviceHandle,
        service_name: &str,
        options: Option<&HashMap<String, PropertyValue>>,
    ) -> DeviceResult<ServiceConnection> {
        let mut registry = self.registry_lock();
        let entry = registry.resolve_mut(handle)?;
        let udid = entry.record.udid.clone();

        if entry.state != ConnectionState::SessionActive {
            return Err(DeviceError::SessionError {
                code: codes::SESSION_INACTIVE,
                message: format!("启动服务 {} 需要设备 {} 的激活会话", service_name, udid),
            });
        }

        match self.transport.start_service(&udid, service_name, options) {
            Ok(raw) => {
                entry.services.push(ServiceEntry {
                    raw,
                    name: service_name.to_string(),
                    busy: false,
                });

                info!("已在设备 {} 上启动服务 {}", udid, service_name);
                Ok(ServiceConnection {
                    device: handle,
                    raw,
                    name: service_name.to_string(),
                })
            }
            Err(code) => {
                let message = if code == codes::PERMISSION_DENIED {
                    format!(
                        "设备 {} 拒绝启动服务 {}: {} (检查配对信任与开发者模式)",
                        udid,
                        service_name,
                        error_text(code)
                    )
                } else {
                    format!(
                        "在设备 {} 上启动服务 {} 失败: {}",
                        udid,
                        service_name,
                        error_text(code)
                    )
                };

                Err(DeviceError::ServiceUnavailableError {
                    service: service_name.to_string(),
                    code,
                    message,
                })
            }
        }
    }

    /// 关闭服务连接
    ///
    /// 所属会话或设备已经不在时视为已关闭，不报错。
    pub fn close_service(&self, connection: ServiceConnection) -> DeviceResult<()> {
        let mut registry = self.registry_lock();

        let entry = match registry.resolve_mut(connection.device) {
            Ok(entry) => entry,
            Err(_) => {
                debug!("服务 {} 所属设备已不在，跳过关闭", connection.name());
                return Ok(());
            }
        };
        let udid = entry.record.udid.clone();

        match entry.services.iter().position(|s| s.raw == connection.raw) {
            Some(position) => {
                entry.services.remove(position);
                let code = self.transport.close_service(&udid, connection.raw);
                if code != codes::SUCCESS {
                    warn!(
                        "关闭设备 {} 的服务 {} 失败: {}",
                        udid,
                        connection.name(),
                        error_text(code)
                    );
                }
                debug!("已关闭设备 {} 的服务 {}", udid, connection.name());
                Ok(())
            }
            None => {
                debug!("服务 {} 已随会话关闭", connection.name());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevice, LoopbackTransport};
    use crate::transport::DeviceTransport;
    use std::sync::Arc;

    fn connected_manager(device: LoopbackDevice) -> (DeviceManager, DeviceHandle) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(device);
        let manager = DeviceManager::new(transport as Arc<dyn DeviceTransport>, None);
        let handle = manager.list_devices().unwrap()[0].handle;
        (manager, handle)
    }

    #[test]
    fn full_lifecycle_succeeds() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();
        manager.stop_session(handle).unwrap();
        manager.disconnect(handle).unwrap();
    }

    #[test]
    fn double_start_session_fails() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();

        let err = manager.start_session(handle).unwrap_err();
        assert!(matches!(err, DeviceError::SessionError { .. }));
        assert_eq!(err.code(), codes::SESSION_ACTIVE);
    }

    #[test]
    fn stop_session_without_session_is_strict_error() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        manager.connect(handle).unwrap();
        let err = manager.stop_session(handle).unwrap_err();
        assert_eq!(err.code(), codes::SESSION_INACTIVE);
    }

    #[test]
    fn disconnect_with_active_session_fails() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();

        let err = manager.disconnect(handle).unwrap_err();
        assert_eq!(err.code(), codes::SESSION_ACTIVE);

        // 状态机保持一致：停止会话后可以正常断开
        manager.stop_session(handle).unwrap();
        manager.disconnect(handle).unwrap();
    }

    #[test]
    fn session_requires_connection() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        let err = manager.start_session(handle).unwrap_err();
        assert_eq!(err.code(), codes::NOT_CONNECTED);
    }

    #[test]
    fn connect_gone_device_is_connection_error() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(LoopbackDevice::new("udid-1"));
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        let handle = manager.list_devices().unwrap()[0].handle;

        // 设备在传输层消失但注册表尚未对账
        transport.detach("udid-1");
        let err = manager.connect(handle).unwrap_err();
        assert!(matches!(err, DeviceError::ConnectionError { .. }));
        assert_eq!(err.code(), codes::MUX_CONNECT);
    }

    #[test]
    fn start_service_requires_active_session() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        manager.connect(handle).unwrap();
        let err = manager
            .start_service(handle, AFC_SERVICE_NAME, None)
            .unwrap_err();
        assert_eq!(err.code(), codes::SESSION_INACTIVE);
    }

    #[test]
    fn unknown_service_is_unavailable() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();

        let err = manager
            .start_service(handle, "com.apple.no.such.service", None)
            .unwrap_err();
        assert!(matches!(err, DeviceError::ServiceUnavailableError { .. }));
        assert_eq!(err.code(), codes::INVALID_SERVICE);
    }

    #[test]
    fn services_are_scoped_to_the_session() {
        let (manager, handle) = connected_manager(LoopbackDevice::new("udid-1"));

        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();
        let connection = manager
            .start_service(handle, AFC_SERVICE_NAME, None)
            .unwrap();
        assert_eq!(connection.name(), AFC_SERVICE_NAME);

        // 会话停止后连接已被回收，再关闭只是无害的空操作
        manager.stop_session(handle).unwrap();
        manager.close_service(connection).unwrap();
    }

    #[test]
    fn unpaired_device_cannot_validate() {
        let (manager, handle) =
            connected_manager(LoopbackDevice::new("udid-1").with_paired(false));

        manager.connect(handle).unwrap();
        let err = manager.validate_pairing(handle).unwrap_err();
        assert!(matches!(err, DeviceError::PairingError { .. }));
        assert_eq!(err.code(), codes::INVALID_PAIR_RECORD);
    }
}
