use log::{info, trace};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::device::{ConnectionState, DeviceManager};
use crate::error::{codes, error_text, DeviceError, DeviceResult};
use crate::install::drive_status_engine;
use crate::registry::DeviceHandle;
use crate::status::MountStatus;
use crate::transport::PropertyValue;

/// 镜像挂载选项字典中的键
pub const IMAGE_TYPE_KEY: &str = "ImageType";
pub const IMAGE_SIGNATURE_KEY: &str = "ImageSignature";
/// 开发者磁盘镜像的镜像类型值
pub const IMAGE_TYPE_DEVELOPER: &str = "Developer";

impl DeviceManager {
    /// 在设备上挂载开发者磁盘镜像
    ///
    /// 签名文件随镜像一并下发，设备侧校验通过后完成挂载。
    /// 调用会阻塞到挂载结束，状态经 `on_progress` 在调用线程上回报。
    pub fn mount_developer_image<F>(
        &self,
        handle: DeviceHandle,
        image_path: &Path,
        signature_path: &Path,
        mut on_progress: F,
    ) -> DeviceResult<()>
    where
        F: FnMut(&MountStatus),
    {
        let udid = {
            let registry = self.registry_lock();
            let entry = registry.resolve(handle)?;
            if entry.state != ConnectionState::SessionActive {
                return Err(DeviceError::SessionError {
                    code: codes::SESSION_INACTIVE,
                    message: format!("挂载镜像需要设备 {} 的激活会话", entry.record.udid),
                });
            }
            entry.record.udid.clone()
        };

        let signature = fs::read(signature_path).map_err(|e| {
            DeviceError::FileError(format!(
                "无法读取磁盘镜像签名 {}: {}",
                signature_path.display(),
                e
            ))
        })?;

        let mut engine_options: HashMap<String, PropertyValue> = HashMap::new();
        engine_options.insert(
            IMAGE_TYPE_KEY.to_string(),
            PropertyValue::Text(IMAGE_TYPE_DEVELOPER.to_string()),
        );
        engine_options.insert(
            IMAGE_SIGNATURE_KEY.to_string(),
            PropertyValue::Data(signature),
        );

        info!(
            "开始在设备 {} 上挂载开发者镜像 {}",
            udid,
            image_path.display()
        );

        let transport = Arc::clone(&self.transport);
        let engine_udid = udid.clone();
        let engine_path = image_path.to_string_lossy().into_owned();

        let outcome = drive_status_engine(
            move |emit| transport.mount_image(&engine_udid, &engine_path, &engine_options, emit),
            Duration::from_millis(self.config.timeout),
            |dict| match MountStatus::from_dict(&dict) {
                Some(mount_status) => on_progress(&mount_status),
                None => trace!("忽略无法识别的挂载状态: {:?}", dict),
            },
        );

        match outcome {
            Some(codes::SUCCESS) => {
                info!("设备 {} 上的开发者镜像挂载完成", udid);
                Ok(())
            }
            Some(code) => Err(DeviceError::MountError {
                code,
                message: format!("在设备 {} 上挂载镜像失败: {}", udid, error_text(code)),
            }),
            None => Err(DeviceError::TimeoutError {
                message: format!("设备 {} 的镜像挂载引擎无响应", udid),
                duration: Duration::from_millis(self.config.timeout),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevice, LoopbackTransport};
    use crate::status::MountPhase;
    use crate::transport::DeviceTransport;
    use std::sync::Mutex;

    fn session_manager() -> (DeviceManager, Arc<LoopbackTransport>, DeviceHandle) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(LoopbackDevice::new("udid-1"));
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        let handle = manager.list_devices().unwrap()[0].handle;
        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();
        (manager, transport, handle)
    }

    fn temp_image() -> (std::path::PathBuf, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "mdkit-mount-{}",
            crate::utils::staging_name("image")
        ));
        fs::create_dir_all(&root).unwrap();
        let image = root.join("DeveloperDiskImage.dmg");
        let signature = root.join("DeveloperDiskImage.dmg.signature");
        fs::write(&image, vec![0u8; 4096]).unwrap();
        fs::write(&signature, vec![1u8; 128]).unwrap();
        (image, signature)
    }

    #[test]
    fn mount_reports_phase_percents() {
        let (manager, _transport, handle) = session_manager();
        let (image, signature) = temp_image();

        let statuses = Mutex::new(Vec::new());
        manager
            .mount_developer_image(handle, &image, &signature, |mount_status| {
                statuses.lock().unwrap().push(mount_status.clone());
            })
            .unwrap();

        let statuses = statuses.into_inner().unwrap();
        assert!(matches!(
            statuses.first().unwrap().phase,
            MountPhase::LookingUpImage
        ));
        assert_eq!(statuses.first().unwrap().percent_complete, 0);
        assert!(matches!(
            statuses.last().unwrap().phase,
            MountPhase::MountingImage
        ));
        assert_eq!(statuses.last().unwrap().percent_complete, 100);

        fs::remove_dir_all(image.parent().unwrap()).unwrap();
    }

    #[test]
    fn missing_signature_file_fails_before_any_remote_work() {
        let (manager, _transport, handle) = session_manager();
        let (image, _signature) = temp_image();

        let err = manager
            .mount_developer_image(handle, &image, Path::new("/no/such/signature"), |_| {})
            .unwrap_err();
        assert!(matches!(err, DeviceError::FileError(_)));

        fs::remove_dir_all(image.parent().unwrap()).unwrap();
    }

    #[test]
    fn mount_engine_failure_is_surfaced() {
        let (manager, transport, handle) = session_manager();
        let (image, signature) = temp_image();

        transport.fail_next("mount", codes::IMAGE_MOUNT_FAILED);
        let err = manager
            .mount_developer_image(handle, &image, &signature, |_| {})
            .unwrap_err();

        assert!(matches!(err, DeviceError::MountError { .. }));
        assert_eq!(err.code(), codes::IMAGE_MOUNT_FAILED);

        fs::remove_dir_all(image.parent().unwrap()).unwrap();
    }

    #[test]
    fn mount_requires_active_session() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(LoopbackDevice::new("udid-1"));
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        let handle = manager.list_devices().unwrap()[0].handle;
        let (image, signature) = temp_image();

        let err = manager
            .mount_developer_image(handle, &image, &signature, |_| {})
            .unwrap_err();
        assert_eq!(err.code(), codes::SESSION_INACTIVE);

        fs::remove_dir_all(image.parent().unwrap()).unwrap();
    }
}
