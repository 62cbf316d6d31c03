use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::device::{ConnectionState, DeviceManager};
use crate::error::{codes, error_text, DeviceError, DeviceResult, ErrorCode};
use crate::registry::DeviceHandle;
use crate::session::{ServiceConnection, AFC_SERVICE_NAME};
use crate::status::{self, FileCopyProgress, InstallStatus, StatusDict, TransferPhase, TransferStatus};
use crate::transport::{DeviceTransport, PropertyValue};

/// 安装选项字典中的包类型键
pub const PACKAGE_TYPE_KEY: &str = "PackageType";

/// 应用包类型
///
/// `Customer` 为商店签名的成品包，`Developer` 为开发签名的包，
/// 设备侧据此执行不同的签名与描述文件校验。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageType {
    Customer,
    Developer,
}

impl PackageType {
    /// 选项字典中使用的字符串值
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::Customer => "Customer",
            PackageType::Developer => "Developer",
        }
    }

    /// 根据应用包扩展名推断包类型：.ipa 为成品包，.app 为开发包
    pub fn from_bundle_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "ipa" => Some(PackageType::Customer),
            "app" => Some(PackageType::Developer),
            _ => None,
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 应用包传输选项
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// 包类型，缺省时按扩展名推断
    pub package_type: Option<PackageType>,
    /// 覆盖配置中的设备侧暂存目录
    pub staging_dir: Option<String>,
    /// 排除的文件模式，缺省时使用配置中的默认值
    pub exclude_patterns: Option<Vec<String>>,
    /// 单次写入的分块大小(单位:字节)
    pub chunk_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            package_type: None,
            staging_dir: None,
            exclude_patterns: None,
            chunk_size: 65536, // 64KB
        }
    }
}

/// 应用安装选项
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// 包类型，缺省时按路径扩展名推断
    pub package_type: Option<PackageType>,
    /// 透传给设备侧安装引擎的额外选项
    pub extra: HashMap<String, PropertyValue>,
}

// 传输工作线程回传的消息
enum TransferMsg {
    Status(TransferStatus),
    Done(ErrorCode),
}

// 设备侧引擎回传的消息
enum EngineMsg {
    Status(StatusDict),
    Done(ErrorCode),
}

// 待复制文件的清单
struct BundleManifest {
    files: Vec<(PathBuf, String)>,
    directories: Vec<String>,
    total_bytes: u64,
}

impl DeviceManager {
    /// 将应用包传输到设备的暂存目录
    ///
    /// 调用会阻塞到传输完成或失败，进度经 `on_progress` 在调用线程上回报。
    /// 未提供文件通道时内部临时建立一条并在结束后关闭。
    /// 传输中途失败会尽力清理设备侧暂存路径，保证不残留半个应用包。
    /// 返回设备侧的暂存路径，可直接交给安装操作。
    pub fn transfer_bundle<F>(
        &self,
        conduit: Option<&ServiceConnection>,
        handle: DeviceHandle,
        bundle_path: &Path,
        options: Option<TransferOptions>,
        mut on_progress: F,
    ) -> DeviceResult<String>
    where
        F: FnMut(&TransferStatus),
    {
        let options = options.unwrap_or_default();

        if !bundle_path.exists() {
            return Err(DeviceError::FileError(format!(
                "应用包不存在: {}",
                bundle_path.display()
            )));
        }

        let package_type = options
            .package_type
            .or_else(|| PackageType::from_bundle_path(bundle_path))
            .ok_or_else(|| {
                DeviceError::InvalidPackageType(format!(
                    "无法从 {} 推断包类型，请显式指定",
                    bundle_path.display()
                ))
            })?;

        let udid = {
            let registry = self.registry_lock();
            let entry = registry.resolve(handle)?;
            if entry.state != ConnectionState::SessionActive {
                return Err(DeviceError::SessionError {
                    code: codes::SESSION_INACTIVE,
                    message: format!("传输应用包需要设备 {} 的激活会话", entry.record.udid),
                });
            }
            entry.record.udid.clone()
        };

        // 借用调用者的文件通道，没有则临时建立一条
        let (raw, owned) = match conduit {
            Some(connection) => {
                if connection.device() != handle {
                    return Err(DeviceError::ConfigError(
                        "文件通道不属于目标设备".to_string(),
                    ));
                }
                self.acquire_conduit(handle, connection.raw)?;
                (connection.raw, None)
            }
            None => {
                let connection = self.start_service(handle, AFC_SERVICE_NAME, None)?;
                let raw = connection.raw;
                if let Err(e) = self.acquire_conduit(handle, raw) {
                    let _ = self.close_service(connection);
                    return Err(e);
                }
                (raw, Some(connection))
            }
        };

        let result = self.transfer_with_conduit(raw, &udid, bundle_path, package_type, &options, &mut on_progress);

        self.release_conduit(handle, raw);
        if let Some(connection) = owned {
            let _ = self.close_service(connection);
        }

        result
    }

    fn transfer_with_conduit(
        &self,
        raw: u64,
        udid: &str,
        bundle_path: &Path,
        package_type: PackageType,
        options: &TransferOptions,
        on_progress: &mut dyn FnMut(&TransferStatus),
    ) -> DeviceResult<String> {
        on_progress(&TransferStatus {
            percent_complete: 0,
            phase: TransferPhase::PreflightingTransfer,
        });

        let excludes = options
            .exclude_patterns
            .clone()
            .or_else(|| self.config.exclude_patterns.clone())
            .unwrap_or_default();
        let manifest = collect_bundle_files(bundle_path, &excludes)?;

        let staging_dir = options
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.config.staging_dir.clone());
        let bundle_name = bundle_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DeviceError::FileError(format!("无法取得应用包名称: {}", bundle_path.display()))
            })?;
        let staged_path = format!(
            "{}/{}",
            staging_dir.trim_end_matches('/'),
            crate::utils::staging_name(&bundle_name)
        );

        info!(
            "开始传输应用包 {} ({}) 到设备 {} 的 {}，共 {} 个文件 {}",
            bundle_path.display(),
            package_type,
            udid,
            staged_path,
            manifest.files.len(),
            crate::utils::format_size(manifest.total_bytes)
        );

        on_progress(&TransferStatus {
            percent_complete: 0,
            phase: TransferPhase::TransferringPackage,
        });

        let (tx, rx) = mpsc::channel();
        let transport = Arc::clone(&self.transport);
        let worker_staged = staged_path.clone();
        let chunk_size = options.chunk_size.max(1);

        let worker = thread::Builder::new()
            .name("bundle-transfer".to_string())
            .spawn(move || {
                let code = run_transfer(
                    transport.as_ref(),
                    raw,
                    &worker_staged,
                    &manifest,
                    chunk_size,
                    &tx,
                );
                let _ = tx.send(TransferMsg::Done(code));
            })
            .map_err(|e| DeviceError::ConfigError(format!("无法启动传输线程: {}", e)))?;

        // 看门狗：远端无响应时不能无限阻塞调用方
        let timeout = Duration::from_millis(self.config.timeout);
        let mut final_code = None;
        loop {
            match rx.recv_timeout(timeout) {
                Ok(TransferMsg::Status(transfer_status)) => on_progress(&transfer_status),
                Ok(TransferMsg::Done(code)) => {
                    final_code = Some(code);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    final_code = Some(codes::UNDEFINED);
                    break;
                }
            }
        }

        match final_code {
            Some(codes::SUCCESS) => {
                let _ = worker.join();
                info!("应用包已传输到设备 {} 的 {}", udid, staged_path);
                Ok(staged_path)
            }
            Some(code) => {
                let _ = worker.join();
                self.cleanup_staging(raw, &staged_path);
                Err(DeviceError::TransferError {
                    code,
                    message: format!("传输应用包到设备 {} 失败: {}", udid, error_text(code)),
                })
            }
            None => {
                self.cleanup_staging(raw, &staged_path);
                Err(DeviceError::TimeoutError {
                    message: format!("传输应用包到设备 {} 无响应", udid),
                    duration: timeout,
                })
            }
        }
    }

    fn cleanup_staging(&self, raw: u64, staged_path: &str) {
        let code = self.transport.conduit_remove_path(raw, staged_path);
        if code != codes::SUCCESS {
            warn!("清理设备暂存路径 {} 失败: {}", staged_path, error_text(code));
        } else {
            debug!("已清理设备暂存路径 {}", staged_path);
        }
    }

    // 同一条文件通道不能同时承载两个传输
    fn acquire_conduit(&self, handle: DeviceHandle, raw: u64) -> DeviceResult<()> {
        let mut registry = self.registry_lock();
        let entry = registry.resolve_mut(handle)?;
        let udid = entry.record.udid.clone();

        let service = entry
            .services
            .iter_mut()
            .find(|service| service.raw == raw)
            .ok_or_else(|| DeviceError::ServiceUnavailableError {
                service: AFC_SERVICE_NAME.to_string(),
                code: codes::INVALID_SERVICE,
                message: format!("设备 {} 上的文件通道已关闭", udid),
            })?;

        if service.name != AFC_SERVICE_NAME {
            return Err(DeviceError::ConfigError(format!(
                "服务 {} 不是文件通道",
                service.name
            )));
        }

        if service.busy {
            return Err(DeviceError::TransferError {
                code: codes::NO_RESOURCES,
                message: format!("设备 {} 的文件通道正被另一个传输占用", udid),
            });
        }

        service.busy = true;
        Ok(())
    }

    fn release_conduit(&self, handle: DeviceHandle, raw: u64) {
        let mut registry = self.registry_lock();
        if let Ok(entry) = registry.resolve_mut(handle) {
            if let Some(service) = entry.services.iter_mut().find(|s| s.raw == raw) {
                service.busy = false;
            }
        }
    }

    /// 在设备上安装应用
    ///
    /// `bundle_path` 为传输后得到的设备侧暂存路径，或设备可直接访问的路径。
    /// 调用会阻塞到安装结束，状态经 `on_progress` 在调用线程上回报。
    /// 任何状态字典携带错误信号时，即使最终错误码为成功也按失败处理。
    pub fn install_application<F>(
        &self,
        service: Option<&ServiceConnection>,
        handle: DeviceHandle,
        bundle_path: &str,
        options: Option<InstallOptions>,
        mut on_progress: F,
    ) -> DeviceResult<()>
    where
        F: FnMut(&InstallStatus),
    {
        let options = options.unwrap_or_default();

        let udid = {
            let registry = self.registry_lock();
            let entry = registry.resolve(handle)?;
            if entry.state != ConnectionState::SessionActive {
                return Err(DeviceError::SessionError {
                    code: codes::SESSION_INACTIVE,
                    message: format!("安装应用需要设备 {} 的激活会话", entry.record.udid),
                });
            }

            if let Some(connection) = service {
                if connection.device() != handle {
                    return Err(DeviceError::ConfigError(
                        "服务连接不属于目标设备".to_string(),
                    ));
                }
                if !entry.services.iter().any(|s| s.raw == connection.raw) {
                    return Err(DeviceError::ServiceUnavailableError {
                        service: connection.name().to_string(),
                        code: codes::INVALID_SERVICE,
                        message: format!("设备 {} 上的服务连接已关闭", entry.record.udid),
                    });
                }
            }

            entry.record.udid.clone()
        };

        let package_type = options
            .package_type
            .or_else(|| PackageType::from_bundle_path(Path::new(bundle_path)))
            .ok_or_else(|| {
                DeviceError::InvalidPackageType(format!(
                    "无法从 {} 推断包类型，请显式指定",
                    bundle_path
                ))
            })?;

        // 开发签名的包必须先在设备上启用开发者模式
        if package_type == PackageType::Developer {
            let enabled = self.get_developer_mode_status(handle)?;
            if !enabled {
                return Err(DeviceError::InstallationError {
                    code: codes::INSTALL_PROHIBITED,
                    message: format!("设备 {} 未启用开发者模式，无法安装 Developer 包", udid),
                    last_status: None,
                });
            }
        }

        let mut engine_options = options.extra.clone();
        engine_options.insert(
            PACKAGE_TYPE_KEY.to_string(),
            PropertyValue::Text(package_type.as_str().to_string()),
        );

        info!("开始在设备 {} 上安装 {} ({})", udid, bundle_path, package_type);

        let transport = Arc::clone(&self.transport);
        let engine_udid = udid.clone();
        let engine_path = bundle_path.to_string();

        let mut last_status: Option<String> = None;
        let mut status_error: Option<String> = None;

        let outcome = drive_status_engine(
            move |emit| transport.install_application(&engine_udid, &engine_path, &engine_options, emit),
            Duration::from_millis(self.config.timeout),
            |dict| {
                if let Some(message) = status::dict_error(&dict) {
                    status_error = Some(message);
                }
                match InstallStatus::from_dict(&dict) {
                    Some(install_status) => {
                        last_status = Some(install_status.phase.as_status_str().to_string());
                        on_progress(&install_status);
                    }
                    None => trace!("忽略无法识别的安装状态: {:?}", dict),
                }
            },
        );

        match outcome {
            Some(codes::SUCCESS) => match status_error {
                // 状态流里报过错就不能宣称成功
                Some(message) => Err(DeviceError::InstallationError {
                    code: codes::INSTALL_FAILED,
                    message: format!("设备 {} 报告安装错误: {}", udid, message),
                    last_status,
                }),
                None => {
                    info!("设备 {} 上的应用安装完成", udid);
                    Ok(())
                }
            },
            Some(code) => Err(DeviceError::InstallationError {
                code,
                message: format!("在设备 {} 上安装应用失败: {}", udid, error_text(code)),
                last_status,
            }),
            None => Err(DeviceError::TimeoutError {
                message: format!("设备 {} 的安装引擎无响应", udid),
                duration: Duration::from_millis(self.config.timeout),
            }),
        }
    }

    /// 一站式安装：连接、校验配对、启动会话、传输并安装，结束后还原状态
    pub fn transfer_and_install<FT, FI>(
        &self,
        handle: DeviceHandle,
        bundle_path: &Path,
        transfer_options: Option<TransferOptions>,
        install_options: Option<InstallOptions>,
        on_transfer: FT,
        on_install: FI,
    ) -> DeviceResult<()>
    where
        FT: FnMut(&TransferStatus),
        FI: FnMut(&InstallStatus),
    {
        self.connect(handle)?;

        if let Err(e) = self.validate_pairing(handle) {
            let _ = self.disconnect(handle);
            return Err(e);
        }

        if let Err(e) = self.start_session(handle) {
            let _ = self.disconnect(handle);
            return Err(e);
        }

        // 安装端缺省沿用传输端解析出的包类型，暂存路径保留扩展名
        let mut install_options = install_options.unwrap_or_default();
        if install_options.package_type.is_none() {
            install_options.package_type = transfer_options
                .as_ref()
                .and_then(|options| options.package_type)
                .or_else(|| PackageType::from_bundle_path(bundle_path));
        }

        let outcome = self
            .transfer_bundle(None, handle, bundle_path, transfer_options, on_transfer)
            .and_then(|staged_path| {
                self.install_application(
                    None,
                    handle,
                    &staged_path,
                    Some(install_options),
                    on_install,
                )
            });

        if let Err(e) = self.stop_session(handle) {
            warn!("安装后停止会话失败: {}", e);
        }
        if let Err(e) = self.disconnect(handle) {
            warn!("安装后断开连接失败: {}", e);
        }

        outcome
    }
}

/// 在工作线程上驱动设备侧引擎，状态字典经通道回到调用线程处理。
/// 返回最终错误码，看门狗超时返回 None。
pub(crate) fn drive_status_engine<Op, H>(op: Op, timeout: Duration, mut handler: H) -> Option<ErrorCode>
where
    Op: FnOnce(&mut dyn FnMut(StatusDict)) -> ErrorCode + Send + 'static,
    H: FnMut(StatusDict),
{
    let (tx, rx) = mpsc::channel();
    let done_tx = tx.clone();

    let worker = match thread::Builder::new()
        .name("device-engine".to_string())
        .spawn(move || {
            let mut emit = |dict: StatusDict| {
                let _ = tx.send(EngineMsg::Status(dict));
            };
            let code = op(&mut emit);
            let _ = done_tx.send(EngineMsg::Done(code));
        }) {
        Ok(worker) => worker,
        Err(e) => {
            warn!("无法启动引擎线程: {}", e);
            return Some(codes::NO_RESOURCES);
        }
    };

    loop {
        match rx.recv_timeout(timeout) {
            Ok(EngineMsg::Status(dict)) => handler(dict),
            Ok(EngineMsg::Done(code)) => {
                let _ = worker.join();
                return Some(code);
            }
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.join();
                return Some(codes::UNDEFINED);
            }
        }
    }
}

fn run_transfer(
    transport: &dyn DeviceTransport,
    raw: u64,
    staged_path: &str,
    manifest: &BundleManifest,
    chunk_size: usize,
    tx: &Sender<TransferMsg>,
) -> ErrorCode {
    let code = transport.conduit_make_directory(raw, staged_path);
    if code != codes::SUCCESS {
        return code;
    }

    for directory in &manifest.directories {
        let code = transport.conduit_make_directory(raw, &format!("{}/{}", staged_path, directory));
        if code != codes::SUCCESS {
            return code;
        }
    }

    let total_files = manifest.files.len() as u64;
    let mut copied_files: u64 = 0;
    let mut copied_bytes: u64 = 0;
    let mut buffer = vec![0u8; chunk_size];

    for (local_path, relative) in &manifest.files {
        let mut file = match File::open(local_path) {
            Ok(file) => file,
            Err(_) => return codes::READ_ERROR,
        };

        let remote_path = format!("{}/{}", staged_path, relative);
        let mut offset: u64 = 0;

        loop {
            let read = match file.read(&mut buffer) {
                Ok(read) => read,
                Err(_) => return codes::READ_ERROR,
            };
            if read == 0 {
                break;
            }

            let code = transport.conduit_write(raw, &remote_path, &buffer[..read], offset);
            if code != codes::SUCCESS {
                return code;
            }

            offset += read as u64;
            copied_bytes += read as u64;

            let percent = if manifest.total_bytes == 0 {
                100
            } else {
                (copied_bytes * 100 / manifest.total_bytes) as i32
            };

            let _ = tx.send(TransferMsg::Status(TransferStatus {
                percent_complete: percent,
                phase: TransferPhase::CopyingFile(FileCopyProgress {
                    total_files,
                    total_bytes: manifest.total_bytes,
                    copied_files,
                    copied_bytes,
                    current_path: PathBuf::from(relative),
                }),
            }));
        }

        copied_files += 1;
    }

    let _ = tx.send(TransferMsg::Status(TransferStatus {
        percent_complete: 100,
        phase: TransferPhase::TransferringPackage,
    }));

    codes::SUCCESS
}

// 预检：递归收集应用包内容，目录序固定便于对账
fn collect_bundle_files(bundle_path: &Path, excludes: &[String]) -> DeviceResult<BundleManifest> {
    let mut manifest = BundleManifest {
        files: Vec::new(),
        directories: Vec::new(),
        total_bytes: 0,
    };

    if bundle_path.is_file() {
        let size = fs::metadata(bundle_path)?.len();
        let name = bundle_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DeviceError::FileError(format!("无法取得文件名: {}", bundle_path.display()))
            })?;

        manifest.total_bytes = size;
        manifest.files.push((bundle_path.to_path_buf(), name));
        return Ok(manifest);
    }

    collect_directory(bundle_path, "", excludes, &mut manifest)?;
    Ok(manifest)
}

fn collect_directory(
    directory: &Path,
    prefix: &str,
    excludes: &[String],
    manifest: &mut BundleManifest,
) -> DeviceResult<()> {
    let mut entries: Vec<_> = fs::read_dir(directory)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if crate::utils::matches_any(&name, excludes)? {
            debug!("按排除模式跳过 {}", name);
            continue;
        }

        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let path = entry.path();

        if path.is_dir() {
            manifest.directories.push(relative.clone());
            collect_directory(&path, &relative, excludes, manifest)?;
        } else {
            manifest.total_bytes += fs::metadata(&path)?.len();
            manifest.files.push((path, relative));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DEVICE_NAME_KEY;
    use crate::loopback::{LoopbackDevice, LoopbackTransport};
    use crate::status::InstallPhase;
    use std::sync::Mutex;

    fn write_bundle(root: &Path) {
        fs::create_dir_all(root.join("Frameworks")).unwrap();
        fs::write(root.join("Info.plist"), b"<plist/>").unwrap();
        fs::write(root.join("app-binary"), vec![0xAB; 200_000]).unwrap();
        fs::write(root.join("Frameworks/libdemo.dylib"), vec![0xCD; 70_000]).unwrap();
        fs::write(root.join(".DS_Store"), b"junk").unwrap();
    }

    fn temp_bundle(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "mdkit-test-{}-{}",
            name,
            crate::utils::staging_name("bundle")
        ));
        let bundle = root.join("Demo.app");
        write_bundle(&bundle);
        bundle
    }

    fn session_manager(device: LoopbackDevice) -> (DeviceManager, Arc<LoopbackTransport>, DeviceHandle) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(device);
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        let handle = manager.list_devices().unwrap()[0].handle;
        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();
        (manager, transport, handle)
    }

    #[test]
    fn package_type_detection() {
        assert_eq!(
            PackageType::from_bundle_path(Path::new("Demo.app")),
            Some(PackageType::Developer)
        );
        assert_eq!(
            PackageType::from_bundle_path(Path::new("Demo.ipa")),
            Some(PackageType::Customer)
        );
        assert_eq!(PackageType::from_bundle_path(Path::new("Demo.zip")), None);
    }

    #[test]
    fn transfer_reports_progress_and_stages_files() {
        let bundle = temp_bundle("transfer");
        let (manager, transport, handle) = session_manager(LoopbackDevice::new("udid-1"));

        let statuses = Mutex::new(Vec::new());
        let options = TransferOptions {
            exclude_patterns: Some(vec![".DS_Store".to_string()]),
            ..TransferOptions::default()
        };

        let staged = manager
            .transfer_bundle(None, handle, &bundle, Some(options), |transfer_status| {
                statuses.lock().unwrap().push(transfer_status.clone());
            })
            .unwrap();

        // 暂存路径保留扩展名，安装端可以继续推断包类型
        assert!(staged.starts_with("PublicStaging/"));
        assert!(staged.ends_with(".app"));
        assert!(transport.conduit_contains("udid-1", &format!("{}/Info.plist", staged)));
        assert!(transport.conduit_contains(
            "udid-1",
            &format!("{}/Frameworks/libdemo.dylib", staged)
        ));
        assert!(!transport.conduit_contains("udid-1", &format!("{}/.DS_Store", staged)));

        let statuses = statuses.into_inner().unwrap();
        assert!(matches!(
            statuses.first().unwrap().phase,
            TransferPhase::PreflightingTransfer
        ));
        assert_eq!(statuses.last().unwrap().percent_complete, 100);

        // 完成百分比单调不减
        let mut previous = 0;
        for transfer_status in &statuses {
            assert!(transfer_status.percent_complete >= previous);
            previous = transfer_status.percent_complete;
        }

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn transfer_failure_cleans_staging() {
        let bundle = temp_bundle("cleanup");
        let (manager, transport, handle) = session_manager(LoopbackDevice::new("udid-1"));

        transport.fail_next("conduit_write", codes::WRITE_ERROR);
        let err = manager
            .transfer_bundle(None, handle, &bundle, None, |_| {})
            .unwrap_err();

        assert!(matches!(err, DeviceError::TransferError { .. }));
        assert_eq!(err.code(), codes::WRITE_ERROR);
        // 失败后设备侧不残留半个应用包
        assert!(!transport.conduit_contains_prefix("udid-1", "PublicStaging/"));

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn transfer_requires_active_session() {
        let bundle = temp_bundle("nosession");
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(LoopbackDevice::new("udid-1"));
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        let handle = manager.list_devices().unwrap()[0].handle;

        let err = manager
            .transfer_bundle(None, handle, &bundle, None, |_| {})
            .unwrap_err();
        assert_eq!(err.code(), codes::SESSION_INACTIVE);

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn busy_conduit_rejects_second_transfer() {
        let (manager, _transport, handle) = session_manager(LoopbackDevice::new("udid-1"));
        let connection = manager
            .start_service(handle, AFC_SERVICE_NAME, None)
            .unwrap();

        manager.acquire_conduit(handle, connection.raw).unwrap();
        let err = manager.acquire_conduit(handle, connection.raw).unwrap_err();
        assert_eq!(err.code(), codes::NO_RESOURCES);

        manager.release_conduit(handle, connection.raw);
        manager.acquire_conduit(handle, connection.raw).unwrap();
    }

    #[test]
    fn install_customer_package_succeeds() {
        let bundle = temp_bundle("install");
        let (manager, _transport, handle) = session_manager(
            LoopbackDevice::new("udid-1").with_property(DEVICE_NAME_KEY, "测试机"),
        );

        let staged = manager
            .transfer_bundle(None, handle, &bundle, None, |_| {})
            .unwrap();

        let phases = Mutex::new(Vec::new());
        manager
            .install_application(
                None,
                handle,
                &staged,
                Some(InstallOptions {
                    package_type: Some(PackageType::Customer),
                    ..InstallOptions::default()
                }),
                |install_status| {
                    phases.lock().unwrap().push(install_status.clone());
                },
            )
            .unwrap();

        let phases = phases.into_inner().unwrap();
        assert_eq!(phases.first().unwrap().phase, InstallPhase::CreatingStagingDirectory);
        assert_eq!(phases.last().unwrap().phase, InstallPhase::InstallComplete);
        assert_eq!(phases.last().unwrap().percent_complete, 100);

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn developer_install_requires_developer_mode() {
        let bundle = temp_bundle("devmode");
        let (manager, _transport, handle) =
            session_manager(LoopbackDevice::new("udid-1").with_developer_mode(false));

        let staged = manager
            .transfer_bundle(None, handle, &bundle, None, |_| {})
            .unwrap();

        // 暂存路径以 .app 结尾，推断为 Developer 包
        let err = manager
            .install_application(None, handle, &staged, None, |_| {})
            .unwrap_err();

        assert!(matches!(err, DeviceError::InstallationError { .. }));
        assert_eq!(err.code(), codes::INSTALL_PROHIBITED);
        assert_ne!(err.code(), codes::SUCCESS);

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn status_error_overrides_success_code() {
        let bundle = temp_bundle("statuserr");
        let (manager, transport, handle) =
            session_manager(LoopbackDevice::new("udid-1").with_developer_mode(true));

        let staged = manager
            .transfer_bundle(None, handle, &bundle, None, |_| {})
            .unwrap();

        transport.fail_next("install_status_error", codes::SUCCESS);
        let err = manager
            .install_application(None, handle, &staged, None, |_| {})
            .unwrap_err();

        match err {
            DeviceError::InstallationError { code, .. } => {
                assert_eq!(code, codes::INSTALL_FAILED)
            }
            other => panic!("意外的错误: {:?}", other),
        }

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn install_engine_failure_carries_last_status() {
        let bundle = temp_bundle("enginefail");
        let (manager, transport, handle) =
            session_manager(LoopbackDevice::new("udid-1").with_developer_mode(true));

        let staged = manager
            .transfer_bundle(None, handle, &bundle, None, |_| {})
            .unwrap();

        transport.fail_next("install", codes::INSTALL_FAILED);
        let err = manager
            .install_application(None, handle, &staged, None, |_| {})
            .unwrap_err();

        match err {
            DeviceError::InstallationError { code, last_status, .. } => {
                assert_eq!(code, codes::INSTALL_FAILED);
                assert!(last_status.is_some());
            }
            other => panic!("意外的错误: {:?}", other),
        }

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn transfer_and_install_restores_state() {
        let bundle = temp_bundle("oneshot");
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(LoopbackDevice::new("udid-1").with_developer_mode(true));
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        let handle = manager.list_devices().unwrap()[0].handle;

        manager
            .transfer_and_install(handle, &bundle, None, None, |_| {}, |_| {})
            .unwrap();

        // 结束后回到断开状态，可以重新开始完整生命周期
        manager.connect(handle).unwrap();
        manager.start_session(handle).unwrap();
        manager.stop_session(handle).unwrap();
        manager.disconnect(handle).unwrap();

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }

    #[test]
    fn unpaired_device_fails_one_shot_install() {
        let bundle = temp_bundle("unpaired");
        let transport = Arc::new(LoopbackTransport::new());
        transport.attach(LoopbackDevice::new("udid-1").with_paired(false));
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        let handle = manager.list_devices().unwrap()[0].handle;

        let err = manager
            .transfer_and_install(handle, &bundle, None, None, |_| {}, |_| {})
            .unwrap_err();
        assert!(matches!(err, DeviceError::PairingError { .. }));

        fs::remove_dir_all(bundle.parent().unwrap()).unwrap();
    }
}
