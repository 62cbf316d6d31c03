use log::debug;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use crate::device::InterfaceType;
use crate::error::{codes, ErrorCode};
use crate::status::{
    StatusDict, ERROR_DESCRIPTION_KEY, ERROR_KEY, NUM_BYTES_KEY, NUM_FILES_KEY, PATH_KEY,
    PERCENT_COMPLETE_KEY, STATUS_KEY, TOTAL_BYTES_KEY, TOTAL_FILES_KEY,
};
use crate::transport::{DeviceRecord, DeviceTransport, PropertyValue, TransportEvent};

// 安装引擎的阶段脚本
const INSTALL_PHASES: &[(&str, i64)] = &[
    ("CreatingStagingDirectory", 0),
    ("ExtractingPackage", 10),
    ("InspectingPackage", 20),
    ("PreflightingApplication", 30),
    ("VerifyingApplication", 40),
    ("CreatingContainer", 50),
    ("InstallingApplication", 60),
    ("PostflightingApplication", 75),
    ("SandboxingApplication", 85),
    ("GeneratingApplicationMap", 95),
    ("InstallComplete", 100),
];

/// 回环传输中的模拟设备
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    udid: String,
    interface_type: InterfaceType,
    properties: HashMap<String, PropertyValue>,
    developer_mode: bool,
    paired: bool,
    services: Vec<String>,
}

impl LoopbackDevice {
    /// 创建新的模拟设备，默认经 USB 接入、已配对、未开启开发者模式
    pub fn new(udid: &str) -> Self {
        Self {
            udid: udid.to_string(),
            interface_type: InterfaceType::Wired,
            properties: HashMap::new(),
            developer_mode: false,
            paired: true,
            services: vec![
                crate::session::AFC_SERVICE_NAME.to_string(),
                crate::session::MOBILE_IMAGE_MOUNTER_SERVICE_NAME.to_string(),
            ],
        }
    }

    /// 设置接入接口类型
    pub fn with_interface_type(mut self, interface_type: InterfaceType) -> Self {
        self.interface_type = interface_type;
        self
    }

    /// 添加设备属性，域内属性用 `域/键` 的形式作为键
    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// 设置开发者模式开关
    pub fn with_developer_mode(mut self, enabled: bool) -> Self {
        self.developer_mode = enabled;
        self
    }

    /// 设置配对信任状态
    pub fn with_paired(mut self, paired: bool) -> Self {
        self.paired = paired;
        self
    }

    /// 追加设备上可用的服务
    pub fn with_service(mut self, name: &str) -> Self {
        self.services.push(name.to_string());
        self
    }

    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            udid: self.udid.clone(),
            interface_type: self.interface_type,
        }
    }
}

struct DeviceState {
    profile: LoopbackDevice,
    connected: bool,
    session_active: bool,
    services: HashMap<u64, String>,
    files: HashMap<String, Vec<u8>>,
    directories: HashSet<String>,
}

impl DeviceState {
    fn new(profile: LoopbackDevice) -> Self {
        Self {
            profile,
            connected: false,
            session_active: false,
            services: HashMap::new(),
            files: HashMap::new(),
            directories: HashSet::new(),
        }
    }
}

struct LoopbackState {
    devices: HashMap<String, DeviceState>,
    next_service_raw: u64,
}

/// 内存回环传输
///
/// 在进程内模拟设备框架：接入/移除广播事件、维护会话与服务簿记、
/// 提供一个简单的文件通道文件系统和按脚本推进的安装/挂载引擎。
/// 供单元测试与示例使用，可注入一次性的操作失败。
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    senders: Mutex<Vec<Sender<TransportEvent>>>,
    failures: Mutex<HashMap<String, ErrorCode>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                devices: HashMap::new(),
                next_service_raw: 1,
            }),
            senders: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 接入模拟设备并广播接入事件
    pub fn attach(&self, device: LoopbackDevice) {
        let record = device.record();
        self.state()
            .devices
            .insert(device.udid.clone(), DeviceState::new(device));
        debug!("回环设备 {} 已接入", record.udid);
        self.broadcast(TransportEvent::Attached(record));
    }

    /// 移除模拟设备并广播移除事件
    pub fn detach(&self, udid: &str) {
        self.state().devices.remove(udid);
        debug!("回环设备 {} 已移除", udid);
        self.broadcast(TransportEvent::Detached {
            udid: udid.to_string(),
        });
    }

    /// 注入一次性失败：下一次名为 `op` 的操作返回给定错误码
    ///
    /// 可用的操作名: connect, start_session, stop_session, validate_pairing,
    /// copy_value, developer_mode, start_service, conduit_write, install,
    /// install_status_error, mount
    pub fn fail_next(&self, op: &str, code: ErrorCode) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op.to_string(), code);
    }

    /// 检查设备侧文件系统中是否存在指定文件
    pub fn conduit_contains(&self, udid: &str, path: &str) -> bool {
        self.state()
            .devices
            .get(udid)
            .map(|device| device.files.contains_key(path))
            .unwrap_or(false)
    }

    /// 检查设备侧文件系统中是否存在带给定前缀的文件或目录
    pub fn conduit_contains_prefix(&self, udid: &str, prefix: &str) -> bool {
        self.state()
            .devices
            .get(udid)
            .map(|device| {
                device.files.keys().any(|path| path.starts_with(prefix))
                    || device
                        .directories
                        .iter()
                        .any(|path| path.starts_with(prefix))
            })
            .unwrap_or(false)
    }

    fn take_failure(&self, op: &str) -> Option<ErrorCode> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(op)
    }

    fn broadcast(&self, event: TransportEvent) {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn device_udid_of_service(state: &LoopbackState, raw: u64) -> Option<String> {
        state
            .devices
            .iter()
            .find(|(_, device)| device.services.contains_key(&raw))
            .map(|(udid, _)| udid.clone())
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn phase_dict(phase: &str, percent: i64) -> StatusDict {
    let mut dict = StatusDict::new();
    dict.insert(STATUS_KEY.to_string(), PropertyValue::Text(phase.to_string()));
    dict.insert(PERCENT_COMPLETE_KEY.to_string(), PropertyValue::Number(percent));
    dict
}

fn error_dict(error: &str, description: &str) -> StatusDict {
    let mut dict = StatusDict::new();
    dict.insert(ERROR_KEY.to_string(), PropertyValue::Text(error.to_string()));
    dict.insert(
        ERROR_DESCRIPTION_KEY.to_string(),
        PropertyValue::Text(description.to_string()),
    );
    dict
}

impl DeviceTransport for LoopbackTransport {
    fn scan_devices(&self) -> Vec<DeviceRecord> {
        self.state()
            .devices
            .values()
            .map(|device| device.profile.record())
            .collect()
    }

    fn subscribe_events(&self) -> Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel();
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn connect(&self, udid: &str) -> ErrorCode {
        if let Some(code) = self.take_failure("connect") {
            return code;
        }

        let mut state = self.state();
        match state.devices.get_mut(udid) {
            Some(device) => {
                device.connected = true;
                codes::SUCCESS
            }
            None => codes::MUX_CONNECT,
        }
    }

    fn disconnect(&self, udid: &str) -> ErrorCode {
        let mut state = self.state();
        match state.devices.get_mut(udid) {
            Some(device) if device.connected => {
                device.connected = false;
                device.session_active = false;
                device.services.clear();
                codes::SUCCESS
            }
            _ => codes::NOT_CONNECTED,
        }
    }

    fn start_session(&self, udid: &str) -> ErrorCode {
        if let Some(code) = self.take_failure("start_session") {
            return code;
        }

        let mut state = self.state();
        match state.devices.get_mut(udid) {
            Some(device) if device.connected => {
                if device.session_active {
                    codes::SESSION_ACTIVE
                } else if !device.profile.paired {
                    codes::INVALID_PAIR_RECORD
                } else {
                    device.session_active = true;
                    codes::SUCCESS
                }
            }
            _ => codes::NOT_CONNECTED,
        }
    }

    fn stop_session(&self, udid: &str) -> ErrorCode {
        if let Some(code) = self.take_failure("stop_session") {
            return code;
        }

        let mut state = self.state();
        match state.devices.get_mut(udid) {
            Some(device) if device.session_active => {
                device.session_active = false;
                device.services.clear();
                codes::SUCCESS
            }
            Some(_) => codes::SESSION_INACTIVE,
            None => codes::NOT_CONNECTED,
        }
    }

    fn validate_pairing(&self, udid: &str) -> ErrorCode {
        if let Some(code) = self.take_failure("validate_pairing") {
            return code;
        }

        let state = self.state();
        match state.devices.get(udid) {
            Some(device) if device.connected => {
                if device.profile.paired {
                    codes::SUCCESS
                } else {
                    codes::INVALID_PAIR_RECORD
                }
            }
            _ => codes::NOT_CONNECTED,
        }
    }

    fn copy_value(
        &self,
        udid: &str,
        domain: Option<&str>,
        key: &str,
    ) -> Result<PropertyValue, ErrorCode> {
        if let Some(code) = self.take_failure("copy_value") {
            return Err(code);
        }

        let state = self.state();
        let device = state.devices.get(udid).ok_or(codes::NOT_CONNECTED)?;

        let qualified = match domain {
            Some(domain) => format!("{}/{}", domain, key),
            None => key.to_string(),
        };

        device
            .profile
            .properties
            .get(&qualified)
            .cloned()
            .ok_or(codes::NOT_FOUND)
    }

    fn interface_type(&self, udid: &str) -> InterfaceType {
        self.state()
            .devices
            .get(udid)
            .map(|device| device.profile.interface_type)
            .unwrap_or(InterfaceType::Any)
    }

    fn developer_mode_status(&self, udid: &str) -> (bool, ErrorCode) {
        let state = self.state();
        let Some(device) = state.devices.get(udid) else {
            return (false, codes::NOT_CONNECTED);
        };

        // 失败路径上布尔值照样填充，调用方必须先看错误码
        if let Some(code) = self.take_failure("developer_mode") {
            return (device.profile.developer_mode, code);
        }

        (device.profile.developer_mode, codes::SUCCESS)
    }

    fn start_service(
        &self,
        udid: &str,
        service_name: &str,
        _options: Option<&HashMap<String, PropertyValue>>,
    ) -> Result<u64, ErrorCode> {
        if let Some(code) = self.take_failure("start_service") {
            return Err(code);
        }

        let mut state = self.state();
        let raw = state.next_service_raw;
        let device = state.devices.get_mut(udid).ok_or(codes::NOT_CONNECTED)?;

        if !device.session_active {
            return Err(codes::SESSION_INACTIVE);
        }
        if !device.profile.services.iter().any(|name| name == service_name) {
            return Err(codes::INVALID_SERVICE);
        }

        device.services.insert(raw, service_name.to_string());
        state.next_service_raw += 1;
        Ok(raw)
    }

    fn close_service(&self, udid: &str, raw: u64) -> ErrorCode {
        let mut state = self.state();
        if let Some(device) = state.devices.get_mut(udid) {
            device.services.remove(&raw);
        }
        codes::SUCCESS
    }

    fn conduit_make_directory(&self, raw: u64, path: &str) -> ErrorCode {
        let mut state = self.state();
        let Some(udid) = Self::device_udid_of_service(&state, raw) else {
            return codes::INVALID_SERVICE;
        };

        if let Some(device) = state.devices.get_mut(&udid) {
            device.directories.insert(path.to_string());
        }
        codes::SUCCESS
    }

    fn conduit_write(&self, raw: u64, path: &str, data: &[u8], offset: u64) -> ErrorCode {
        if let Some(code) = self.take_failure("conduit_write") {
            return code;
        }

        let mut state = self.state();
        let Some(udid) = Self::device_udid_of_service(&state, raw) else {
            return codes::INVALID_SERVICE;
        };

        if let Some(device) = state.devices.get_mut(&udid) {
            let file = device.files.entry(path.to_string()).or_default();
            let offset = offset as usize;
            if file.len() < offset {
                file.resize(offset, 0);
            }
            file.truncate(offset);
            file.extend_from_slice(data);
        }
        codes::SUCCESS
    }

    fn conduit_remove_path(&self, raw: u64, path: &str) -> ErrorCode {
        let mut state = self.state();
        let Some(udid) = Self::device_udid_of_service(&state, raw) else {
            return codes::INVALID_SERVICE;
        };

        if let Some(device) = state.devices.get_mut(&udid) {
            device.files.retain(|file_path, _| !file_path.starts_with(path));
            device
                .directories
                .retain(|dir_path| !dir_path.starts_with(path));
        }
        codes::SUCCESS
    }

    fn install_application(
        &self,
        udid: &str,
        bundle_path: &str,
        options: &HashMap<String, PropertyValue>,
        on_status: &mut dyn FnMut(StatusDict),
    ) -> ErrorCode {
        // 先在锁内做判定，状态上报不持锁
        let verdict: Result<(), ErrorCode> = {
            let state = self.state();
            match state.devices.get(udid) {
                Some(device) if device.session_active => {
                    let staged = device.files.keys().any(|path| path.starts_with(bundle_path))
                        || device.directories.contains(bundle_path);
                    if !staged && !Path::new(bundle_path).exists() {
                        Err(codes::NOT_FOUND)
                    } else {
                        let developer = options
                            .get(crate::install::PACKAGE_TYPE_KEY)
                            .and_then(PropertyValue::as_str)
                            == Some("Developer");
                        if developer && !device.profile.developer_mode {
                            Err(codes::INSTALL_PROHIBITED)
                        } else {
                            Ok(())
                        }
                    }
                }
                Some(_) => Err(codes::SESSION_INACTIVE),
                None => Err(codes::NOT_CONNECTED),
            }
        };

        if let Some(code) = self.take_failure("install") {
            let (phase, percent) = INSTALL_PHASES[0];
            on_status(phase_dict(phase, percent));
            return code;
        }

        if self.take_failure("install_status_error").is_some() {
            for &(phase, percent) in &INSTALL_PHASES[..2] {
                on_status(phase_dict(phase, percent));
            }
            on_status(error_dict("ApplicationVerificationFailed", "应用校验失败"));
            return codes::SUCCESS;
        }

        match verdict {
            Ok(()) => {
                for &(phase, percent) in INSTALL_PHASES {
                    on_status(phase_dict(phase, percent));
                }
                codes::SUCCESS
            }
            Err(code) if code == codes::INSTALL_PROHIBITED => {
                on_status(error_dict(
                    "DeveloperModeDisabled",
                    "设备未启用开发者模式",
                ));
                code
            }
            Err(code) => code,
        }
    }

    fn mount_image(
        &self,
        udid: &str,
        image_path: &str,
        options: &HashMap<String, PropertyValue>,
        on_status: &mut dyn FnMut(StatusDict),
    ) -> ErrorCode {
        let verdict: Result<u64, ErrorCode> = {
            let state = self.state();
            match state.devices.get(udid) {
                Some(device) if device.session_active => {
                    if options.get(crate::mount::IMAGE_SIGNATURE_KEY).is_none() {
                        Err(codes::INVALID_ARGUMENT)
                    } else {
                        Ok(std::fs::metadata(image_path)
                            .map(|metadata| metadata.len())
                            .unwrap_or(0))
                    }
                }
                Some(_) => Err(codes::SESSION_INACTIVE),
                None => Err(codes::NOT_CONNECTED),
            }
        };

        if let Some(code) = self.take_failure("mount") {
            on_status(phase_dict("LookingUpImage", 0));
            return code;
        }

        match verdict {
            Ok(image_bytes) => {
                on_status(phase_dict("LookingUpImage", 0));
                on_status(phase_dict("StreamingImage", 1));

                let mut copying = phase_dict("CopyingFile", 55);
                copying.insert(TOTAL_FILES_KEY.to_string(), PropertyValue::Number(1));
                copying.insert(
                    TOTAL_BYTES_KEY.to_string(),
                    PropertyValue::Number(image_bytes as i64),
                );
                copying.insert(NUM_FILES_KEY.to_string(), PropertyValue::Number(0));
                copying.insert(
                    NUM_BYTES_KEY.to_string(),
                    PropertyValue::Number((image_bytes / 2) as i64),
                );
                copying.insert(
                    PATH_KEY.to_string(),
                    PropertyValue::Text(image_path.to_string()),
                );
                on_status(copying);

                on_status(phase_dict("MountingImage", 100));
                codes::SUCCESS
            }
            Err(code) => code,
        }
    }
}
