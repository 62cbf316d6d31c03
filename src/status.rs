use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::transport::PropertyValue;

/// 设备侧引擎上报的原始状态字典
pub type StatusDict = HashMap<String, PropertyValue>;

// 状态字典中的键
pub const STATUS_KEY: &str = "Status";
pub const PERCENT_COMPLETE_KEY: &str = "PercentComplete";
pub const TOTAL_FILES_KEY: &str = "TotalFiles";
pub const TOTAL_BYTES_KEY: &str = "TotalBytes";
pub const NUM_FILES_KEY: &str = "NumFiles";
pub const NUM_BYTES_KEY: &str = "NumBytes";
pub const PATH_KEY: &str = "Path";
pub const ERROR_KEY: &str = "Error";
pub const ERROR_DESCRIPTION_KEY: &str = "ErrorDescription";

/// 文件复制阶段的进度
#[derive(Debug, Clone, Serialize)]
pub struct FileCopyProgress {
    /// 待复制的文件总数
    pub total_files: u64,
    /// 待复制的字节总数
    pub total_bytes: u64,
    /// 已复制的文件数
    pub copied_files: u64,
    /// 已复制的字节数
    pub copied_bytes: u64,
    /// 当前正在复制的文件
    pub current_path: PathBuf,
}

impl FileCopyProgress {
    fn from_dict(dict: &StatusDict) -> Option<Self> {
        Some(Self {
            total_files: read_u64(dict, TOTAL_FILES_KEY)?,
            total_bytes: read_u64(dict, TOTAL_BYTES_KEY)?,
            copied_files: read_u64(dict, NUM_FILES_KEY)?,
            copied_bytes: read_u64(dict, NUM_BYTES_KEY)?,
            current_path: PathBuf::from(dict.get(PATH_KEY)?.as_str()?),
        })
    }
}

/// 应用包传输操作的阶段
#[derive(Debug, Clone, Serialize)]
pub enum TransferPhase {
    /// 传输前的预检
    PreflightingTransfer,
    /// 正在传输软件包
    TransferringPackage,
    /// 正在逐个复制文件
    CopyingFile(FileCopyProgress),
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPhase::PreflightingTransfer => write!(f, "传输预检"),
            TransferPhase::TransferringPackage => write!(f, "传输软件包"),
            TransferPhase::CopyingFile(progress) => {
                write!(f, "复制文件 {}", progress.current_path.display())
            }
        }
    }
}

/// 应用包传输操作的当前状态
#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    /// 0 到 100 的完成百分比
    pub percent_complete: i32,
    /// 当前阶段
    pub phase: TransferPhase,
}

impl TransferStatus {
    /// 由原始状态字典解析，无法识别的状态返回 None
    pub fn from_dict(dict: &StatusDict) -> Option<Self> {
        let status = dict.get(STATUS_KEY)?.as_str()?;
        let percent = dict.get(PERCENT_COMPLETE_KEY)?.as_i64()? as i32;

        let phase = match status {
            "PreflightingTransfer" => TransferPhase::PreflightingTransfer,
            "TransferringPackage" => TransferPhase::TransferringPackage,
            "CopyingFile" => TransferPhase::CopyingFile(FileCopyProgress::from_dict(dict)?),
            _ => return None,
        };

        Some(Self {
            percent_complete: percent,
            phase,
        })
    }
}

/// 应用安装操作的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstallPhase {
    CreatingStagingDirectory,
    ExtractingPackage,
    InspectingPackage,
    PreflightingApplication,
    VerifyingApplication,
    CreatingContainer,
    InstallingApplication,
    PostflightingApplication,
    SandboxingApplication,
    GeneratingApplicationMap,
    InstallComplete,
}

impl InstallPhase {
    /// 状态字典中使用的状态字符串
    pub fn as_status_str(&self) -> &'static str {
        match self {
            InstallPhase::CreatingStagingDirectory => "CreatingStagingDirectory",
            InstallPhase::ExtractingPackage => "ExtractingPackage",
            InstallPhase::InspectingPackage => "InspectingPackage",
            InstallPhase::PreflightingApplication => "PreflightingApplication",
            InstallPhase::VerifyingApplication => "VerifyingApplication",
            InstallPhase::CreatingContainer => "CreatingContainer",
            InstallPhase::InstallingApplication => "InstallingApplication",
            InstallPhase::PostflightingApplication => "PostflightingApplication",
            InstallPhase::SandboxingApplication => "SandboxingApplication",
            InstallPhase::GeneratingApplicationMap => "GeneratingApplicationMap",
            InstallPhase::InstallComplete => "InstallComplete",
        }
    }

    pub fn from_status_str(status: &str) -> Option<Self> {
        let phase = match status {
            "CreatingStagingDirectory" => InstallPhase::CreatingStagingDirectory,
            "ExtractingPackage" => InstallPhase::ExtractingPackage,
            "InspectingPackage" => InstallPhase::InspectingPackage,
            "PreflightingApplication" => InstallPhase::PreflightingApplication,
            "VerifyingApplication" => InstallPhase::VerifyingApplication,
            "CreatingContainer" => InstallPhase::CreatingContainer,
            "InstallingApplication" => InstallPhase::InstallingApplication,
            "PostflightingApplication" => InstallPhase::PostflightingApplication,
            "SandboxingApplication" => InstallPhase::SandboxingApplication,
            "GeneratingApplicationMap" => InstallPhase::GeneratingApplicationMap,
            "InstallComplete" => InstallPhase::InstallComplete,
            _ => return None,
        };

        Some(phase)
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InstallPhase::CreatingStagingDirectory => "创建暂存目录",
            InstallPhase::ExtractingPackage => "解压软件包",
            InstallPhase::InspectingPackage => "检查软件包",
            InstallPhase::PreflightingApplication => "应用预检",
            InstallPhase::VerifyingApplication => "校验应用",
            InstallPhase::CreatingContainer => "创建容器",
            InstallPhase::InstallingApplication => "安装应用",
            InstallPhase::PostflightingApplication => "安装后检查",
            InstallPhase::SandboxingApplication => "配置沙盒",
            InstallPhase::GeneratingApplicationMap => "生成应用映射",
            InstallPhase::InstallComplete => "安装完成",
        };
        write!(f, "{}", text)
    }
}

/// 应用安装操作的当前状态
#[derive(Debug, Clone, Serialize)]
pub struct InstallStatus {
    /// 0 到 100 的完成百分比
    pub percent_complete: i32,
    /// 当前阶段
    pub phase: InstallPhase,
}

impl InstallStatus {
    /// 由原始状态字典解析，无法识别的状态返回 None
    pub fn from_dict(dict: &StatusDict) -> Option<Self> {
        let status = dict.get(STATUS_KEY)?.as_str()?;
        let percent = dict.get(PERCENT_COMPLETE_KEY)?.as_i64()? as i32;
        let phase = InstallPhase::from_status_str(status)?;

        Some(Self {
            percent_complete: percent,
            phase,
        })
    }
}

/// 磁盘镜像挂载操作的阶段
#[derive(Debug, Clone, Serialize)]
pub enum MountPhase {
    /// 正在读取镜像
    LookingUpImage,
    /// 正在向设备流式传输镜像
    StreamingImage,
    /// 正在逐个复制文件
    CopyingFile(FileCopyProgress),
    /// 正在设备上挂载镜像
    MountingImage,
}

impl fmt::Display for MountPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountPhase::LookingUpImage => write!(f, "读取镜像"),
            MountPhase::StreamingImage => write!(f, "流式传输镜像"),
            MountPhase::CopyingFile(progress) => {
                write!(f, "复制文件 {}", progress.current_path.display())
            }
            MountPhase::MountingImage => write!(f, "挂载镜像"),
        }
    }
}

/// 磁盘镜像挂载操作的当前状态
#[derive(Debug, Clone, Serialize)]
pub struct MountStatus {
    /// 0 到 100 的完成百分比
    pub percent_complete: i32,
    /// 当前阶段
    pub phase: MountPhase,
}

impl MountStatus {
    /// 由原始状态字典解析，无法识别的状态返回 None
    ///
    /// 挂载引擎只在复制阶段上报百分比，其余阶段按固定值折算：
    /// 读取 0%、流式 1%、挂载 100%。
    pub fn from_dict(dict: &StatusDict) -> Option<Self> {
        let status = dict.get(STATUS_KEY)?.as_str()?;

        let phase = match status {
            "LookingUpImage" => MountPhase::LookingUpImage,
            "StreamingImage" => MountPhase::StreamingImage,
            "CopyingFile" => MountPhase::CopyingFile(FileCopyProgress::from_dict(dict)?),
            "MountingImage" => MountPhase::MountingImage,
            _ => return None,
        };

        let percent = match &phase {
            MountPhase::LookingUpImage => 0,
            MountPhase::StreamingImage => 1,
            MountPhase::CopyingFile(_) => dict
                .get(PERCENT_COMPLETE_KEY)
                .and_then(PropertyValue::as_i64)
                .unwrap_or(0) as i32,
            MountPhase::MountingImage => 100,
        };

        Some(Self {
            percent_complete: percent,
            phase,
        })
    }
}

/// 检查状态字典是否携带错误信号，返回错误描述
pub fn dict_error(dict: &StatusDict) -> Option<String> {
    if let Some(description) = dict.get(ERROR_DESCRIPTION_KEY) {
        return Some(description.to_string());
    }

    dict.get(ERROR_KEY).map(|value| value.to_string())
}

fn read_u64(dict: &StatusDict, key: &str) -> Option<u64> {
    u64::try_from(dict.get(key)?.as_i64()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, PropertyValue)]) -> StatusDict {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn parses_transfer_copying_file() {
        let dict = dict(&[
            (STATUS_KEY, "CopyingFile".into()),
            (PERCENT_COMPLETE_KEY, 42i64.into()),
            (TOTAL_FILES_KEY, 10i64.into()),
            (TOTAL_BYTES_KEY, 1000i64.into()),
            (NUM_FILES_KEY, 4i64.into()),
            (NUM_BYTES_KEY, 420i64.into()),
            (PATH_KEY, "Payload/App.app/Info.plist".into()),
        ]);

        let status = TransferStatus::from_dict(&dict).unwrap();
        assert_eq!(status.percent_complete, 42);
        match status.phase {
            TransferPhase::CopyingFile(progress) => {
                assert_eq!(progress.copied_bytes, 420);
                assert_eq!(progress.total_files, 10);
            }
            other => panic!("意外的阶段: {:?}", other),
        }
    }

    #[test]
    fn unknown_status_is_skipped() {
        let dict = dict(&[
            (STATUS_KEY, "SomethingNew".into()),
            (PERCENT_COMPLETE_KEY, 10i64.into()),
        ]);
        assert!(TransferStatus::from_dict(&dict).is_none());
        assert!(InstallStatus::from_dict(&dict).is_none());
    }

    #[test]
    fn missing_percent_is_rejected() {
        let dict = dict(&[(STATUS_KEY, "TransferringPackage".into())]);
        assert!(TransferStatus::from_dict(&dict).is_none());
    }

    #[test]
    fn install_phase_round_trip() {
        for status in [
            "CreatingStagingDirectory",
            "VerifyingApplication",
            "InstallComplete",
        ] {
            let phase = InstallPhase::from_status_str(status).unwrap();
            assert_eq!(phase.as_status_str(), status);
        }
        assert!(InstallPhase::from_status_str("NotAPhase").is_none());
    }

    #[test]
    fn mount_percent_mapping() {
        let looking = dict(&[(STATUS_KEY, "LookingUpImage".into())]);
        assert_eq!(
            MountStatus::from_dict(&looking).unwrap().percent_complete,
            0
        );

        let streaming = dict(&[(STATUS_KEY, "StreamingImage".into())]);
        assert_eq!(
            MountStatus::from_dict(&streaming).unwrap().percent_complete,
            1
        );

        let mounting = dict(&[(STATUS_KEY, "MountingImage".into())]);
        assert_eq!(
            MountStatus::from_dict(&mounting).unwrap().percent_complete,
            100
        );
    }

    #[test]
    fn error_signals_are_detected() {
        let plain = dict(&[
            (STATUS_KEY, "InstallingApplication".into()),
            (PERCENT_COMPLETE_KEY, 60i64.into()),
        ]);
        assert!(dict_error(&plain).is_none());

        let failed = dict(&[
            (ERROR_KEY, "ApplicationVerificationFailed".into()),
            (ERROR_DESCRIPTION_KEY, "签名校验失败".into()),
        ]);
        assert_eq!(dict_error(&failed).unwrap(), "签名校验失败");
    }
}
