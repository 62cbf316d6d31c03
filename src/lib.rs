mod config;
mod device;
mod error;
mod registry;
mod session;

// 功能模块
pub mod install;
pub mod loopback;
pub mod mount;
pub mod notify;
pub mod parallel;
pub mod status;
pub mod transport;
pub mod utils;

// 导出主要类型
pub use config::{DeviceConfig, DeviceConfigBuilder};
pub use device::{ConnectionState, Device, DeviceManager, InterfaceType};
pub use device::{
    BUILD_VERSION_KEY, DEVICE_CLASS_KEY, DEVICE_NAME_KEY, DEVICE_TYPE_KEY, HARDWARE_MODEL_KEY,
    PRODUCT_TYPE_KEY, PRODUCT_VERSION_KEY,
};
pub use error::{codes, error_text, DeviceError, DeviceResult, ErrorCode};
pub use install::{InstallOptions, PackageType, TransferOptions, PACKAGE_TYPE_KEY};
pub use notify::{DeviceEvent, DiscoverySession, Subscription};
pub use registry::DeviceHandle;
pub use session::{ServiceConnection, AFC_SERVICE_NAME, MOBILE_IMAGE_MOUNTER_SERVICE_NAME};
pub use status::{
    FileCopyProgress, InstallPhase, InstallStatus, MountPhase, MountStatus, StatusDict,
    TransferPhase, TransferStatus,
};
pub use transport::{DeviceRecord, DeviceTransport, PropertyValue, TransportEvent};

// 便利的预导出模块
pub mod prelude {
    pub use super::install::{InstallOptions, PackageType, TransferOptions};
    pub use super::notify::{DeviceEvent, DiscoverySession, Subscription};
    pub use super::status::{InstallStatus, MountStatus, TransferStatus};
    pub use super::{
        Device, DeviceConfig, DeviceConfigBuilder, DeviceError, DeviceHandle, DeviceManager,
        DeviceResult, InterfaceType,
    };
}
