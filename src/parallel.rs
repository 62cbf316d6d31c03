use log::{debug, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;

use crate::device::{Device, DeviceManager, InterfaceType};
use crate::error::{DeviceError, DeviceResult};
use crate::install::{InstallOptions, TransferOptions};
use crate::transport::PropertyValue;

impl DeviceManager {
    /// 在多个设备上并行执行一站式安装
    ///
    /// # 参数
    ///
    /// * `devices` - 目标设备列表
    /// * `bundle_path` - 应用包路径
    ///
    /// # 返回值
    ///
    /// 返回一个 HashMap，键为设备 UDID，值为安装结果
    pub fn parallel_install(
        &self,
        devices: &[Device],
        bundle_path: &Path,
        transfer_options: Option<TransferOptions>,
        install_options: Option<InstallOptions>,
    ) -> HashMap<String, DeviceResult<()>> {
        devices
            .par_iter() // 使用 rayon 的并行迭代器
            .map(|device| {
                (
                    device.udid.clone(),
                    self.transfer_and_install(
                        device.handle,
                        bundle_path,
                        transfer_options.clone(),
                        install_options.clone(),
                        |_| {},
                        |_| {},
                    ),
                )
            })
            .collect()
    }

    /// 在多个设备上并行读取同一属性
    ///
    /// # 参数
    ///
    /// * `devices` - 目标设备列表
    /// * `domain` - 可选的属性域
    /// * `key` - 属性键
    ///
    /// # 返回值
    ///
    /// 返回一个 HashMap，键为设备 UDID，值为属性查询结果
    pub fn parallel_get_value(
        &self,
        devices: &[Device],
        domain: Option<&str>,
        key: &str,
    ) -> HashMap<String, DeviceResult<PropertyValue>> {
        devices
            .par_iter()
            .map(|device| {
                (
                    device.udid.clone(),
                    self.get_value(device.handle, domain, key),
                )
            })
            .collect()
    }

    /// 筛选出经指定接口接入的设备
    pub fn filter_by_interface(&self, interface: InterfaceType) -> DeviceResult<Vec<Device>> {
        let devices = self.list_devices()?;
        let filtered: Vec<Device> = devices
            .into_iter()
            .filter(|device| interface.matches(device.interface_type))
            .collect();

        debug!("接口 {} 下有 {} 个设备", interface, filtered.len());
        Ok(filtered)
    }

    /// 在当前接入的所有设备上并行执行操作
    ///
    /// # 参数
    ///
    /// * `operation` - 要执行的操作闭包
    ///
    /// # 返回值
    ///
    /// 返回每个设备的操作结果
    pub fn on_each_device<F, T>(&self, operation: F) -> DeviceResult<HashMap<String, DeviceResult<T>>>
    where
        F: Fn(&Device) -> DeviceResult<T> + Send + Sync,
        T: Send,
    {
        let devices = self.list_devices()?;

        if devices.is_empty() {
            return Err(DeviceError::DeviceUnavailableError(
                "没有接入的设备".to_string(),
            ));
        }

        let results = devices
            .par_iter()
            .map(|device| {
                let result = operation(device);
                if let Err(e) = &result {
                    warn!("设备 {} 上的操作失败: {}", device.udid, e);
                }
                (device.udid.clone(), result)
            })
            .collect();

        Ok(results)
    }
}
