use mobiledevice_kit::loopback::{LoopbackDevice, LoopbackTransport};
use mobiledevice_kit::prelude::*;
use mobiledevice_kit::{DeviceTransport, DEVICE_NAME_KEY};
use std::sync::Arc;

fn main() -> DeviceResult<()> {
    // 示例使用回环传输模拟两台设备，接入真实框架时替换传输实现即可
    let transport = Arc::new(LoopbackTransport::new());
    transport.attach(
        LoopbackDevice::new("00008110-000A3C543C80801E")
            .with_property(DEVICE_NAME_KEY, "开发 iPhone")
            .with_property("ProductType", "iPhone14,2")
            .with_property("ProductVersion", "16.1.2")
            .with_property("DeviceClass", "iPhone")
            .with_developer_mode(true),
    );
    transport.attach(
        LoopbackDevice::new("00008027-001E30980C08002E")
            .with_interface_type(InterfaceType::Wireless)
            .with_property(DEVICE_NAME_KEY, "测试 iPad")
            .with_property("ProductType", "iPad8,1")
            .with_property("ProductVersion", "17.0"),
    );

    // 创建配置
    let config = DeviceConfig::default();

    // 创建设备管理器实例
    let manager = DeviceManager::new(transport as Arc<dyn DeviceTransport>, Some(config));

    // 枚举当前接入的设备
    let devices = manager.list_devices()?;
    println!("发现 {} 个设备:", devices.len());

    for device in &devices {
        println!("  {}", device);

        // 按键读取属性
        let name = manager.get_value(device.handle, None, DEVICE_NAME_KEY)?;
        println!("    设备名称: {}", name);

        // 属性不存在时返回 NotFoundError 而不是空值
        match manager.get_value(device.handle, None, "NoSuchKey") {
            Ok(value) => println!("    意外的值: {}", value),
            Err(e) => println!("    缺失的键如期报错: {}", e),
        }

        // 接口类型是纯访问器
        let interface = manager.get_interface_type(device.handle)?;
        println!("    接口类型: {}", interface);

        // 开发者模式：先看错误码，再信布尔值
        match manager.get_developer_mode_status(device.handle) {
            Ok(enabled) => println!("    开发者模式: {}", if enabled { "已启用" } else { "未启用" }),
            Err(e) => println!("    开发者模式查询失败: {}", e),
        }

        if let Some((major, minor, patch)) = device.product_version_components() {
            println!("    系统版本: {}.{}.{}", major, minor, patch);
        }
    }

    Ok(())
}
