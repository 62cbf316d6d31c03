use mobiledevice_kit::loopback::{LoopbackDevice, LoopbackTransport};
use mobiledevice_kit::prelude::*;
use mobiledevice_kit::{DeviceTransport, DEVICE_NAME_KEY};
use std::fs;
use std::sync::Arc;

fn main() -> DeviceResult<()> {
    let transport = Arc::new(LoopbackTransport::new());
    for (index, udid) in [
        "00008110-000A3C543C80801E",
        "00008027-001E30980C08002E",
        "00008030-000D4C902E90002E",
    ]
    .iter()
    .enumerate()
    {
        transport.attach(
            LoopbackDevice::new(udid)
                .with_developer_mode(true)
                .with_property(DEVICE_NAME_KEY, format!("测试机 {}", index + 1)),
        );
    }

    let manager = DeviceManager::new(transport as Arc<dyn DeviceTransport>, None);
    let devices = manager.list_devices()?;
    println!("对 {} 个设备并行操作", devices.len());

    // 并行读取设备名称
    let names = manager.parallel_get_value(&devices, None, DEVICE_NAME_KEY);
    for (udid, result) in &names {
        match result {
            Ok(name) => println!("  {} -> {}", udid, name),
            Err(e) => println!("  {} -> 查询失败: {}", udid, e),
        }
    }

    // 组装演示应用包并并行安装
    let root = std::env::temp_dir().join("mobiledevice-kit-parallel-demo");
    let bundle = root.join("Demo.app");
    fs::create_dir_all(&bundle)?;
    fs::write(bundle.join("Info.plist"), b"<plist/>")?;

    let results = manager.parallel_install(&devices, &bundle, None, None);
    let succeeded = results.values().filter(|result| result.is_ok()).count();
    println!("并行安装完成: {}/{} 成功", succeeded, results.len());

    for (udid, result) in &results {
        if let Err(e) = result {
            println!("  {} 安装失败: {}", udid, e);
        }
    }

    fs::remove_dir_all(&root)?;
    Ok(())
}
