use mobiledevice_kit::loopback::{LoopbackDevice, LoopbackTransport};
use mobiledevice_kit::prelude::*;
use mobiledevice_kit::utils::format_size;
use mobiledevice_kit::{DeviceTransport, TransferPhase};
use std::fs;
use std::sync::Arc;

fn main() -> DeviceResult<()> {
    // 在临时目录里组装一个演示用应用包
    let root = std::env::temp_dir().join("mobiledevice-kit-demo");
    let bundle = root.join("Demo.app");
    fs::create_dir_all(bundle.join("Frameworks"))?;
    fs::write(bundle.join("Info.plist"), b"<plist/>")?;
    fs::write(bundle.join("demo-binary"), vec![0u8; 300_000])?;
    fs::write(bundle.join("Frameworks/libdemo.dylib"), vec![0u8; 80_000])?;

    let transport = Arc::new(LoopbackTransport::new());
    transport.attach(
        LoopbackDevice::new("00008110-000A3C543C80801E").with_developer_mode(true),
    );
    transport.attach(LoopbackDevice::new("00008027-001E30980C08002E"));

    let manager = DeviceManager::new(transport as Arc<dyn DeviceTransport>, None);
    let devices = manager.list_devices()?;

    // 完整的显式生命周期：连接 -> 配对校验 -> 会话 -> 传输 -> 安装
    let device = &devices[0];
    println!("向 {} 安装应用...", device.udid);

    manager.connect(device.handle)?;
    manager.validate_pairing(device.handle)?;
    manager.start_session(device.handle)?;

    let staged = manager.transfer_bundle(None, device.handle, &bundle, None, |status| {
        if let TransferPhase::CopyingFile(progress) = &status.phase {
            println!(
                "  传输 {}% ({}/{})",
                status.percent_complete,
                format_size(progress.copied_bytes),
                format_size(progress.total_bytes)
            );
        }
    })?;
    println!("  应用包已暂存到 {}", staged);

    manager.install_application(None, device.handle, &staged, None, |status| {
        println!("  安装 {}%: {}", status.percent_complete, status.phase);
    })?;

    manager.stop_session(device.handle)?;
    manager.disconnect(device.handle)?;
    println!("安装完成");

    // 未启用开发者模式的设备拒绝 Developer 包，错误码与成功值可区分
    let locked = &devices[1];
    println!("\n向未启用开发者模式的 {} 安装...", locked.udid);
    match manager.transfer_and_install(locked.handle, &bundle, None, None, |_| {}, |_| {}) {
        Ok(()) => println!("  意外成功"),
        Err(e) => println!("  如期失败 (码 0x{:08X}): {}", e.code(), e),
    }

    fs::remove_dir_all(&root)?;
    Ok(())
}
