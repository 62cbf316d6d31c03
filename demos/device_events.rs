use mobiledevice_kit::loopback::{LoopbackDevice, LoopbackTransport};
use mobiledevice_kit::prelude::*;
use mobiledevice_kit::DeviceTransport;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> DeviceResult<()> {
    let transport = Arc::new(LoopbackTransport::new());
    let manager = DeviceManager::new(Arc::clone(&transport) as Arc<dyn DeviceTransport>, None);

    // 订阅设备事件，回调捕获需要的上下文
    let subscription = manager.subscribe(InterfaceType::Any, |event| match event {
        DeviceEvent::Connected(device) => println!("[事件] 接入: {}", device),
        DeviceEvent::Disconnected(udid) => println!("[事件] 移除: {}", udid),
        DeviceEvent::Unsubscribed => println!("[事件] 订阅已终止"),
    })?;

    // 发现会话维护一份随事件更新的设备列表
    let session = DiscoverySession::new(&manager)?;

    println!("模拟设备接入与移除...");
    transport.attach(LoopbackDevice::new("00008110-000A3C543C80801E"));
    transport.attach(
        LoopbackDevice::new("00008027-001E30980C08002E").with_interface_type(InterfaceType::Wireless),
    );
    thread::sleep(Duration::from_millis(300));

    println!("当前接入 {} 个设备", session.devices().len());

    transport.detach("00008110-000A3C543C80801E");
    thread::sleep(Duration::from_millis(300));

    for device in session.devices() {
        println!("仍然接入: {}", device.udid);
    }

    session.close()?;

    // 取消订阅会消耗订阅句柄，终止事件只投递一次
    manager.unsubscribe(subscription)?;

    Ok(())
}
