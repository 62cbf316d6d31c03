use log::{debug, info, trace};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::{Device, DeviceManager, InterfaceType};
use crate::error::{DeviceError, DeviceResult};
use crate::registry::{read_device, Registry};
use crate::transport::{DeviceTransport, TransportEvent};

/// 设备连接状态变化事件
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// 设备已接入系统
    Connected(Device),
    /// 指定标识的设备已从系统移除
    Disconnected(String),
    /// 订阅终止，这是订阅收到的最后一个事件
    Unsubscribed,
}

type Callback = Arc<dyn Fn(&DeviceEvent) + Send + Sync + 'static>;

/// 订阅句柄
///
/// 取消订阅时移交所有权，同一订阅无法被取消两次。
#[derive(Debug)]
pub struct Subscription {
    pub(crate) id: u64,
}

struct SubscriberEntry {
    filter: InterfaceType,
    callback: Callback,
    // 投递锁，兼作终止标记：Unsubscribed 之后不再有任何事件
    delivery: Arc<Mutex<bool>>,
}

struct PumpHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// 通知中心
///
/// 事件由单一泵线程投递。泵线程在第一个订阅创建时启动，
/// 最后一个订阅移除时停止，没有进程级的全局状态。
pub(crate) struct NotificationHub {
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<Mutex<Registry>>,
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
    pump: Mutex<Option<PumpHandle>>,
}

impl NotificationHub {
    pub(crate) fn new(transport: Arc<dyn DeviceTransport>, registry: Arc<Mutex<Registry>>) -> Self {
        Self {
            transport,
            registry,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pump: Mutex::new(None),
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<u64, SubscriberEntry>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn subscribe(
        hub: &Arc<Self>,
        filter: InterfaceType,
        callback: Callback,
    ) -> DeviceResult<u64> {
        Self::ensure_pump(hub)?;

        let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
        hub.lock_subscribers().insert(
            id,
            SubscriberEntry {
                filter,
                callback,
                delivery: Arc::new(Mutex::new(false)),
            },
        );

        Ok(id)
    }

    /// 取消订阅并投递终止事件，返回订阅此前是否仍然存在
    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        let entry = self.lock_subscribers().remove(&id);
        let Some(entry) = entry else {
            return false;
        };

        terminate(&entry);

        if self.lock_subscribers().is_empty() {
            self.stop_pump();
        }

        true
    }

    fn ensure_pump(hub: &Arc<Self>) -> DeviceResult<()> {
        let mut pump = hub.pump.lock().unwrap_or_else(|e| e.into_inner());
        if pump.is_some() {
            return Ok(());
        }

        // 先拿事件接收端再做快照，避免错过启动窗口内的事件
        let rx = hub.transport.subscribe_events();
        let connected: HashSet<String> = hub
            .transport
            .scan_devices()
            .into_iter()
            .map(|record| record.udid)
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let weak = Arc::downgrade(hub);

        let thread = thread::Builder::new()
            .name("device-notify".to_string())
            .spawn(move || pump_loop(weak, rx, stop_flag, connected))
            .map_err(|e| DeviceError::ConfigError(format!("无法启动通知线程: {}", e)))?;

        debug!("通知泵线程已启动");
        *pump = Some(PumpHandle { stop, thread });
        Ok(())
    }

    fn stop_pump(&self) {
        let handle = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(PumpHandle { stop, thread }) = handle {
            stop.store(true, Ordering::Relaxed);
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
            debug!("通知泵线程已停止");
        }
    }

    fn dispatch(&self, event: TransportEvent, connected: &mut HashSet<String>) {
        match event {
            TransportEvent::Attached(record) => {
                if !connected.insert(record.udid.clone()) {
                    trace!("忽略设备 {} 的重复接入事件", record.udid);
                    return;
                }

                let (handle, state) = {
                    let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
                    let handle = registry.upsert(record.clone());
                    let state = match registry.resolve(handle) {
                        Ok(entry) => entry.state,
                        Err(_) => return,
                    };
                    (handle, state)
                };

                let device = read_device(self.transport.as_ref(), handle, &record, state);
                info!("设备 {} 已接入 ({})", record.udid, record.interface_type);
                self.deliver(&DeviceEvent::Connected(device), record.interface_type);
            }
            TransportEvent::Detached { udid } => {
                if !connected.remove(&udid) {
                    trace!("忽略设备 {} 的重复移除事件", udid);
                    return;
                }

                let interface = {
                    let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
                    let interface = registry
                        .handle_of(&udid)
                        .and_then(|handle| registry.resolve(handle).ok())
                        .map(|entry| entry.record.interface_type);
                    registry.vacate(&udid);
                    interface
                };

                info!("设备 {} 已移除", udid);
                self.deliver(
                    &DeviceEvent::Disconnected(udid),
                    interface.unwrap_or(InterfaceType::Any),
                );
            }
        }
    }

    fn deliver(&self, event: &DeviceEvent, interface: InterfaceType) {
        let targets: Vec<(Callback, Arc<Mutex<bool>>)> = self
            .lock_subscribers()
            .values()
            .filter(|entry| entry.filter.matches(interface))
            .map(|entry| (Arc::clone(&entry.callback), Arc::clone(&entry.delivery)))
            .collect();

        for (callback, delivery) in targets {
            let terminated = delivery.lock().unwrap_or_else(|e| e.into_inner());
            if !*terminated {
                callback(event);
            }
        }
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        let entries: Vec<SubscriberEntry> = self
            .lock_subscribers()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in &entries {
            terminate(entry);
        }

        self.stop_pump();
    }
}

fn terminate(entry: &SubscriberEntry) {
    let mut terminated = entry.delivery.lock().unwrap_or_else(|e| e.into_inner());
    if !*terminated {
        *terminated = true;
        (entry.callback)(&DeviceEvent::Unsubscribed);
    }
}

fn pump_loop(
    hub: Weak<NotificationHub>,
    rx: Receiver<TransportEvent>,
    stop: Arc<AtomicBool>,
    mut connected: HashSet<String>,
) {
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let Some(hub) = hub.upgrade() else { break };
                hub.dispatch(event, &mut connected);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("传输层事件源已关闭，通知线程退出");
                break;
            }
        }
    }
}

impl DeviceManager {
    /// 订阅设备接入/移除事件
    ///
    /// 回调带类型捕获上下文，按接口类型过滤。同一设备的事件
    /// 保证接入/移除交替出现；不同设备之间没有先后保证。
    pub fn subscribe<F>(&self, filter: InterfaceType, callback: F) -> DeviceResult<Subscription>
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let id = NotificationHub::subscribe(&self.hub, filter, Arc::new(callback))?;
        info!("已创建设备事件订阅 #{} (过滤: {})", id, filter);
        Ok(Subscription { id })
    }

    /// 取消订阅
    ///
    /// 订阅收到一次 `Unsubscribed` 终止事件。订阅句柄在此被消耗，
    /// 重复取消无法表达。
    pub fn unsubscribe(&self, subscription: Subscription) -> DeviceResult<()> {
        if self.hub.unsubscribe(subscription.id) {
            info!("已取消订阅 #{}", subscription.id);
        } else {
            debug!("订阅 #{} 已随通知中心终止", subscription.id);
        }
        Ok(())
    }
}

/// 设备发现会话
///
/// 订阅事件并维护一份当前接入设备的列表，随接入/移除自动更新。
pub struct DiscoverySession {
    manager: DeviceManager,
    devices: Arc<Mutex<Vec<Device>>>,
    subscription: Option<Subscription>,
}

impl DiscoverySession {
    /// 创建发现会话并以当前设备列表作为初始内容
    pub fn new(manager: &DeviceManager) -> DeviceResult<Self> {
        let devices = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&devices);

        let subscription = manager.subscribe(InterfaceType::Any, move |event| {
            let mut list = shared.lock().unwrap_or_else(|e| e.into_inner());
            match event {
                DeviceEvent::Connected(device) => {
                    if !list.iter().any(|d: &Device| d.udid == device.udid) {
                        list.push(device.clone());
                    }
                }
                DeviceEvent::Disconnected(udid) => {
                    list.retain(|d| d.udid != *udid);
                }
                DeviceEvent::Unsubscribed => {}
            }
        })?;

        // 订阅就绪后再填充初始列表，期间接入的设备由回调补上
        {
            let initial = manager.list_devices()?;
            let mut list = devices.lock().unwrap_or_else(|e| e.into_inner());
            for device in initial {
                if !list.iter().any(|d: &Device| d.udid == device.udid) {
                    list.push(device);
                }
            }
        }

        Ok(Self {
            manager: manager.clone(),
            devices,
            subscription: Some(subscription),
        })
    }

    /// 当前接入设备列表的副本
    ///
    /// 设备随时可能移除，不要长期缓存返回值。
    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 结束发现会话
    pub fn close(mut self) -> DeviceResult<()> {
        match self.subscription.take() {
            Some(subscription) => self.manager.unsubscribe(subscription),
            None => Ok(()),
        }
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            let _ = self.manager.unsubscribe(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevice, LoopbackTransport};
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn manager() -> (DeviceManager, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let manager = DeviceManager::new(
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            None,
        );
        (manager, transport)
    }

    fn record_events(manager: &DeviceManager, filter: InterfaceType) -> (Subscription, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = manager
            .subscribe(filter, move |event| {
                let entry = match event {
                    DeviceEvent::Connected(device) => format!("connected:{}", device.udid),
                    DeviceEvent::Disconnected(udid) => format!("disconnected:{}", udid),
                    DeviceEvent::Unsubscribed => "unsubscribed".to_string(),
                };
                sink.lock().unwrap().push(entry);
            })
            .unwrap();
        (subscription, events)
    }

    #[test]
    fn connect_disconnect_events_are_delivered() {
        let (manager, transport) = manager();
        let (subscription, events) = record_events(&manager, InterfaceType::Any);

        transport.attach(LoopbackDevice::new("udid-1"));
        assert!(wait_for(|| events.lock().unwrap().len() == 1, 2000));

        transport.detach("udid-1");
        assert!(wait_for(|| events.lock().unwrap().len() == 2, 2000));

        manager.unsubscribe(subscription).unwrap();

        let log = events.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "connected:udid-1".to_string(),
                "disconnected:udid-1".to_string(),
                "unsubscribed".to_string(),
            ]
        );
    }

    #[test]
    fn duplicate_attach_is_suppressed() {
        let (manager, transport) = manager();
        let (subscription, events) = record_events(&manager, InterfaceType::Any);

        transport.attach(LoopbackDevice::new("udid-1"));
        assert!(wait_for(|| events.lock().unwrap().len() == 1, 2000));

        // 同一设备的第二个接入事件不构成状态变化
        transport.attach(LoopbackDevice::new("udid-1"));
        transport.detach("udid-1");
        assert!(wait_for(|| events.lock().unwrap().len() == 2, 2000));

        manager.unsubscribe(subscription).unwrap();

        let log = events.lock().unwrap().clone();
        assert_eq!(log[0], "connected:udid-1");
        assert_eq!(log[1], "disconnected:udid-1");
        assert_eq!(log[2], "unsubscribed");
    }

    #[test]
    fn interface_filter_limits_delivery() {
        let (manager, transport) = manager();
        let (subscription, events) = record_events(&manager, InterfaceType::Wired);

        transport.attach(
            LoopbackDevice::new("wifi-1").with_interface_type(InterfaceType::Wireless),
        );
        transport.attach(LoopbackDevice::new("usb-1"));
        assert!(wait_for(|| !events.lock().unwrap().is_empty(), 2000));

        manager.unsubscribe(subscription).unwrap();

        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["connected:usb-1".to_string(), "unsubscribed".to_string()]);
    }

    #[test]
    fn unsubscribed_is_terminal_and_unique() {
        let (manager, transport) = manager();
        let (subscription, events) = record_events(&manager, InterfaceType::Any);

        manager.unsubscribe(subscription).unwrap();

        // 取消之后的设备变化不再投递
        transport.attach(LoopbackDevice::new("udid-1"));
        thread::sleep(Duration::from_millis(100));

        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["unsubscribed".to_string()]);
    }

    #[test]
    fn hub_teardown_delivers_unsubscribed() {
        let (manager, _transport) = manager();
        let (_subscription, events) = record_events(&manager, InterfaceType::Any);

        drop(manager);

        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["unsubscribed".to_string()]);
    }

    #[test]
    fn discovery_session_tracks_devices() {
        let (manager, transport) = manager();
        transport.attach(LoopbackDevice::new("udid-1"));

        let session = DiscoverySession::new(&manager).unwrap();
        assert!(wait_for(
            || session.devices().iter().any(|d| d.udid == "udid-1"),
            2000
        ));

        transport.attach(LoopbackDevice::new("udid-2"));
        assert!(wait_for(|| session.devices().len() == 2, 2000));

        transport.detach("udid-1");
        assert!(wait_for(
            || {
                let devices = session.devices();
                devices.len() == 1 && devices[0].udid == "udid-2"
            },
            2000
        ));

        session.close().unwrap();
    }
}
