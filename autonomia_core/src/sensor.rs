//! Heart-rate sensor bridge.
//!
//! The wireless connection lives on its own worker thread. The host only
//! ever talks to it through two bounded channels: commands in, timestamped
//! messages out. Every fault the worker sees is turned into a message; the
//! worker keeps reconnecting until it is halted.

use crate::config::SensorConfig;
use crate::heart_rate::{self, BATTERY_LEVEL, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

const COMMAND_CAPACITY: usize = 8;
const MESSAGE_CAPACITY: usize = 256;

/// Wireless link to one heart-rate sensor
pub trait HeartRateTransport: Send + 'static {
    fn connect(&mut self, address: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn start_notify(&mut self, characteristic: Uuid) -> Result<()>;

    fn stop_notify(&mut self, characteristic: Uuid) -> Result<()>;

    fn read_characteristic(&mut self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Wait up to `timeout` for the next notification payload
    fn next_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    fn disconnect(&mut self);
}

/// One advertisement seen while scanning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub service_ids: Vec<Uuid>,
}

pub trait DeviceScanner {
    /// Collect advertisements for `timeout`
    fn scan(&mut self, timeout: Duration) -> Result<Vec<Advertisement>>;
}

/// Heart-rate sensors in range, by address
pub fn scan(
    scanner: &mut dyn DeviceScanner,
    timeout: Duration,
) -> Result<BTreeMap<String, Option<String>>> {
    let mut devices: BTreeMap<String, Option<String>> = BTreeMap::new();

    for advertisement in scanner.scan(timeout)? {
        if !advertisement.service_ids.contains(&HEART_RATE_SERVICE) {
            continue;
        }
        let name = devices.entry(advertisement.address).or_insert(None);
        if name.is_none() {
            *name = advertisement.local_name;
        }
    }

    tracing::info!("Found {} heart-rate sensors", devices.len());
    Ok(devices)
}

/// Worker to host
#[derive(Clone, Debug, PartialEq)]
pub enum SensorEvent {
    Pulse { bpm: u32, rr_intervals: Vec<u16> },
    /// Percent
    Battery(u8),
    Status(String),
    /// Transport failure; the worker retries after a backoff
    Fatal(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SensorMessage {
    pub at: DateTime<Utc>,
    pub event: SensorEvent,
}

/// Host to worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorCommand {
    Halt,
}

/// Owned handle to a running sensor worker
pub struct SensorBridge {
    commands: SyncSender<SensorCommand>,
    messages: Receiver<SensorMessage>,
    worker: Option<JoinHandle<()>>,
}

impl SensorBridge {
    /// Spawn the worker for the sensor at `address`
    pub fn start<T: HeartRateTransport>(
        transport: T,
        address: &str,
        config: &SensorConfig,
    ) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::sync_channel(COMMAND_CAPACITY);
        let (message_tx, message_rx) = mpsc::sync_channel(MESSAGE_CAPACITY);

        let worker = SensorWorker {
            transport,
            address: address.to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            backoff: Duration::from_millis(config.reconnect_backoff_ms),
            commands: command_rx,
            messages: message_tx,
        };

        let handle = thread::Builder::new()
            .name("heart-rate-sensor".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::Worker(format!("failed to spawn sensor worker: {}", e)))?;

        tracing::info!("Sensor bridge started for {}", address);
        Ok(Self {
            commands: command_tx,
            messages: message_rx,
            worker: Some(handle),
        })
    }

    /// Everything the worker has sent since the last read; never blocks
    pub fn read(&self) -> Vec<SensorMessage> {
        self.messages.try_iter().collect()
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |worker| !worker.is_finished())
    }

    /// Halt the worker, wait for it, and hand back any unread messages
    pub fn stop(mut self) -> Result<Vec<SensorMessage>> {
        self.halt()?;
        Ok(self.read())
    }

    fn halt(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        // a worker that already exited has dropped its receiver
        let _ = self.commands.send(SensorCommand::Halt);
        worker
            .join()
            .map_err(|_| Error::Worker("sensor worker panicked".into()))?;
        tracing::info!("Sensor bridge stopped");
        Ok(())
    }
}

impl Drop for SensorBridge {
    fn drop(&mut self) {
        if let Err(e) = self.halt() {
            tracing::error!("Failed to stop sensor bridge: {}", e);
        }
    }
}

enum Link {
    /// Tear down and open a fresh connection
    Reconnect,
    /// Tear down, wait out the backoff, then reconnect
    Backoff,
    Halt(Stop),
}

/// Why the worker is exiting
enum Stop {
    /// The host sent `halt`
    Requested,
    /// The host dropped its end of the command channel
    Detached,
}

struct SensorWorker<T> {
    transport: T,
    address: String,
    poll_interval: Duration,
    backoff: Duration,
    commands: Receiver<SensorCommand>,
    messages: SyncSender<SensorMessage>,
}

impl<T: HeartRateTransport> SensorWorker<T> {
    fn run(mut self) {
        let stop = loop {
            if let Some(stop) = self.halt_requested() {
                break stop;
            }

            let link = match self.open() {
                Ok(()) => self.stream(),
                Err(e) => {
                    self.emit(SensorEvent::Fatal(e.to_string()));
                    Link::Backoff
                }
            };
            self.teardown();

            match link {
                Link::Halt(stop) => break stop,
                Link::Reconnect => {}
                Link::Backoff => {
                    if let Some(stop) = self.wait_for_halt(self.backoff) {
                        break stop;
                    }
                }
            }
        };

        let status = match stop {
            Stop::Requested => "halt requested by application",
            Stop::Detached => "command channel closed by application",
        };
        self.emit(SensorEvent::Status(status.into()));
    }

    fn open(&mut self) -> Result<()> {
        tracing::debug!("Connecting to heart-rate sensor {}", self.address);
        self.transport.connect(&self.address)?;
        self.transport.start_notify(HEART_RATE_MEASUREMENT)?;

        let battery = self.transport.read_characteristic(BATTERY_LEVEL)?;
        let level = heart_rate::decode_battery(&battery)?;
        tracing::info!("Heart-rate sensor connected, battery {}%", level);
        self.emit(SensorEvent::Battery(level));
        Ok(())
    }

    /// Connected state: forward pulses until something forces a reconnect
    fn stream(&mut self) -> Link {
        loop {
            if let Some(stop) = self.halt_requested() {
                return Link::Halt(stop);
            }

            if !self.transport.is_connected() {
                self.emit(SensorEvent::Status("reconnecting: connection lost".into()));
                return Link::Reconnect;
            }

            let packet = match self.transport.next_notification(self.poll_interval) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    self.emit(SensorEvent::Fatal(e.to_string()));
                    return Link::Backoff;
                }
            };

            match heart_rate::decode(&packet) {
                Ok(measurement) if measurement.has_rr_intervals() => {
                    self.emit(SensorEvent::Pulse {
                        bpm: measurement.bpm,
                        rr_intervals: measurement.rr_intervals.unwrap_or_default(),
                    });
                }
                Ok(_) => {
                    self.emit(SensorEvent::Status(
                        "reconnecting: missing rr_intervals".into(),
                    ));
                    return Link::Reconnect;
                }
                Err(e) => {
                    self.emit(SensorEvent::Status(format!("reconnecting: {}", e)));
                    return Link::Reconnect;
                }
            }
        }
    }

    fn teardown(&mut self) {
        if self.transport.is_connected() {
            if let Err(e) = self.transport.stop_notify(HEART_RATE_MEASUREMENT) {
                tracing::debug!("stop_notify failed during teardown: {}", e);
            }
        }
        self.transport.disconnect();
    }

    fn halt_requested(&self) -> Option<Stop> {
        match self.commands.try_recv() {
            Ok(SensorCommand::Halt) => Some(Stop::Requested),
            Err(TryRecvError::Disconnected) => Some(Stop::Detached),
            Err(TryRecvError::Empty) => None,
        }
    }

    fn wait_for_halt(&self, timeout: Duration) -> Option<Stop> {
        match self.commands.recv_timeout(timeout) {
            Ok(SensorCommand::Halt) => Some(Stop::Requested),
            Err(RecvTimeoutError::Disconnected) => Some(Stop::Detached),
            Err(RecvTimeoutError::Timeout) => None,
        }
    }

    fn emit(&self, event: SensorEvent) {
        match &event {
            SensorEvent::Fatal(text) => tracing::warn!("Sensor fault: {}", text),
            SensorEvent::Status(text) => tracing::info!("Sensor status: {}", text),
            _ => {}
        }

        let message = SensorMessage {
            at: Utc::now(),
            event,
        };
        match self.messages.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!("Sensor message queue full, dropping {:?}", message.event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[derive(Default)]
    struct FakeLink {
        connect_results: VecDeque<Result<()>>,
        notifications: VecDeque<Vec<u8>>,
        connected: bool,
        connects: u32,
        disconnects: u32,
        battery: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        link: Arc<Mutex<FakeLink>>,
    }

    impl FakeTransport {
        fn with(notifications: Vec<Vec<u8>>) -> Self {
            let transport = FakeTransport::default();
            {
                let mut link = transport.link.lock().unwrap();
                link.notifications = notifications.into();
                link.battery = vec![64];
            }
            transport
        }
    }

    impl HeartRateTransport for FakeTransport {
        fn connect(&mut self, _address: &str) -> Result<()> {
            let mut link = self.link.lock().unwrap();
            link.connects += 1;
            let result = link.connect_results.pop_front().unwrap_or(Ok(()));
            link.connected = result.is_ok();
            result
        }

        fn is_connected(&self) -> bool {
            self.link.lock().unwrap().connected
        }

        fn start_notify(&mut self, characteristic: Uuid) -> Result<()> {
            assert_eq!(characteristic, HEART_RATE_MEASUREMENT);
            Ok(())
        }

        fn stop_notify(&mut self, _characteristic: Uuid) -> Result<()> {
            Ok(())
        }

        fn read_characteristic(&mut self, characteristic: Uuid) -> Result<Vec<u8>> {
            assert_eq!(characteristic, BATTERY_LEVEL);
            Ok(self.link.lock().unwrap().battery.clone())
        }

        fn next_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
            let next = self.link.lock().unwrap().notifications.pop_front();
            if next.is_none() {
                thread::sleep(timeout);
            }
            Ok(next)
        }

        fn disconnect(&mut self) {
            let mut link = self.link.lock().unwrap();
            link.connected = false;
            link.disconnects += 1;
        }
    }

    fn fast_config() -> SensorConfig {
        SensorConfig {
            poll_interval_ms: 2,
            reconnect_backoff_ms: 5,
            ..SensorConfig::default()
        }
    }

    /// Read until `done` holds for everything received so far
    fn read_until(
        bridge: &SensorBridge,
        done: impl Fn(&[SensorMessage]) -> bool,
    ) -> Vec<SensorMessage> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while Instant::now() < deadline {
            received.extend(bridge.read());
            if done(&received) {
                return received;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out, received {:?}", received);
    }

    fn events(messages: &[SensorMessage]) -> Vec<SensorEvent> {
        messages.iter().map(|m| m.event.clone()).collect()
    }

    fn batteries(messages: &[SensorMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m.event, SensorEvent::Battery(_)))
            .count()
    }

    #[test]
    fn test_pulses_are_forwarded() {
        let transport = FakeTransport::with(vec![
            vec![0x10, 72, 0x20, 0x03],
            vec![0x10, 73, 0x1a, 0x03],
        ]);
        let bridge = SensorBridge::start(transport, "AA:BB", &fast_config()).unwrap();

        let received = read_until(&bridge, |m| {
            m.iter().filter(|m| matches!(m.event, SensorEvent::Pulse { .. })).count() == 2
        });
        assert_eq!(
            events(&received),
            vec![
                SensorEvent::Battery(64),
                SensorEvent::Pulse { bpm: 72, rr_intervals: vec![800] },
                SensorEvent::Pulse { bpm: 73, rr_intervals: vec![794] },
            ]
        );
        bridge.stop().unwrap();
    }

    #[test]
    fn test_missing_rr_intervals_triggers_reconnect() {
        let transport =
            FakeTransport::with(vec![vec![0x10, 72, 0x20, 0x03], vec![0x10, 72]]);
        let link = transport.link.clone();
        let bridge = SensorBridge::start(transport, "AA:BB", &fast_config()).unwrap();

        let received = read_until(&bridge, |m| batteries(m) == 2);
        let events = events(&received);
        assert_eq!(
            events[2],
            SensorEvent::Status("reconnecting: missing rr_intervals".into())
        );
        assert_eq!(events[3], SensorEvent::Battery(64));

        assert_eq!(link.lock().unwrap().connects, 2);
        assert!(bridge.is_running());
        bridge.stop().unwrap();
    }

    #[test]
    fn test_lost_connection_triggers_reconnect() {
        let transport = FakeTransport::with(vec![]);
        let link = transport.link.clone();
        let bridge = SensorBridge::start(transport, "AA:BB", &fast_config()).unwrap();

        read_until(&bridge, |m| batteries(m) == 1);
        link.lock().unwrap().connected = false;

        let received = read_until(&bridge, |m| batteries(m) == 1);
        assert_eq!(
            received[0].event,
            SensorEvent::Status("reconnecting: connection lost".into())
        );
        assert!(bridge.is_running());
        bridge.stop().unwrap();
    }

    #[test]
    fn test_transport_error_is_fatal_then_retried() {
        let transport = FakeTransport::with(vec![]);
        transport
            .link
            .lock()
            .unwrap()
            .connect_results
            .push_back(Err(Error::Transport("adapter busy".into())));
        let bridge = SensorBridge::start(transport, "AA:BB", &fast_config()).unwrap();

        let received = read_until(&bridge, |m| batteries(m) == 1);
        assert_eq!(
            received[0].event,
            SensorEvent::Fatal("Transport error: adapter busy".into())
        );
        assert!(bridge.is_running());
        bridge.stop().unwrap();
    }

    #[test]
    fn test_halt_closes_connection() {
        let transport = FakeTransport::with(vec![]);
        let link = transport.link.clone();
        let bridge = SensorBridge::start(transport, "AA:BB", &fast_config()).unwrap();
        read_until(&bridge, |m| batteries(m) == 1);

        let leftover = bridge.stop().unwrap();
        assert_eq!(
            leftover.last().map(|m| m.event.clone()),
            Some(SensorEvent::Status("halt requested by application".into()))
        );

        let link = link.lock().unwrap();
        assert!(!link.connected);
        assert!(link.disconnects >= 1);
    }

    #[test]
    fn test_closed_command_channel_stops_worker() {
        crate::logging::init_test();
        let transport = FakeTransport::with(vec![]);
        let link = transport.link.clone();
        let (command_tx, command_rx) = mpsc::sync_channel(COMMAND_CAPACITY);
        let (message_tx, message_rx) = mpsc::sync_channel(MESSAGE_CAPACITY);
        let worker = SensorWorker {
            transport,
            address: "AA:BB".into(),
            poll_interval: Duration::from_millis(2),
            backoff: Duration::from_millis(5),
            commands: command_rx,
            messages: message_tx,
        };

        drop(command_tx);
        worker.run();

        let received: Vec<SensorMessage> = message_rx.try_iter().collect();
        assert_eq!(
            events(&received),
            vec![SensorEvent::Status("command channel closed by application".into())]
        );
        assert_eq!(link.lock().unwrap().connects, 0);
    }

    #[test]
    fn test_drop_halts_worker() {
        let transport = FakeTransport::with(vec![]);
        let link = transport.link.clone();
        {
            let _bridge = SensorBridge::start(transport, "AA:BB", &fast_config()).unwrap();
        }
        assert!(!link.lock().unwrap().connected);
    }

    struct FakeScanner(Vec<Advertisement>);

    impl DeviceScanner for FakeScanner {
        fn scan(&mut self, _timeout: Duration) -> Result<Vec<Advertisement>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_scan_filters_and_dedups() {
        let other = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
        let mut scanner = FakeScanner(vec![
            Advertisement {
                address: "11:22".into(),
                local_name: None,
                service_ids: vec![HEART_RATE_SERVICE],
            },
            Advertisement {
                address: "11:22".into(),
                local_name: Some("Polar H10".into()),
                service_ids: vec![HEART_RATE_SERVICE],
            },
            Advertisement {
                address: "11:22".into(),
                local_name: Some("renamed".into()),
                service_ids: vec![HEART_RATE_SERVICE],
            },
            Advertisement {
                address: "33:44".into(),
                local_name: Some("Speaker".into()),
                service_ids: vec![other],
            },
        ]);

        let devices = scan(&mut scanner, Duration::from_secs(5)).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices["11:22"].as_deref(), Some("Polar H10"));
    }
}
