use crate::bluetooth::{
    ControlRole, DeviceProperty, InquiryId, KeyState, LinkStatus, PassthroughKey, RadioEvent,
    eir_with_name,
};
use crate::events::EventSender;
use crate::model::{DeviceAddress, SimulatedDevice};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Length of one inquiry unit on a real controller.
pub const INQUIRY_UNIT: Duration = Duration::from_millis(1_280);

const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Radio primitives the link machine drives. Results arrive later as
/// [`RadioEvent`]s through the backend's event sender; inquiry reports must
/// carry the id they were started with.
pub trait RadioBackend: Send {
    fn start_inquiry(&mut self, units: u8, inquiry: InquiryId) -> Result<()>;
    fn cancel_inquiry(&mut self) -> Result<()>;
    fn connect(&mut self, address: DeviceAddress) -> Result<()>;
    fn disconnect(&mut self, address: DeviceAddress) -> Result<()>;
}

struct Inquiry {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Software radio that "sees" a fixed list of devices. Each inquiry reports
/// them one by one spread over the inquiry window, then stops.
pub struct SimulatedRadio {
    events: EventSender,
    devices: Arc<Vec<SimulatedDevice>>,
    unit: Duration,
    link: Arc<Mutex<Option<DeviceAddress>>>,
    inquiry: Option<Inquiry>,
}

impl SimulatedRadio {
    pub fn new(events: EventSender, devices: Vec<SimulatedDevice>) -> Self {
        Self::with_unit(events, devices, INQUIRY_UNIT)
    }

    /// Same radio with a shorter inquiry unit, for demos and tests.
    pub fn with_unit(events: EventSender, devices: Vec<SimulatedDevice>, unit: Duration) -> Self {
        Self {
            events,
            devices: Arc::new(devices),
            unit,
            link: Arc::new(Mutex::new(None)),
            inquiry: None,
        }
    }

    /// Handle for poking the radio from outside: remote key presses and
    /// dropped links.
    pub fn remote(&self) -> SimulatedRemote {
        SimulatedRemote {
            events: self.events.clone(),
            link: Arc::clone(&self.link),
        }
    }

    fn finish_inquiry(&mut self) {
        if let Some(inquiry) = self.inquiry.take() {
            inquiry.cancel.store(true, Ordering::Release);
            if inquiry.handle.join().is_err() {
                warn!("simulated inquiry thread panicked");
            }
        }
    }

    fn known(&self, address: DeviceAddress) -> bool {
        self.devices.iter().any(|device| device.address == address)
    }

    fn set_link(&self, address: Option<DeviceAddress>) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }
}

impl RadioBackend for SimulatedRadio {
    fn start_inquiry(&mut self, units: u8, inquiry: InquiryId) -> Result<()> {
        self.finish_inquiry();

        let window = self.unit.saturating_mul(u32::from(units.max(1)));
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let devices = Arc::clone(&self.devices);
        let events = self.events.clone();
        let handle =
            thread::spawn(move || run_inquiry(&events, &devices, window, &flag, inquiry));

        self.inquiry = Some(Inquiry { cancel, handle });
        Ok(())
    }

    fn cancel_inquiry(&mut self) -> Result<()> {
        // The inquiry thread still reports DiscoveryStopped on its way out.
        if let Some(inquiry) = &self.inquiry {
            inquiry.cancel.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn connect(&mut self, address: DeviceAddress) -> Result<()> {
        self.events.emit(RadioEvent::LinkStateChanged {
            address,
            status: LinkStatus::Connecting,
        });
        let status = if self.known(address) {
            self.set_link(Some(address));
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        };
        self.events.emit(RadioEvent::LinkStateChanged { address, status });
        Ok(())
    }

    fn disconnect(&mut self, address: DeviceAddress) -> Result<()> {
        self.set_link(None);
        self.events.emit(RadioEvent::LinkStateChanged {
            address,
            status: LinkStatus::Disconnected,
        });
        Ok(())
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        self.finish_inquiry();
    }
}

fn run_inquiry(
    events: &EventSender,
    devices: &[SimulatedDevice],
    window: Duration,
    cancel: &AtomicBool,
    inquiry: InquiryId,
) {
    events.emit(RadioEvent::DiscoveryStarted { inquiry });
    debug!(%inquiry, devices = devices.len(), ?window, "simulated inquiry running");

    let started = Instant::now();
    let slots = u32::try_from(devices.len() + 1).unwrap_or(u32::MAX);
    let step = window / slots;

    for (slot, device) in (1..).zip(devices) {
        if !wait_until(started + step * slot, cancel) {
            break;
        }
        let delivered = events.emit(RadioEvent::ScanResult {
            inquiry,
            address: device.address,
            properties: vec![
                DeviceProperty::Rssi(-55),
                DeviceProperty::Eir(eir_with_name(&device.name)),
            ],
        });
        if !delivered {
            return;
        }
    }
    wait_until(started + window, cancel);
    events.emit(RadioEvent::DiscoveryStopped { inquiry });
}

/// Sleeps until `deadline`; false if the inquiry was cancelled first.
fn wait_until(deadline: Instant, cancel: &AtomicBool) -> bool {
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

#[derive(Clone)]
pub struct SimulatedRemote {
    events: EventSender,
    link: Arc<Mutex<Option<DeviceAddress>>>,
}

impl SimulatedRemote {
    /// Presses and releases a key on the connected sink.
    pub fn press(&self, key: PassthroughKey) {
        for state in [KeyState::Pressed, KeyState::Released] {
            self.events.emit(RadioEvent::Passthrough {
                role: ControlRole::Target,
                key,
                state,
            });
        }
    }

    /// Drops the current link as if the sink walked out of range.
    pub fn drop_link(&self) -> bool {
        let address = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match address {
            Some(address) => {
                info!(%address, "simulated link loss");
                self.events.emit(RadioEvent::LinkStateChanged {
                    address,
                    status: LinkStatus::Disconnected,
                })
            }
            None => false,
        }
    }
}
