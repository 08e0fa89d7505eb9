//! Discovery, connect and reconnect logic for the outbound audio link.
//!
//! The machine chases one configured sink by name: every inquiry result is
//! matched against it, the inquiry is cancelled as soon as it shows up, and
//! the link is re-discovered whenever it drops. Retries are immediate and
//! unbounded; discovery is cheap and the sink may power on at any moment.

use crate::error::{Error, Result};
use crate::model::{DeviceAddress, Direction, LinkState};
use crate::radio::RadioBackend;
use std::fmt;
use tracing::{debug, info, warn};

/// Longest remote name the radio stack reports.
pub const MAX_NAME_LEN: usize = 248;

const EIR_SHORT_LOCAL_NAME: u8 = 0x08;
const EIR_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// Identifies one inquiry. Reports from an inquiry that has since been
/// superseded carry an older id and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InquiryId(u64);

impl InquiryId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InquiryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inquiry #{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceProperty {
    /// Raw extended inquiry response.
    Eir(Vec<u8>),
    Rssi(i8),
    ClassOfDevice(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Which side of the remote-control profile produced a key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRole {
    /// Response to a command this device sent.
    Controller,
    /// Command sent to this device by the peer.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughKey {
    Play,
    Pause,
    Stop,
    Forward,
    Backward,
    VolumeUp,
    VolumeDown,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    ScanResult {
        inquiry: InquiryId,
        address: DeviceAddress,
        properties: Vec<DeviceProperty>,
    },
    DiscoveryStarted {
        inquiry: InquiryId,
    },
    DiscoveryStopped {
        inquiry: InquiryId,
    },
    LinkStateChanged {
        address: DeviceAddress,
        status: LinkStatus,
    },
    Passthrough {
        role: ControlRole,
        key: PassthroughKey,
        state: KeyState,
    },
}

/// Playback request produced by a remote key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAction {
    Start,
    ResumeOrStart,
    Pause,
    Stop,
    Advance(Direction),
}

pub struct LinkMachine {
    state: LinkState,
    radio: Box<dyn RadioBackend>,
    target_name: String,
    inquiry_units: u8,
    target_found: bool,
    target_address: Option<DeviceAddress>,
    connected: bool,
    inquiry: Option<InquiryId>,
    issued: u64,
    retries: u64,
}

impl LinkMachine {
    pub fn new(radio: Box<dyn RadioBackend>, target_name: impl Into<String>, inquiry_units: u8) -> Self {
        Self {
            state: LinkState::Idle,
            radio,
            target_name: target_name.into(),
            inquiry_units,
            target_found: false,
            target_address: None,
            connected: false,
            inquiry: None,
            issued: 0,
            retries: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn target_found(&self) -> bool {
        self.target_found
    }

    pub fn target_address(&self) -> Option<DeviceAddress> {
        self.target_address
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Discovery restarts since the link was last up.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Inquiry whose results are currently being accepted.
    pub fn current_inquiry(&self) -> Option<InquiryId> {
        self.inquiry
    }

    /// Only valid while nothing is in flight: an inquiry already running
    /// (or the connect that follows it) is left to finish.
    pub fn start_discovery(&mut self) -> Result<()> {
        if !matches!(self.state, LinkState::Idle | LinkState::Disconnected) {
            return Err(Error::invalid("start discovery", self.state.label()));
        }

        self.target_found = false;
        self.target_address = None;
        self.issued += 1;
        let inquiry = InquiryId(self.issued);
        info!(target = %self.target_name, %inquiry, "starting device discovery");
        self.radio
            .start_inquiry(self.inquiry_units, inquiry)
            .map_err(|err| {
                warn!("inquiry could not be started: {err:#}");
                Error::ResourceUnavailable(format!("inquiry failed: {err:#}"))
            })?;
        self.inquiry = Some(inquiry);
        self.state = LinkState::Discovering;
        Ok(())
    }

    /// Releases the link, e.g. at shutdown.
    pub fn disconnect(&mut self) {
        let inquiry = self.inquiry.take();
        if let Some(address) = self.target_address.filter(|_| self.connected) {
            if let Err(err) = self.radio.disconnect(address) {
                warn!(%address, "disconnect failed: {err:#}");
            }
        } else if inquiry.is_some() {
            if let Err(err) = self.radio.cancel_inquiry() {
                warn!("inquiry cancel failed: {err:#}");
            }
        }
        self.connected = false;
        self.target_found = false;
        self.state = LinkState::Idle;
    }

    /// Applies one radio event. Key presses come back as the playback action
    /// they map to; everything else is absorbed here.
    pub fn on_event(&mut self, event: RadioEvent) -> Option<TransportAction> {
        match event {
            RadioEvent::ScanResult {
                inquiry,
                address,
                properties,
            } => {
                if self.is_current(inquiry) {
                    self.on_scan_result(address, &properties);
                }
                None
            }
            RadioEvent::DiscoveryStarted { inquiry } => {
                debug!(%inquiry, "discovery started");
                None
            }
            RadioEvent::DiscoveryStopped { inquiry } => {
                if self.is_current(inquiry) {
                    self.inquiry = None;
                    self.on_discovery_stopped();
                }
                None
            }
            RadioEvent::LinkStateChanged { address, status } => {
                self.on_link_state(address, status);
                None
            }
            RadioEvent::Passthrough { role, key, state } => transport_action(role, key, state),
        }
    }

    fn is_current(&self, inquiry: InquiryId) -> bool {
        if self.inquiry == Some(inquiry) {
            return true;
        }
        debug!(
            %inquiry,
            current = ?self.inquiry.map(InquiryId::value),
            "discarding report from superseded inquiry"
        );
        false
    }

    fn on_scan_result(&mut self, address: DeviceAddress, properties: &[DeviceProperty]) {
        let name = properties.iter().find_map(|property| match property {
            DeviceProperty::Eir(eir) => name_from_eir(eir),
            _ => None,
        });
        debug!(%address, name = name.as_deref().unwrap_or(""), "scanned device");

        if self.target_found || self.connected {
            return;
        }
        if name.as_deref() != Some(self.target_name.as_str()) {
            return;
        }

        info!(%address, target = %self.target_name, "found target, cancelling discovery");
        self.target_found = true;
        self.target_address = Some(address);
        self.state = LinkState::TargetFound;
        if let Err(err) = self.radio.cancel_inquiry() {
            warn!("inquiry cancel failed: {err:#}");
        }
    }

    fn on_discovery_stopped(&mut self) {
        if self.connected {
            return;
        }

        match self.target_address.filter(|_| self.target_found) {
            Some(address) => {
                info!(%address, "discovery stopped, connecting");
                match self.radio.connect(address) {
                    Ok(()) => self.state = LinkState::Connecting,
                    Err(err) => {
                        warn!(%address, "connect failed: {err:#}");
                        self.retry_discovery();
                    }
                }
            }
            None => {
                info!("discovery finished without target, retrying");
                self.retry_discovery();
            }
        }
    }

    fn on_link_state(&mut self, address: DeviceAddress, status: LinkStatus) {
        match status {
            LinkStatus::Connected => {
                info!(%address, target = %self.target_name, "link connected");
                self.connected = true;
                self.target_address = Some(address);
                self.retries = 0;
                self.state = LinkState::Connected;
            }
            LinkStatus::Disconnected => {
                warn!(%address, target = %self.target_name, "link disconnected");
                self.connected = false;
                self.target_found = false;
                self.state = LinkState::Disconnected;
                self.retry_discovery();
            }
            LinkStatus::Connecting => self.state = LinkState::Connecting,
            LinkStatus::Disconnecting => debug!(%address, "link disconnecting"),
        }
    }

    fn retry_discovery(&mut self) {
        self.retries += 1;
        self.state = LinkState::Disconnected;
        if let Err(err) = self.start_discovery() {
            warn!(retries = self.retries, "discovery retry failed: {err}");
        }
    }
}

/// Maps a remote key to a playback action. Releases are ignored.
///
/// As target the peer is steering an ongoing session, so play resumes and
/// pause/stop only pause. As controller the press answers a command this
/// device sent, and play/stop bring the whole pipeline up or down.
pub fn transport_action(
    role: ControlRole,
    key: PassthroughKey,
    state: KeyState,
) -> Option<TransportAction> {
    if state == KeyState::Released {
        return None;
    }

    let action = match (role, key) {
        (ControlRole::Target, PassthroughKey::Play) => TransportAction::ResumeOrStart,
        (ControlRole::Target, PassthroughKey::Pause | PassthroughKey::Stop) => {
            TransportAction::Pause
        }
        (ControlRole::Controller, PassthroughKey::Play) => TransportAction::Start,
        (ControlRole::Controller, PassthroughKey::Pause | PassthroughKey::Stop) => {
            TransportAction::Stop
        }
        (_, PassthroughKey::Forward) => TransportAction::Advance(Direction::Next),
        (_, PassthroughKey::Backward) => TransportAction::Advance(Direction::Previous),
        (_, other) => {
            debug!(?role, key = ?other, "unmapped passthrough key");
            return None;
        }
    };
    Some(action)
}

/// Pulls the device name out of extended inquiry response data, preferring
/// the complete local name over the shortened one.
pub fn name_from_eir(eir: &[u8]) -> Option<String> {
    let mut short = None;
    let mut rest = eir;

    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len);
        if len == 0 || tail.len() < len {
            break;
        }
        let (record, next) = tail.split_at(len);
        rest = next;

        let (kind, data) = (record[0], &record[1..]);
        match kind {
            EIR_COMPLETE_LOCAL_NAME => return Some(decode_name(data)),
            EIR_SHORT_LOCAL_NAME if short.is_none() => short = Some(decode_name(data)),
            _ => {}
        }
    }
    short
}

/// Builds a minimal EIR block carrying `name` as the complete local name.
pub fn eir_with_name(name: &str) -> Vec<u8> {
    let bytes = &name.as_bytes()[..name.len().min(MAX_NAME_LEN)];
    let mut eir = Vec::with_capacity(bytes.len() + 2);
    eir.push(u8::try_from(bytes.len() + 1).unwrap_or(u8::MAX));
    eir.push(EIR_COMPLETE_LOCAL_NAME);
    eir.extend_from_slice(bytes);
    eir
}

fn decode_name(data: &[u8]) -> String {
    let data = &data[..data.len().min(MAX_NAME_LEN)];
    let data = data.split(|byte| *byte == 0).next().unwrap_or_default();
    String::from_utf8_lossy(data).to_string()
}
