use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub index: usize,
    pub path: PathBuf,
    pub name: String,
}

impl Track {
    pub fn uri(&self) -> String {
        self.path.display().to_string()
    }

    /// Matches either the bare file name or the full path.
    pub fn matches(&self, identifier: &str) -> bool {
        self.name == identifier || self.path.to_string_lossy() == identifier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Uninitialized,
    Loaded,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl PipelineState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Idle,
    Discovering,
    TargetFound,
    Connecting,
    Connected,
    Disconnected,
}

impl LinkState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::TargetFound => "target found",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress(pub [u8; 6]);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for DeviceAddress {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        let mut bytes = [0_u8; 6];
        let mut parts = value.trim().split(':');
        for byte in &mut bytes {
            let Some(part) = parts.next() else {
                anyhow::bail!("device address {value} has fewer than 6 octets");
            };
            *byte = u8::from_str_radix(part, 16)
                .map_err(|err| anyhow::anyhow!("invalid octet {part} in {value}: {err}"))?;
        }
        if parts.next().is_some() {
            anyhow::bail!("device address {value} has more than 6 octets");
        }
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackStatus {
    pub track: Option<String>,
    pub position: usize,
    pub total: usize,
    pub pipeline: PipelineState,
    pub link: LinkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Speaker,
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub address: DeviceAddress,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
    #[serde(default = "default_target_name")]
    pub target_name: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_inquiry_units")]
    pub inquiry_units: u8,
    #[serde(default = "default_max_tracks")]
    pub max_tracks: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    #[serde(default)]
    pub output: OutputKind,
    #[serde(default)]
    pub null_track_seconds: Option<u32>,
    #[serde(default)]
    pub simulated_devices: Vec<SimulatedDevice>,
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("music")
}

fn default_target_name() -> String {
    String::from("ESP_SINK_STREAM_DEMO")
}

fn default_device_name() -> String {
    String::from("ESP_SOURCE_STREAM_DEMO")
}

fn default_inquiry_units() -> u8 {
    5
}

fn default_max_tracks() -> usize {
    512
}

fn default_extensions() -> Vec<String> {
    vec![String::from("mp3")]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            target_name: default_target_name(),
            device_name: default_device_name(),
            inquiry_units: default_inquiry_units(),
            max_tracks: default_max_tracks(),
            extensions: default_extensions(),
            store_dir: None,
            output: OutputKind::default(),
            null_track_seconds: None,
            simulated_devices: Vec::new(),
        }
    }
}
