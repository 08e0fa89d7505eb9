use crate::bluetooth::RadioEvent;
use crate::pipeline::PipelineEvent;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

/// Everything the hardware side reports to the consumer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Pipeline(PipelineEvent),
    Radio(RadioEvent),
}

impl From<PipelineEvent> for DeviceEvent {
    fn from(event: PipelineEvent) -> Self {
        Self::Pipeline(event)
    }
}

impl From<RadioEvent> for DeviceEvent {
    fn from(event: RadioEvent) -> Self {
        Self::Radio(event)
    }
}

/// Handle given to backends for raising events from their own threads.
#[derive(Clone)]
pub struct EventSender {
    sink: Arc<dyn Fn(DeviceEvent) -> bool + Send + Sync>,
}

impl EventSender {
    pub fn from_fn(sink: impl Fn(DeviceEvent) -> bool + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Returns false once nobody is listening any more.
    pub fn emit(&self, event: impl Into<DeviceEvent>) -> bool {
        (self.sink)(event.into())
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSender")
    }
}

/// Plain channel pair, for driving backends outside the jukebox.
pub fn channel() -> (EventSender, Receiver<DeviceEvent>) {
    let (tx, rx) = mpsc::channel();
    let sender = EventSender::from_fn(move |event| tx.send(event).is_ok());
    (sender, rx)
}
