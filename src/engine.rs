//! Orchestrator owning the sequencer, the pipeline and the link machine.
//!
//! Nothing in here is thread-aware: the jukebox consumer thread owns one
//! `Engine` and feeds it commands and device events strictly one at a time,
//! which is what keeps a user `next` and an end-of-track event from both
//! reloading the pipeline.

use crate::bluetooth::{LinkMachine, TransportAction};
use crate::error::Result;
use crate::events::DeviceEvent;
use crate::model::{Direction, PipelineState, PlaybackStatus, Track};
use crate::pipeline::{EventOutcome, PipelineMachine};
use crate::sequencer::ShuffleSequencer;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListTracks,
    Play(String),
    Pause,
    Resume,
    Next,
    Previous,
    Start,
    Stop,
    Status,
    StartDiscovery,
    Rescan,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::ListTracks => "list",
            Self::Play(_) => "play",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Status => "status",
            Self::StartDiscovery => "discover",
            Self::Rescan => "rescan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Tracks(Vec<String>),
    Playing(Track),
    Status(PlaybackStatus),
    Scanned(usize),
    Done,
}

pub struct Engine {
    sequencer: ShuffleSequencer,
    pipeline: PipelineMachine,
    link: LinkMachine,
}

impl Engine {
    pub fn new(sequencer: ShuffleSequencer, pipeline: PipelineMachine, link: LinkMachine) -> Self {
        Self {
            sequencer,
            pipeline,
            link,
        }
    }

    pub fn sequencer(&self) -> &ShuffleSequencer {
        &self.sequencer
    }

    pub fn pipeline(&self) -> &PipelineMachine {
        &self.pipeline
    }

    pub fn link(&self) -> &LinkMachine {
        &self.link
    }

    /// Power-on sequence: go looking for the sink, then start playing.
    /// Neither failure is fatal; the engine stays up to take commands.
    pub fn boot(&mut self) {
        if self.sequencer.is_empty() {
            warn!("no playable tracks found");
        } else {
            info!(tracks = self.sequencer.len(), "track store ready");
        }

        if let Err(err) = self.link.start_discovery() {
            warn!(%err, "initial discovery failed");
        }
        if let Err(err) = self.pipeline.start(&mut self.sequencer) {
            warn!(%err, "initial playback did not start");
        }
    }

    pub fn shutdown(&mut self) {
        self.pipeline.teardown();
        self.link.disconnect();
        info!("engine shut down");
    }

    pub fn execute(&mut self, command: Command) -> Result<Reply> {
        debug!(command = command.name(), "executing command");
        let result = self.dispatch(command);
        if let Err(err) = &result {
            if err.is_invalid_transition() {
                info!(%err, "command ignored");
            } else {
                warn!(%err, "command failed");
            }
        }
        result
    }

    fn dispatch(&mut self, command: Command) -> Result<Reply> {
        match command {
            Command::ListTracks => Ok(Reply::Tracks(self.sequencer.tracks().names())),
            Command::Play(identifier) => {
                let track = self.sequencer.set_current_by_identity(&identifier)?;
                self.pipeline.play_track(track).map(Reply::Playing)
            }
            Command::Pause => self.pipeline.pause().map(|()| Reply::Done),
            Command::Resume => self.pipeline.resume().map(|()| Reply::Done),
            Command::Next => self.step(Direction::Next),
            Command::Previous => self.step(Direction::Previous),
            Command::Start => self.pipeline.start(&mut self.sequencer).map(Reply::Playing),
            Command::Stop => self.pipeline.stop().map(|()| Reply::Done),
            Command::Status => Ok(Reply::Status(self.status())),
            Command::StartDiscovery => self.link.start_discovery().map(|()| Reply::Done),
            Command::Rescan => self.rescan().map(Reply::Scanned),
        }
    }

    /// Before the pipeline has ever run, skipping simply starts it.
    fn step(&mut self, direction: Direction) -> Result<Reply> {
        if self.pipeline.state() == PipelineState::Uninitialized {
            return self
                .pipeline
                .start_from(direction, &mut self.sequencer)
                .map(Reply::Playing);
        }
        self.pipeline
            .advance(direction, &mut self.sequencer)
            .map(Reply::Playing)
    }

    /// Indices shift on a rescan, so whatever is playing is stopped first.
    fn rescan(&mut self) -> Result<usize> {
        if self.pipeline.state() != PipelineState::Uninitialized {
            self.pipeline.stop()?;
        }
        self.sequencer.rescan()
    }

    pub fn status(&self) -> PlaybackStatus {
        let track = self
            .pipeline
            .current_track()
            .map(|track| track.name.clone())
            .or_else(|| self.sequencer.current().ok().map(|track| track.name));
        PlaybackStatus {
            track,
            position: self.sequencer.position(),
            total: self.sequencer.len(),
            pipeline: self.pipeline.state(),
            link: self.link.state(),
        }
    }

    /// Applies one event from the hardware side. Failures are logged and
    /// leave the machines in a steady state; this never returns an error.
    pub fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Pipeline(event) => {
                match self.pipeline.on_event(event, &mut self.sequencer) {
                    EventOutcome::Advanced(track) => debug!(track = %track.name, "auto-advanced"),
                    EventOutcome::Failed => warn!("playback stopped after failed auto-advance"),
                    EventOutcome::Stale | EventOutcome::Ignored => {}
                }
            }
            DeviceEvent::Radio(event) => {
                if let Some(action) = self.link.on_event(event) {
                    self.apply_transport(action);
                }
            }
        }
    }

    fn apply_transport(&mut self, action: TransportAction) {
        debug!(?action, "remote transport command");
        let result = match action {
            TransportAction::Start => self.pipeline.start(&mut self.sequencer).map(|_| ()),
            TransportAction::ResumeOrStart => self.pipeline.resume_or_start(&mut self.sequencer),
            TransportAction::Pause => self.pipeline.pause(),
            TransportAction::Stop => self.pipeline.stop(),
            TransportAction::Advance(direction) => self.step(direction).map(|_| ()),
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_invalid_transition() => info!(%err, "remote command ignored"),
            Err(err) => warn!(%err, "remote command failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::fakes::{RadioCall, RecordingRadio};
    use crate::bluetooth::{ControlRole, KeyState, LinkStatus, PassthroughKey, RadioEvent};
    use crate::error::Error;
    use crate::library::TrackStore;
    use crate::model::{DeviceAddress, LinkState};
    use crate::pipeline::fakes::RecordingBackend;
    use crate::pipeline::{ElementTag, PipelineEvent};
    use crate::storage::MemoryStore;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::path::PathBuf;

    fn tracks(count: usize) -> TrackStore {
        TrackStore::from_tracks(
            (0..count)
                .map(|index| Track {
                    index,
                    path: PathBuf::from(format!("/sd/t{index}.mp3")),
                    name: format!("t{index}.mp3"),
                })
                .collect(),
        )
    }

    fn engine(count: usize) -> (Engine, RecordingBackend, RecordingRadio) {
        let sequencer = ShuffleSequencer::with_rng(
            tracks(count),
            Box::new(MemoryStore::new()),
            SmallRng::seed_from_u64(11),
        );
        let backend = RecordingBackend::default();
        let radio = RecordingRadio::default();
        let engine = Engine::new(
            sequencer,
            PipelineMachine::new(Box::new(backend.clone())),
            LinkMachine::new(Box::new(radio.clone()), "TargetDevice", 5),
        );
        (engine, backend, radio)
    }

    fn finished(engine: &Engine) -> DeviceEvent {
        let load = engine.pipeline().current_load().expect("loaded");
        DeviceEvent::Pipeline(PipelineEvent::Finished {
            source: ElementTag::reader(load),
        })
    }

    fn press(key: PassthroughKey) -> DeviceEvent {
        DeviceEvent::Radio(RadioEvent::Passthrough {
            role: ControlRole::Target,
            key,
            state: KeyState::Pressed,
        })
    }

    #[test]
    fn boot_starts_discovery_and_playback() {
        let (mut engine, _, radio) = engine(3);
        engine.boot();
        assert_eq!(radio.calls(), vec![RadioCall::StartInquiry(5)]);
        assert_eq!(engine.pipeline().state(), PipelineState::Running);
        assert_eq!(engine.status().position, 1);
    }

    #[test]
    fn boot_with_empty_store_keeps_running() {
        let (mut engine, _, _) = engine(0);
        engine.boot();
        assert_eq!(engine.pipeline().state(), PipelineState::Uninitialized);
        assert_eq!(engine.link().state(), LinkState::Discovering);
        assert!(matches!(
            engine.execute(Command::Next),
            Err(Error::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn play_by_name_resumes_sequence_after_it() {
        let (mut engine, _, _) = engine(4);
        engine.boot();

        let Reply::Playing(track) = engine.execute(Command::Play("t3.mp3".into())).expect("play")
        else {
            panic!("expected playing reply");
        };
        assert_eq!(track.index, 3);
        let slot = engine
            .sequencer()
            .order()
            .iter()
            .position(|index| *index == 3)
            .expect("in order");
        assert_eq!(engine.status().position, slot + 1);
        assert_eq!(engine.status().track.as_deref(), Some("t3.mp3"));
    }

    #[test]
    fn unknown_track_is_not_found() {
        let (mut engine, _, _) = engine(2);
        assert!(matches!(
            engine.execute(Command::Play("missing.mp3".into())),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn next_before_start_brings_pipeline_up() {
        let (mut engine, backend, _) = engine(3);
        let reply = engine.execute(Command::Next).expect("next");
        assert!(matches!(reply, Reply::Playing(_)));
        assert_eq!(engine.pipeline().state(), PipelineState::Running);
        assert_eq!(backend.calls().first().map(String::as_str), Some("construct"));
    }

    #[test]
    fn failed_skip_before_start_keeps_position() {
        let (mut engine, backend, _) = engine(3);
        backend.set_fail_construct(true);
        assert!(matches!(
            engine.execute(Command::Next),
            Err(Error::ResourceUnavailable(_))
        ));
        assert_eq!(engine.status().position, 0);

        backend.set_fail_construct(false);
        engine.execute(Command::Next).expect("next");
        assert_eq!(engine.status().position, 1);
    }

    #[test]
    fn user_skip_makes_pending_finish_stale() {
        let (mut engine, _, _) = engine(3);
        engine.boot();
        let stale = finished(&engine);
        engine.execute(Command::Next).expect("next");
        let position = engine.status().position;

        engine.handle_event(stale);
        assert_eq!(engine.status().position, position);

        let current = finished(&engine);
        engine.handle_event(current);
        assert_eq!(engine.status().position, position + 1);
    }

    #[test]
    fn invalid_commands_are_reported_not_fatal() {
        let (mut engine, _, _) = engine(2);
        let err = engine.execute(Command::Pause).expect_err("pause before start");
        assert!(err.is_invalid_transition());
        engine.execute(Command::Start).expect("start");
        engine.execute(Command::Pause).expect("pause");
        assert!(engine.execute(Command::Pause).expect_err("twice").is_invalid_transition());
        engine.execute(Command::Resume).expect("resume");
    }

    #[test]
    fn remote_keys_drive_pipeline() {
        let (mut engine, _, _) = engine(3);
        engine.boot();

        engine.handle_event(press(PassthroughKey::Pause));
        assert_eq!(engine.pipeline().state(), PipelineState::Paused);
        engine.handle_event(press(PassthroughKey::Play));
        assert_eq!(engine.pipeline().state(), PipelineState::Running);

        let position = engine.status().position;
        engine.handle_event(press(PassthroughKey::Forward));
        assert_eq!(engine.status().position, position + 1);
        engine.handle_event(press(PassthroughKey::Backward));
        assert_eq!(engine.status().position, position);

        engine.handle_event(DeviceEvent::Radio(RadioEvent::Passthrough {
            role: ControlRole::Controller,
            key: PassthroughKey::Stop,
            state: KeyState::Pressed,
        }));
        assert_eq!(engine.pipeline().state(), PipelineState::Stopped);
        engine.handle_event(press(PassthroughKey::Play));
        assert_eq!(engine.pipeline().state(), PipelineState::Running);
    }

    #[test]
    fn link_drop_restarts_discovery_without_touching_playback() {
        let (mut engine, _, radio) = engine(2);
        engine.boot();
        let address = DeviceAddress([1, 2, 3, 4, 5, 6]);
        engine.handle_event(DeviceEvent::Radio(RadioEvent::LinkStateChanged {
            address,
            status: LinkStatus::Connected,
        }));
        assert_eq!(engine.status().link, LinkState::Connected);
        radio.clear();

        engine.handle_event(DeviceEvent::Radio(RadioEvent::LinkStateChanged {
            address,
            status: LinkStatus::Disconnected,
        }));
        assert_eq!(radio.calls(), vec![RadioCall::StartInquiry(5)]);
        assert_eq!(engine.status().link, LinkState::Discovering);
        assert_eq!(engine.pipeline().state(), PipelineState::Running);
    }

    #[test]
    fn rescan_stops_playback_and_keeps_order_when_count_matches() {
        let (mut engine, _, _) = engine(3);
        engine.boot();
        let order = engine.sequencer().order().to_vec();
        assert_eq!(engine.execute(Command::Rescan).expect("rescan"), Reply::Scanned(3));
        assert_eq!(engine.pipeline().state(), PipelineState::Stopped);
        assert_eq!(engine.sequencer().order(), order.as_slice());
        assert_eq!(engine.status().position, 0);
    }

    #[test]
    fn shutdown_tears_everything_down() {
        let (mut engine, backend, _) = engine(2);
        engine.boot();
        engine.shutdown();
        assert_eq!(engine.pipeline().state(), PipelineState::Uninitialized);
        assert_eq!(engine.link().state(), LinkState::Idle);
        assert_eq!(backend.calls().last().map(String::as_str), Some("release"));
    }
}
