use crate::error::{Error, Result};
use crate::model::{Direction, PipelineState, Track};
use crate::sequencer::ShuffleSequencer;
use std::fmt;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Identifies one load of the pipeline. A fresh token is issued every time
/// a track is loaded, so events raised for an earlier load compare unequal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadToken(u64);

impl LoadToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementRole {
    Reader,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementTag {
    pub role: ElementRole,
    pub load: LoadToken,
}

impl ElementTag {
    pub fn reader(load: LoadToken) -> Self {
        Self {
            role: ElementRole::Reader,
            load,
        }
    }

    pub fn sink(load: LoadToken) -> Self {
        Self {
            role: ElementRole::Sink,
            load,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Finished { source: ElementTag },
}

/// The reader → decoder → sink chain the state machine drives. Only the
/// reader's end of stream moves playback on; the sink's drain is informational.
pub trait PipelineBackend {
    fn construct(&mut self) -> anyhow::Result<()>;
    /// Points the reader at `path`; events for this load carry `token`.
    fn load(&mut self, path: &Path, token: LoadToken) -> anyhow::Result<()>;
    fn run(&mut self) -> anyhow::Result<()>;
    fn pause(&mut self) -> anyhow::Result<()>;
    fn resume(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    fn wait_for_stop(&mut self) -> anyhow::Result<()>;
    fn reset(&mut self) -> anyhow::Result<()>;
    fn release(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Advanced(Track),
    Stale,
    Ignored,
    Failed,
}

pub struct PipelineMachine {
    state: PipelineState,
    backend: Box<dyn PipelineBackend>,
    constructed: bool,
    loaded: Option<(Track, LoadToken)>,
    issued: u64,
}

impl PipelineMachine {
    pub fn new(backend: Box<dyn PipelineBackend>) -> Self {
        Self {
            state: PipelineState::Uninitialized,
            backend,
            constructed: false,
            loaded: None,
            issued: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.loaded.as_ref().map(|(track, _)| track)
    }

    pub fn current_load(&self) -> Option<LoadToken> {
        self.loaded.as_ref().map(|(_, token)| *token)
    }

    pub fn start(&mut self, sequencer: &mut ShuffleSequencer) -> Result<Track> {
        self.start_from(Direction::Next, sequencer)
    }

    /// Brings the pipeline up and plays the track `direction` leads to.
    /// The chain is constructed before the sequencer moves, so a failed
    /// construction leaves the position where it was.
    pub fn start_from(
        &mut self,
        direction: Direction,
        sequencer: &mut ShuffleSequencer,
    ) -> Result<Track> {
        if !matches!(
            self.state,
            PipelineState::Uninitialized | PipelineState::Stopped
        ) {
            return Err(Error::invalid("start", self.state.label()));
        }
        if sequencer.is_empty() {
            return Err(Error::ResourceUnavailable(String::from(
                "no track to play: track store is empty",
            )));
        }

        self.ensure_constructed()?;
        let pulled = match direction {
            Direction::Next => sequencer.next(),
            Direction::Previous => sequencer.previous(),
        };
        let track =
            pulled.map_err(|err| Error::ResourceUnavailable(format!("no track to play: {err}")))?;
        self.run_track(track)
    }

    /// Stops whatever is loaded, resets the chain and plays `track`.
    ///
    /// The previous load token is dropped before the new one is issued, so a
    /// finished event still queued for the old load is recognised as stale.
    pub fn load_and_run(&mut self, track: Track) -> Result<Track> {
        if self.state == PipelineState::Uninitialized {
            return Err(Error::invalid("load a track", self.state.label()));
        }

        self.halt();
        self.ensure_constructed()?;
        self.run_track(track)
    }

    /// Like `load_and_run`, but brings the pipeline up first if needed.
    pub fn play_track(&mut self, track: Track) -> Result<Track> {
        if self.state == PipelineState::Uninitialized {
            self.ensure_constructed()?;
            return self.run_track(track);
        }
        self.load_and_run(track)
    }

    pub fn advance(
        &mut self,
        direction: Direction,
        sequencer: &mut ShuffleSequencer,
    ) -> Result<Track> {
        if self.state == PipelineState::Uninitialized {
            return Err(Error::invalid("advance", self.state.label()));
        }

        let pulled = match direction {
            Direction::Next => sequencer.next(),
            Direction::Previous => sequencer.previous(),
        };
        let track =
            pulled.map_err(|err| Error::ResourceUnavailable(format!("no track to play: {err}")))?;
        self.load_and_run(track)
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.state != PipelineState::Running {
            return Err(Error::invalid("pause", self.state.label()));
        }
        self.backend
            .pause()
            .map_err(|err| Error::ResourceUnavailable(format!("pause failed: {err:#}")))?;
        self.state = PipelineState::Paused;
        info!("playback paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != PipelineState::Paused {
            return Err(Error::invalid("resume", self.state.label()));
        }
        self.backend
            .resume()
            .map_err(|err| Error::ResourceUnavailable(format!("resume failed: {err:#}")))?;
        self.state = PipelineState::Running;
        info!("playback resumed");
        Ok(())
    }

    pub fn resume_or_start(&mut self, sequencer: &mut ShuffleSequencer) -> Result<()> {
        match self.state {
            PipelineState::Paused => self.resume(),
            PipelineState::Running => Ok(()),
            PipelineState::Uninitialized | PipelineState::Stopped => {
                self.start(sequencer).map(|_| ())
            }
            state => Err(Error::invalid("resume", state.label())),
        }
    }

    /// Stops playback and releases the chain. Stopping twice is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Uninitialized => Err(Error::invalid("stop", self.state.label())),
            PipelineState::Stopped if !self.constructed => Ok(()),
            _ => {
                self.halt();
                self.release();
                info!("pipeline stopped");
                Ok(())
            }
        }
    }

    /// Full release back to `Uninitialized`.
    pub fn teardown(&mut self) {
        if self.state == PipelineState::Uninitialized && !self.constructed {
            return;
        }
        self.halt();
        self.release();
        self.state = PipelineState::Uninitialized;
        info!("pipeline torn down");
    }

    pub fn on_event(
        &mut self,
        event: PipelineEvent,
        sequencer: &mut ShuffleSequencer,
    ) -> EventOutcome {
        let PipelineEvent::Finished { source } = event;

        if source.role != ElementRole::Reader {
            debug!(role = ?source.role, load = %source.load, "ignoring non-reader finished event");
            return EventOutcome::Ignored;
        }

        let current = self.current_load();
        let playing = matches!(
            self.state,
            PipelineState::Running | PipelineState::Paused
        );
        if current != Some(source.load) || !playing {
            debug!(
                load = %source.load,
                current = ?current.map(LoadToken::value),
                state = self.state.label(),
                "discarding stale finished event"
            );
            return EventOutcome::Stale;
        }

        info!(load = %source.load, "track finished, loading next");
        match self.advance(Direction::Next, sequencer) {
            Ok(track) => EventOutcome::Advanced(track),
            Err(err) => {
                warn!(%err, "auto-advance failed, pipeline left stopped");
                self.halt();
                EventOutcome::Failed
            }
        }
    }

    fn ensure_constructed(&mut self) -> Result<()> {
        if self.constructed {
            return Ok(());
        }
        self.backend.construct().map_err(|err| {
            error!("failed to construct pipeline: {err:#}");
            Error::ResourceUnavailable(format!("pipeline construction failed: {err:#}"))
        })?;
        self.constructed = true;
        debug!("pipeline constructed");
        Ok(())
    }

    fn halt(&mut self) {
        if matches!(
            self.state,
            PipelineState::Loaded | PipelineState::Running | PipelineState::Paused
        ) {
            self.state = PipelineState::Stopping;
            if let Err(err) = self.backend.stop() {
                warn!("pipeline stop reported an error: {err:#}");
            }
            if let Err(err) = self.backend.wait_for_stop() {
                warn!("waiting for pipeline stop failed: {err:#}");
            }
            self.state = PipelineState::Stopped;
        }
        self.loaded = None;
    }

    fn release(&mut self) {
        if self.constructed {
            self.backend.release();
            self.constructed = false;
        }
        self.state = PipelineState::Stopped;
    }

    fn run_track(&mut self, track: Track) -> Result<Track> {
        if let Err(err) = self.backend.reset() {
            warn!("pipeline reset reported an error: {err:#}");
        }

        self.issued += 1;
        let token = LoadToken(self.issued);
        if let Err(err) = self.backend.load(&track.path, token) {
            self.state = PipelineState::Stopped;
            return Err(Error::ResourceUnavailable(format!(
                "failed to load {}: {err:#}",
                track.uri()
            )));
        }
        self.loaded = Some((track.clone(), token));
        self.state = PipelineState::Loaded;

        if let Err(err) = self.backend.run() {
            self.loaded = None;
            self.state = PipelineState::Stopped;
            return Err(Error::ResourceUnavailable(format!(
                "failed to run {}: {err:#}",
                track.uri()
            )));
        }
        self.state = PipelineState::Running;
        info!(track = %track.name, load = %token, "playing");
        Ok(track)
    }
}
