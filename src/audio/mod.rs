use crate::events::EventSender;
use crate::pipeline::{ElementTag, LoadToken, PipelineBackend, PipelineEvent};
use anyhow::{Context, Result};
use rodio::Source;
use rodio::cpal::traits::HostTrait;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
#[cfg(unix)]
use std::ffi::CString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(40);

/// End of stream: the reader runs dry, then the sink has drained.
fn emit_finished(events: &EventSender, token: LoadToken) {
    for source in [ElementTag::reader(token), ElementTag::sink(token)] {
        if !events.emit(PipelineEvent::Finished { source }) {
            return;
        }
    }
}

/// Plays tracks on the local output device in place of the A2DP sink.
pub struct SpeakerPipeline {
    events: EventSender,
    stream: Option<OutputStream>,
    sink: Option<Arc<Sink>>,
    load: Option<LoadToken>,
    watcher: Option<Watcher>,
}

struct Watcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SpeakerPipeline {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            stream: None,
            sink: None,
            load: None,
            watcher: None,
        }
    }

    /// Checks that some output device can be opened at all.
    pub fn output_available() -> Result<()> {
        open_output_stream().map(|_| ())
    }

    fn sink(&self) -> Result<&Arc<Sink>> {
        self.sink.as_ref().context("no track loaded")
    }

    fn signal_watcher(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.stop.store(true, Ordering::Release);
        }
    }
}

impl PipelineBackend for SpeakerPipeline {
    fn construct(&mut self) -> Result<()> {
        if self.stream.is_none() {
            self.stream = Some(open_output_stream()?);
        }
        Ok(())
    }

    fn load(&mut self, path: &Path, token: LoadToken) -> Result<()> {
        let stream = self.stream.as_ref().context("pipeline not constructed")?;
        let file =
            File::open(path).with_context(|| format!("failed to open track {}", path.display()))?;
        let source = Decoder::try_from(file)
            .with_context(|| format!("failed to decode {}", path.display()))?;

        let sink = Sink::connect_new(stream.mixer());
        sink.pause();
        sink.append(source);
        self.sink = Some(Arc::new(sink));
        self.load = Some(token);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let sink = Arc::clone(self.sink()?);
        let token = self.load.context("no track loaded")?;
        sink.play();

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let events = self.events.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                if sink.empty() {
                    emit_finished(&events, token);
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
        });
        self.watcher = Some(Watcher { stop, handle });
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.sink()?.pause();
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.sink()?.play();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.signal_watcher();
        if let Some(sink) = &self.sink {
            sink.stop();
        }
        Ok(())
    }

    fn wait_for_stop(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop.store(true, Ordering::Release);
            watcher
                .handle
                .join()
                .map_err(|_| anyhow::anyhow!("sink watcher panicked"))?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.sink = None;
        self.load = None;
        Ok(())
    }

    fn release(&mut self) {
        let _ = self.stop();
        if let Err(err) = self.wait_for_stop() {
            warn!("{err:#}");
        }
        self.sink = None;
        self.load = None;
        self.stream = None;
        debug!("speaker output released");
    }
}

/// Default device first, then whichever enumerated device opens.
fn open_output_stream() -> Result<OutputStream> {
    let _quiet = StderrMute::engage();
    let mut stream = match OutputStreamBuilder::open_default_stream() {
        Ok(stream) => stream,
        Err(default_err) => {
            debug!("default output unavailable: {default_err}");
            let devices = rodio::cpal::default_host()
                .output_devices()
                .context("failed to enumerate output devices")?;
            devices
                .filter_map(|device| OutputStreamBuilder::from_device(device).ok())
                .find_map(|builder| {
                    builder
                        .with_error_callback(|_| {})
                        .open_stream_or_fallback()
                        .ok()
                })
                .context("no audio output device could be opened")?
        }
    };
    stream.log_on_drop(false);
    Ok(stream)
}

/// Points stderr at /dev/null while the audio host probes devices, which
/// otherwise floods the console with backend warnings. Restored on drop.
struct StderrMute {
    #[cfg(unix)]
    saved: Option<libc::c_int>,
}

impl StderrMute {
    #[cfg(unix)]
    fn engage() -> Self {
        let Ok(null) = CString::new("/dev/null") else {
            return Self { saved: None };
        };
        // SAFETY: plain descriptor juggling on fds this function owns.
        unsafe {
            let target = libc::open(null.as_ptr(), libc::O_WRONLY);
            if target < 0 {
                return Self { saved: None };
            }
            let saved = libc::dup(libc::STDERR_FILENO);
            if saved >= 0 {
                libc::dup2(target, libc::STDERR_FILENO);
            }
            libc::close(target);
            Self {
                saved: (saved >= 0).then_some(saved),
            }
        }
    }

    #[cfg(not(unix))]
    fn engage() -> Self {
        Self {}
    }
}

#[cfg(unix)]
impl Drop for StderrMute {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            // SAFETY: `saved` is the duplicate taken in `engage`.
            unsafe {
                libc::dup2(saved, libc::STDERR_FILENO);
                libc::close(saved);
            }
        }
    }
}

#[derive(Debug)]
struct Clock {
    offset: Duration,
    started_at: Option<Instant>,
    stopped: bool,
}

impl Clock {
    fn position(&self) -> Duration {
        let running = self
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.offset.saturating_add(running)
    }
}

/// Wall-clock pipeline: no audio, but tracks end after their probed
/// length (or `fallback`) and raise the same tagged finished event.
pub struct NullPipeline {
    events: EventSender,
    fallback: Option<Duration>,
    loaded: Option<(PathBuf, LoadToken, Option<Duration>)>,
    clock: Option<Arc<Mutex<Clock>>>,
    worker: Option<JoinHandle<()>>,
}

impl NullPipeline {
    pub fn new(events: EventSender, fallback: Option<Duration>) -> Self {
        Self {
            events,
            fallback,
            loaded: None,
            clock: None,
            worker: None,
        }
    }

    #[cfg(test)]
    fn position(&self) -> Option<Duration> {
        let clock = self.clock.as_ref()?;
        let clock = clock.lock().unwrap_or_else(PoisonError::into_inner);
        Some(clock.position())
    }

    fn estimate_duration(path: &Path) -> Option<Duration> {
        let file = File::open(path).ok()?;
        let source = Decoder::try_from(file).ok()?;
        source
            .total_duration()
            .filter(|duration| !duration.is_zero())
    }

    fn with_clock(&self, update: impl FnOnce(&mut Clock)) -> Result<()> {
        let clock = self.clock.as_ref().context("pipeline is not running")?;
        update(&mut clock.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }
}

impl PipelineBackend for NullPipeline {
    fn construct(&mut self) -> Result<()> {
        Ok(())
    }

    fn load(&mut self, path: &Path, token: LoadToken) -> Result<()> {
        let length = Self::estimate_duration(path).or(self.fallback);
        self.loaded = Some((path.to_path_buf(), token, length));
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let (_, token, length) = self.loaded.clone().context("no track loaded")?;
        let clock = Arc::new(Mutex::new(Clock {
            offset: Duration::ZERO,
            started_at: Some(Instant::now()),
            stopped: false,
        }));
        self.clock = Some(Arc::clone(&clock));

        let Some(length) = length else {
            return Ok(());
        };
        let events = self.events.clone();
        self.worker = Some(thread::spawn(move || {
            loop {
                thread::sleep(POLL_INTERVAL);
                let clock = clock.lock().unwrap_or_else(PoisonError::into_inner);
                if clock.stopped {
                    return;
                }
                if clock.position() >= length {
                    drop(clock);
                    emit_finished(&events, token);
                    return;
                }
            }
        }));
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.with_clock(|clock| {
            clock.offset = clock.position();
            clock.started_at = None;
        })
    }

    fn resume(&mut self) -> Result<()> {
        self.with_clock(|clock| {
            if clock.started_at.is_none() {
                clock.started_at = Some(Instant::now());
            }
        })
    }

    fn stop(&mut self) -> Result<()> {
        if self.clock.is_some() {
            self.with_clock(|clock| clock.stopped = true)?;
        }
        Ok(())
    }

    fn wait_for_stop(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("clock worker panicked"))?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.loaded = None;
        self.clock = None;
        Ok(())
    }

    fn release(&mut self) {
        let _ = self.stop();
        if let Err(err) = self.wait_for_stop() {
            warn!("{err:#}");
        }
        self.loaded = None;
        self.clock = None;
    }
}
