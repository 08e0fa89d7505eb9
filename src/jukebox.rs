//! The single consumer thread and the control surface in front of it.
//!
//! Device events and user commands share one queue, so every state change
//! happens on the consumer thread in arrival order. Callers block on a
//! per-command reply channel.

use crate::engine::{Command, Engine, Reply};
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventSender};
use crate::model::{PlaybackStatus, Track};
use anyhow::Context;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

enum Inbound {
    Device(DeviceEvent),
    Command(Command, Sender<Result<Reply>>),
    Shutdown,
}

pub struct Jukebox {
    inbound: Sender<Inbound>,
    consumer: Option<JoinHandle<()>>,
}

impl Jukebox {
    /// Starts the consumer thread. `build` runs on that thread and gets the
    /// sender backends use to raise events; the engine then boots.
    pub fn spawn<F>(build: F) -> anyhow::Result<Self>
    where
        F: FnOnce(EventSender) -> anyhow::Result<Engine> + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>();
        let (ready_tx, ready_rx) = mpsc::channel::<anyhow::Result<()>>();

        let device_tx = inbound_tx.clone();
        let events = EventSender::from_fn(move |event| device_tx.send(Inbound::Device(event)).is_ok());

        let consumer = thread::Builder::new()
            .name(String::from("sdtune-consumer"))
            .spawn(move || {
                let engine = match build(events) {
                    Ok(engine) => {
                        let _ = ready_tx.send(Ok(()));
                        engine
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                consume(engine, inbound_rx);
            })
            .context("failed to spawn consumer thread")?;

        ready_rx
            .recv()
            .context("consumer thread exited during startup")?
            .context("failed to build engine")?;

        Ok(Self {
            inbound: inbound_tx,
            consumer: Some(consumer),
        })
    }

    pub fn list_tracks(&self) -> Result<Vec<String>> {
        match self.request(Command::ListTracks)? {
            Reply::Tracks(names) => Ok(names),
            other => Err(unexpected(&other)),
        }
    }

    pub fn play(&self, identifier: &str) -> Result<Track> {
        self.playing(Command::Play(identifier.to_string()))
    }

    pub fn pause(&self) -> Result<()> {
        self.done(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.done(Command::Resume)
    }

    pub fn next(&self) -> Result<Track> {
        self.playing(Command::Next)
    }

    pub fn previous(&self) -> Result<Track> {
        self.playing(Command::Previous)
    }

    pub fn start(&self) -> Result<Track> {
        self.playing(Command::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.done(Command::Stop)
    }

    pub fn current_status(&self) -> Result<PlaybackStatus> {
        match self.request(Command::Status)? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub fn start_discovery(&self) -> Result<()> {
        self.done(Command::StartDiscovery)
    }

    pub fn rescan(&self) -> Result<usize> {
        match self.request(Command::Rescan)? {
            Reply::Scanned(count) => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    /// Tears the engine down and waits for the consumer thread.
    pub fn shutdown(mut self) {
        self.stop_consumer();
    }

    fn request(&self, command: Command) -> Result<Reply> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.inbound
            .send(Inbound::Command(command, reply_tx))
            .map_err(|_| consumer_gone())?;
        reply_rx.recv().map_err(|_| consumer_gone())?
    }

    fn playing(&self, command: Command) -> Result<Track> {
        match self.request(command)? {
            Reply::Playing(track) => Ok(track),
            other => Err(unexpected(&other)),
        }
    }

    fn done(&self, command: Command) -> Result<()> {
        match self.request(command)? {
            Reply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn stop_consumer(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        let _ = self.inbound.send(Inbound::Shutdown);
        if consumer.join().is_err() {
            warn!("consumer thread panicked");
        }
    }
}

impl Drop for Jukebox {
    fn drop(&mut self) {
        self.stop_consumer();
    }
}

fn consume(mut engine: Engine, inbound: Receiver<Inbound>) {
    engine.boot();
    info!("consumer running");

    for message in inbound.iter() {
        match message {
            Inbound::Device(event) => engine.handle_event(event),
            Inbound::Command(command, reply) => {
                if reply.send(engine.execute(command)).is_err() {
                    debug!("caller went away before the reply");
                }
            }
            Inbound::Shutdown => break,
        }
    }

    engine.shutdown();
}

fn consumer_gone() -> Error {
    Error::ResourceUnavailable(String::from("consumer thread is not running"))
}

fn unexpected(reply: &Reply) -> Error {
    Error::ResourceUnavailable(format!("unexpected reply {reply:?}"))
}
