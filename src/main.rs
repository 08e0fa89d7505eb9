use anyhow::Context;
use sdtune::audio::{NullPipeline, SpeakerPipeline};
use sdtune::bluetooth::{LinkMachine, PassthroughKey};
use sdtune::engine::Engine;
use sdtune::jukebox::Jukebox;
use sdtune::library::{FsLister, ScanOptions, TrackStore};
use sdtune::model::{DeviceAddress, OutputKind, Settings, SimulatedDevice};
use sdtune::pipeline::{PipelineBackend, PipelineMachine};
use sdtune::radio::{SimulatedRadio, SimulatedRemote};
use sdtune::sequencer::ShuffleSequencer;
use sdtune::storage::{FileStore, KeyValueStore, MemoryStore};
use sdtune::{config, events::EventSender};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Address handed to the stand-in sink when none is configured.
const STAND_IN_SINK: DeviceAddress = DeviceAddress([0x02, 0x5d, 0x7e, 0x00, 0x00, 0x01]);

#[derive(Debug, Default)]
struct CliArgs {
    config_dir: Option<PathBuf>,
    music_dir: Option<PathBuf>,
    target: Option<String>,
    null_output: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sdtune=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = parse_args(std::env::args().skip(1).collect())?;
    let root = match args.config_dir.clone() {
        Some(dir) => dir,
        None => config::config_root()?,
    };
    let mut settings = config::load_or_create_settings(&root)?;
    if let Some(dir) = args.music_dir {
        settings.content_dir = dir;
    }
    if let Some(target) = args.target {
        settings.target_name = target;
    }
    if args.null_output {
        settings.output = OutputKind::Null;
    }
    if settings.simulated_devices.is_empty() {
        settings.simulated_devices.push(SimulatedDevice {
            address: STAND_IN_SINK,
            name: settings.target_name.clone(),
        });
    }

    info!(
        device = %settings.device_name,
        target = %settings.target_name,
        music = %settings.content_dir.display(),
        "starting"
    );

    let store_dir = config::store_dir(&root, &settings);
    let (remote_tx, remote_rx) = mpsc::channel();
    let jukebox = Jukebox::spawn(move |events| {
        let engine = build_engine(&settings, &store_dir, events, &remote_tx);
        Ok(engine)
    })?;
    let remote = remote_rx
        .recv()
        .context("consumer did not hand back the radio remote")?;

    run_console(&jukebox, &remote)?;
    jukebox.shutdown();
    Ok(())
}

fn build_engine(
    settings: &Settings,
    store_dir: &std::path::Path,
    events: EventSender,
    remote_tx: &mpsc::Sender<SimulatedRemote>,
) -> Engine {
    let options = ScanOptions {
        extensions: settings.extensions.clone(),
        max_tracks: settings.max_tracks,
    };
    let tracks = TrackStore::scan(&settings.content_dir, Box::new(FsLister), options.clone())
        .unwrap_or_else(|err| {
            warn!(%err, "track scan failed, starting with an empty store");
            TrackStore::unscanned(&settings.content_dir, Box::new(FsLister), options)
        });

    let store: Box<dyn KeyValueStore> = match FileStore::open(store_dir) {
        Ok(store) => Box::new(store),
        Err(err) => {
            warn!(%err, "persistent store unavailable, shuffle order will not survive restarts");
            Box::new(MemoryStore::unreachable())
        }
    };
    let sequencer = ShuffleSequencer::initialize(tracks, store);

    let backend: Box<dyn PipelineBackend> = match settings.output {
        OutputKind::Speaker => match SpeakerPipeline::output_available() {
            Ok(()) => Box::new(SpeakerPipeline::new(events.clone())),
            Err(err) => {
                warn!("no audio output, falling back to null output: {err:#}");
                Box::new(null_pipeline(settings, events.clone()))
            }
        },
        OutputKind::Null => Box::new(null_pipeline(settings, events.clone())),
    };

    let radio = SimulatedRadio::new(events, settings.simulated_devices.clone());
    let _ = remote_tx.send(radio.remote());
    let link = LinkMachine::new(
        Box::new(radio),
        settings.target_name.clone(),
        settings.inquiry_units,
    );

    Engine::new(sequencer, PipelineMachine::new(backend), link)
}

fn null_pipeline(settings: &Settings, events: EventSender) -> NullPipeline {
    let fallback = settings
        .null_track_seconds
        .map(|seconds| Duration::from_secs(u64::from(seconds)));
    NullPipeline::new(events, fallback)
}

fn run_console(jukebox: &Jukebox, remote: &SimulatedRemote) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    writeln!(stdout, "type `help` for commands")?;

    for line in stdin.lock().lines() {
        let line = line.context("failed to read command")?;
        let (word, rest) = match line.trim().split_once(' ') {
            Some((word, rest)) => (word, rest.trim()),
            None => (line.trim(), ""),
        };

        let outcome = match word {
            "" => continue,
            "quit" | "exit" => break,
            "help" => {
                print_commands(&mut stdout)?;
                continue;
            }
            "list" => jukebox.list_tracks().map(|names| names.join("\n")),
            "play" => jukebox.play(rest).map(|track| format!("playing {}", track.name)),
            "pause" => jukebox.pause().map(|()| String::from("paused")),
            "resume" => jukebox.resume().map(|()| String::from("resumed")),
            "next" => jukebox.next().map(|track| format!("playing {}", track.name)),
            "prev" => jukebox
                .previous()
                .map(|track| format!("playing {}", track.name)),
            "start" => jukebox.start().map(|track| format!("playing {}", track.name)),
            "stop" => jukebox.stop().map(|()| String::from("stopped")),
            "status" => jukebox.current_status().map(|status| {
                serde_json::to_string(&status).unwrap_or_else(|_| format!("{status:?}"))
            }),
            "scan" => jukebox
                .start_discovery()
                .map(|()| String::from("discovering")),
            "rescan" => jukebox
                .rescan()
                .map(|count| format!("{count} tracks")),
            "key" => {
                match parse_key(rest) {
                    Some(key) => remote.press(key),
                    None => writeln!(stdout, "unknown key {rest}")?,
                }
                continue;
            }
            "drop" => {
                if !remote.drop_link() {
                    writeln!(stdout, "no link to drop")?;
                }
                continue;
            }
            other => {
                writeln!(stdout, "unknown command {other}")?;
                continue;
            }
        };

        match outcome {
            Ok(message) => writeln!(stdout, "{message}")?,
            Err(err) => writeln!(stdout, "error: {err}")?,
        }
    }
    Ok(())
}

fn parse_key(name: &str) -> Option<PassthroughKey> {
    let key = match name {
        "play" => PassthroughKey::Play,
        "pause" => PassthroughKey::Pause,
        "stop" => PassthroughKey::Stop,
        "fwd" | "forward" => PassthroughKey::Forward,
        "back" | "backward" => PassthroughKey::Backward,
        _ => return None,
    };
    Some(key)
}

fn print_commands(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "  list | play <name> | pause | resume | next | prev")?;
    writeln!(out, "  start | stop | status | scan | rescan")?;
    writeln!(out, "  key <play|pause|stop|fwd|back>   remote key on the sink")?;
    writeln!(out, "  drop                             simulate link loss")?;
    writeln!(out, "  quit")
}

fn parse_args(args: Vec<String>) -> anyhow::Result<CliArgs> {
    let mut out = CliArgs::default();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--config" => {
                index += 1;
                out.config_dir = Some(PathBuf::from(required(&args, index, "--config")?));
            }
            "--music" => {
                index += 1;
                out.music_dir = Some(PathBuf::from(required(&args, index, "--music")?));
            }
            "--target" => {
                index += 1;
                out.target = Some(required(&args, index, "--target")?.to_string());
            }
            "--null-output" => out.null_output = true,
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument {other}"),
        }
        index += 1;
    }
    Ok(out)
}

fn required<'a>(args: &'a [String], index: usize, flag: &str) -> anyhow::Result<&'a str> {
    let Some(value) = args.get(index) else {
        anyhow::bail!("{flag} requires a value");
    };
    let value = value.trim();
    if value.is_empty() {
        anyhow::bail!("{flag} cannot be empty");
    }
    Ok(value)
}

fn print_help() {
    println!("sdtune");
    println!("  --config <dir>    Settings and store directory");
    println!("  --music <dir>     Directory to scan for tracks");
    println!("  --target <name>   Bluetooth sink name to connect to");
    println!("  --null-output     Play against a silent clock instead of a speaker");
}
