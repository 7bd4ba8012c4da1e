use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use soundboard_engine::{
    audio::{
        devices::{CpalDevices, DeviceEnumerator},
        EventReceiver, CANONICAL_FORMAT,
    },
    state::{load_board, AppState},
    AudioEngine, EngineConfig, EngineEvent, PlayOptions, TileId,
};

/// Upper bound on a headless render, in frames (10 minutes).
const MAX_RENDER_FRAMES: usize = CANONICAL_FORMAT.sample_rate as usize * 600;
const RENDER_BLOCK_FRAMES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Devices,
    Play,
    Board,
    Render,
    Help,
}

#[derive(Debug)]
struct CliArgs {
    command: Command,
    monitor: Option<String>,
    inject: Option<String>,
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    volume: f32,
    cut: bool,
    positional: Vec<String>,
}

impl CliArgs {
    fn parse() -> Self {
        let mut args = Self {
            command: Command::Help,
            monitor: None,
            inject: None,
            config: None,
            out: None,
            volume: 1.0,
            cut: false,
            positional: Vec::new(),
        };
        let mut iter = env::args().skip(1);

        args.command = match iter.next().as_deref() {
            Some("devices") => Command::Devices,
            Some("play") => Command::Play,
            Some("board") => Command::Board,
            Some("render") => Command::Render,
            Some("help") | Some("--help") | Some("-h") | None => return args,
            Some(other) => {
                eprintln!("Unknown command: {other}");
                return args;
            }
        };

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--monitor" => args.monitor = iter.next(),
                "--inject" => args.inject = iter.next(),
                "--config" => args.config = iter.next().map(PathBuf::from),
                "--out" => args.out = iter.next().map(PathBuf::from),
                "--volume" => match iter.next().and_then(|v| v.parse::<f32>().ok()) {
                    Some(v) => args.volume = v.clamp(0.0, 1.0),
                    None => {
                        eprintln!("--volume requires a number between 0 and 1");
                        args.command = Command::Help;
                    }
                },
                "--cut" => args.cut = true,
                "--help" | "-h" => args.command = Command::Help,
                _ if arg.starts_with('-') => {
                    eprintln!("Unknown flag: {arg}");
                    args.command = Command::Help;
                }
                _ => args.positional.push(arg),
            }
        }
        args
    }

    fn print_help() {
        eprintln!(
            "Usage:\n\
             \x20 soundboard devices\n\
             \x20 soundboard play [options] <file>...\n\
             \x20 soundboard board [options] <board.json> <tile>...\n\
             \x20 soundboard render --out <file.wav> [options] <file>...\n\n\
             Options:\n\
             \x20 --monitor <name>    Monitor output device (default: system default)\n\
             \x20 --inject <name>     Inject output device (default: auto-detected virtual cable)\n\
             \x20 --config <file>     Engine config JSON\n\
             \x20 --volume <0..1>     Tile volume for played files\n\
             \x20 --cut               Each file stops the ones before it\n\
             \x20 -h, --help          Show this help\n"
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<(), String> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };

    match args.command {
        Command::Help => {
            CliArgs::print_help();
            Ok(())
        }
        Command::Devices => {
            list_devices();
            Ok(())
        }
        Command::Render => render(&args, config),
        Command::Play | Command::Board => {
            if args.positional.is_empty() {
                CliArgs::print_help();
                return Err("nothing to play".into());
            }
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| format!("Failed to build Tokio runtime: {e}"))?
                .block_on(play_live(&args, config))
        }
    }
}

fn list_devices() {
    let devices = CpalDevices.output_devices();
    if devices.is_empty() {
        println!("No output devices found");
    }
    for d in devices {
        let marker = if d.is_default { "*" } else { " " };
        println!("{marker} {}", d.name);
    }
}

fn file_options(args: &CliArgs) -> PlayOptions {
    PlayOptions {
        stop_others: args.cut,
        protected: false,
    }
}

// ── Live playback ─────────────────────────────────────────────────────────────

async fn play_live(args: &CliArgs, config: EngineConfig) -> Result<(), String> {
    let preload_limit = config.preload_limit;
    let (engine, mut events) = AudioEngine::new(config, Arc::new(CpalDevices));
    engine.initialize(args.monitor.as_deref(), args.inject.as_deref());
    if !engine.is_monitor_enabled() && !engine.is_inject_enabled() {
        return Err("no output device could be opened".into());
    }
    let _cleanup = AudioEngine::spawn_cleanup(&engine);

    let started = if args.command == Command::Board {
        trigger_board(args, Arc::clone(&engine), preload_limit).await?
    } else {
        let mut started = 0;
        for (i, file) in args.positional.iter().enumerate() {
            let tile = i as TileId + 1;
            if engine
                .play_file(tile, Path::new(file), args.volume, file_options(args))
                .is_ok()
            {
                started += 1;
            }
        }
        started
    };

    wait_for_stops(&mut events, started).await;
    engine.shutdown();
    Ok(())
}

async fn trigger_board(args: &CliArgs, engine: Arc<AudioEngine>, preload_limit: usize) -> Result<usize, String> {
    let (board_path, tiles) = args
        .positional
        .split_first()
        .ok_or("board mode needs a board file")?;
    let board = load_board(Path::new(board_path)).map_err(|e| e.to_string())?;
    let state = AppState::new(engine, board);

    let report = state.preload_tiles(preload_limit).await;
    log::info!("Board ready: {} clips decoded, {} failed", report.loaded, report.failed);

    let mut started = 0;
    for tile in tiles {
        let index: TileId = tile
            .parse()
            .map_err(|_| format!("tile index must be a number, got '{tile}'"))?;
        match state.trigger_tile(index) {
            Ok(()) => started += 1,
            Err(e) => log::warn!("Tile {index}: {e}"),
        }
    }
    Ok(started)
}

/// Print events until `expected` tiles have stopped.
async fn wait_for_stops(events: &mut EventReceiver, expected: usize) {
    let mut stopped = 0;
    while stopped < expected {
        match events.recv().await {
            Some(EngineEvent::TileStarted(id)) => log::info!("Tile {id} started"),
            Some(EngineEvent::TileStopped(id)) => {
                log::info!("Tile {id} stopped");
                stopped += 1;
            }
            Some(EngineEvent::Error(msg)) => log::error!("{msg}"),
            None => break,
        }
    }
}

// ── Headless render ───────────────────────────────────────────────────────────

fn render(args: &CliArgs, config: EngineConfig) -> Result<(), String> {
    let out_path = args.out.as_ref().ok_or("render needs --out <file.wav>")?;
    if args.positional.is_empty() {
        return Err("nothing to render".into());
    }

    let (engine, mut events) = AudioEngine::new(config, Arc::new(CpalDevices));
    engine.monitor_bus().bind_offline("render");

    for (i, file) in args.positional.iter().enumerate() {
        // Failures are reported on the event channel.
        let _ = engine.play_file(i as TileId + 1, Path::new(file), args.volume, file_options(args));
    }

    let spec = hound::WavSpec {
        channels: CANONICAL_FORMAT.channels,
        sample_rate: CANONICAL_FORMAT.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer =
        hound::WavWriter::create(out_path, spec).map_err(|e| format!("Cannot create {}: {e}", out_path.display()))?;

    let mut block = vec![0.0_f32; RENDER_BLOCK_FRAMES * CANONICAL_FORMAT.channels as usize];
    let mut frames = 0;
    while engine.active_voice_count() > 0 && frames < MAX_RENDER_FRAMES {
        engine.monitor_bus().render(&mut block);
        for &s in &block {
            writer.write_sample(s).map_err(|e| format!("WAV write error: {e}"))?;
        }
        frames += RENDER_BLOCK_FRAMES;
        engine.sweep();
    }
    writer.finalize().map_err(|e| format!("WAV finalize error: {e}"))?;

    while let Ok(event) = events.try_recv() {
        if let EngineEvent::Error(msg) = event {
            log::error!("{msg}");
        }
    }
    log::info!(
        "Rendered {:.2}s to {}",
        frames as f64 / CANONICAL_FORMAT.sample_rate as f64,
        out_path.display()
    );
    Ok(())
}
