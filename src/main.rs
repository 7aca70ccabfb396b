use clap::{Parser, Subcommand};
use instore_player::audio::{AudioSession, MemoryLineIn, MemorySession};
use instore_player::clock::{Clock, ManualClock, SystemClock};
use instore_player::config::PlayerConfig;
use instore_player::element::{Category, MediaRef};
use instore_player::error::{PlayerError, Result};
use instore_player::history::MusicHistory;
use instore_player::playlist::{MediaWindow, PlaylistBuilder};
use instore_player::repository::{JsonScheduleStore, RetryPolicy, RetryingRepository};
use instore_player::resources::SESSION_COUNT;
use instore_player::rodio_backend::{AudioOutput, SoftLineIn};
use instore_player::scheduler::{PlaybackScheduler, PlayerContext};
use instore_player::tags::{LoftyTagReader, TagReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "instore-player", about = "In-store broadcast controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play the schedule on the default audio device
    Run {
        /// Player configuration (TOML)
        #[arg(short, long, default_value = "player.toml")]
        config: PathBuf,
        /// Schedule tables (JSON)
        #[arg(short, long, default_value = "schedule.json")]
        schedule: PathBuf,
    },
    /// Run the scheduler against simulated outputs and a fast clock
    Simulate {
        #[arg(short, long, default_value = "player.toml")]
        config: PathBuf,
        #[arg(short, long, default_value = "schedule.json")]
        schedule: PathBuf,
        /// Number of one-second cycles to run
        #[arg(short = 'n', long, default_value = "600")]
        cycles: usize,
    },
    /// Build and print the playlist for a music source
    Playlist {
        /// Directory, .m3u, .mp3 or LineIn
        source: String,
        #[arg(short, long, default_value = "player.toml")]
        config: PathBuf,
        /// Schedule tables (JSON), for disabled and sub-category media
        #[arg(long)]
        schedule: Option<PathBuf>,
        #[arg(long)]
        shuffle: bool,
    },
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        config: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<PlayerConfig> {
    if path.exists() {
        PlayerConfig::load(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(PlayerConfig::default())
    }
}

fn run(config: PathBuf, schedule: PathBuf) -> Result<()> {
    let config = load_config(&config)?;
    config.check_dirs();
    let store = JsonScheduleStore::load(&schedule)?;
    let repo = RetryingRepository::new(
        store,
        RetryPolicy::from(&config.retry),
        Box::new(SystemClock::new()),
    )
    .on_still_alive(|attempt| tracing::info!(attempt, "still waiting for the schedule repository"));
    let tags = LoftyTagReader::with_cache(&config.tag_cache);

    let output = AudioOutput::new()?;
    let sessions = output.sessions(SESSION_COUNT)?;
    let ctx = PlayerContext::new(
        config,
        Box::new(repo),
        Box::new(tags),
        Box::new(SystemClock::new()),
        sessions,
        Box::new(SoftLineIn::default()),
    );
    let mut scheduler = PlaybackScheduler::new(ctx)?;
    scheduler.run()
}

fn simulate(config: PathBuf, schedule: PathBuf, cycles: usize) -> Result<()> {
    let config = load_config(&config)?;
    let store = JsonScheduleStore::load(&schedule)?;
    let tags = LoftyTagReader::with_cache(&config.tag_cache);
    let clock = ManualClock::starting_at(SystemClock::new().now());
    let sessions: Vec<Box<dyn AudioSession>> = (0..SESSION_COUNT)
        .map(|_| Box::new(MemorySession::new(clock.clone())) as Box<dyn AudioSession>)
        .collect();
    let ctx = PlayerContext::new(
        config,
        Box::new(store),
        Box::new(tags),
        Box::new(clock.clone()),
        sessions,
        Box::new(MemoryLineIn::new()),
    );
    let mut scheduler = PlaybackScheduler::new(ctx)?;

    let mut playing: Option<MediaRef> = None;
    let mut failures = 0;
    for _ in 0..cycles {
        if scheduler.run_cycle().is_err() {
            failures += 1;
        }
        let current = &scheduler.run_data().current;
        if current.loaded && playing.as_ref() != Some(&current.media) {
            println!(
                "{}  [{}] {}",
                clock.now().format("%H:%M:%S"),
                current.category,
                current.media
            );
            playing = Some(current.media.clone());
        }
    }
    println!(
        "{} cycles, {} handoffs, {} failed cycles",
        cycles,
        scheduler.handoffs(),
        failures
    );
    Ok(())
}

fn playlist(source: String, config: PathBuf, schedule: Option<PathBuf>, shuffle: bool) -> Result<()> {
    let config = load_config(&config)?;
    let store = match schedule {
        Some(path) => JsonScheduleStore::load(&path)?,
        None => JsonScheduleStore::new(Default::default()),
    };
    let tags = LoftyTagReader::with_cache(&config.tag_cache);
    let history = MusicHistory::new();
    let today = SystemClock::new().now().date();
    let builder = PlaylistBuilder::new(
        &store,
        &tags,
        &history,
        config.music_profile_source(),
        MediaWindow::today(today),
        config.repeat_prevention_percent,
    );
    let elements = builder.build(&source, Category::Music, shuffle, None)?;
    println!("Playlist '{}' ({} items):", source, elements.len());
    for (i, pe) in elements.iter().enumerate() {
        let desc = pe
            .media
            .path()
            .and_then(|p| tags.description(p).ok())
            .unwrap_or_else(|| pe.media.to_string());
        println!("  {:>3}. {}", i + 1, desc);
    }
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = PlayerConfig::load(&path)?;
    let missing = config.check_dirs();
    let text = toml::to_string_pretty(&config)
        .map_err(|e| PlayerError::Config(e.to_string()))?;
    println!("{}", text);
    if missing > 0 {
        println!("# {} media director{} missing", missing, if missing == 1 { "y is" } else { "ies are" });
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("instore_player=info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { config, schedule } => run(config, schedule),
        Commands::Simulate {
            config,
            schedule,
            cycles,
        } => simulate(config, schedule, cycles),
        Commands::Playlist {
            source,
            config,
            schedule,
            shuffle,
        } => playlist(source, config, schedule, shuffle),
        Commands::CheckConfig { config } => check_config(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
