use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use glam::Vec2;
use streamer_common::{
    EntityClass, PlayerId, RespawnPolicy, StreamableEntityInfo, StreamingPlayer,
};
use streamer_core::{
    ManualClock, SettingsStore, SimulatedEngine, StreamSettings, StreamingCoordinator,
};
use streamer_grid::{GridRecord, SpatialGrid};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "streamer-cli", about = "CLI tool for the entity streamer")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (.yaml, .yml or .json); defaults apply when omitted
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and effective settings
    Info,
    /// Run a deterministic streaming simulation with wandering players
    Simulate {
        /// Number of definitions to scatter across the world
        #[arg(short, long, default_value = "5000")]
        entities: usize,
        /// Number of simulated players
        #[arg(short, long, default_value = "50")]
        players: usize,
        /// Number of streaming passes to run
        #[arg(short, long, default_value = "60")]
        ticks: u64,
        /// Seed for entity placement and player movement
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Time closest-N queries against a populated grid
    Bench {
        /// Number of records in the grid
        #[arg(short, long, default_value = "20000")]
        records: usize,
        /// Number of query points per pass
        #[arg(short, long, default_value = "300")]
        queries: usize,
        /// Results requested per query
        #[arg(short, long, default_value = "40")]
        count: usize,
    },
}

/// Splitmix64 sequence for reproducible placement and movement.
struct Sequence(u64);

impl Sequence {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform value in `[low, high)`.
    fn range(&mut self, low: f32, high: f32) -> f32 {
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        low + unit * (high - low)
    }

    fn point(&mut self, half_extent: f32) -> Vec2 {
        Vec2::new(
            self.range(-half_extent, half_extent),
            self.range(-half_extent, half_extent),
        )
    }
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<StreamSettings> {
    Ok(match path {
        Some(path) => StreamSettings::load(path)?,
        None => StreamSettings::default(),
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let settings = load_settings(cli.settings.as_ref())?;

    match cli.command {
        Commands::Info => {
            println!("streamer-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("core: {}", streamer_core::crate_info());
            println!("world size: {}", settings.world_size);
            for class in EntityClass::ALL {
                let c = settings.class(class);
                println!(
                    "{class}: stream distance {}, global ceiling {}, per-player ceiling {}",
                    c.stream_distance, c.global_capacity, c.per_player_capacity
                );
            }
            println!(
                "default respawn delay: {:?}, evaluation interval: {:?}",
                settings.default_respawn_delay(),
                settings.evaluation_interval()
            );
        }
        Commands::Simulate {
            entities,
            players,
            ticks,
            seed,
        } => simulate(settings, entities, players, ticks, seed)?,
        Commands::Bench {
            records,
            queries,
            count,
        } => bench(&settings, records, queries, count)?,
    }

    Ok(())
}

fn simulate(
    settings: StreamSettings,
    entities: usize,
    players: usize,
    ticks: u64,
    seed: u64,
) -> anyhow::Result<()> {
    println!("Simulation: {entities} definitions, {players} players, {ticks} passes, seed={seed}");

    let store = SettingsStore::new(settings)?;
    let clock = ManualClock::new();
    let engine = SimulatedEngine::new(store.clone());
    let mut coordinator = StreamingCoordinator::with_clock(store, engine, clock.clone())?;

    let mut rng = Sequence(seed);
    // Stay clear of the exclusive upper bound.
    let half = settings.world_size / 2.0 - 1.0;
    let mut vehicles = Vec::new();
    for i in 0..entities {
        let at = rng.point(half).extend(rng.range(0.0, 40.0));
        let info = match i % 3 {
            0 => StreamableEntityInfo::vehicle(400 + (i % 211) as u16, at)
                .with_rotation(rng.range(0.0, 360.0))
                .with_respawn(RespawnPolicy::After(Duration::from_secs(15))),
            1 => StreamableEntityInfo::object(1200 + (i % 5000) as u32, at),
            _ => StreamableEntityInfo::pickup(1240 + (i % 8) as u32, 2, at)
                .with_respawn(RespawnPolicy::from_secs(-1)),
        };
        let handle = coordinator.register(info, false)?;
        if i % 3 == 0 {
            vehicles.push(handle);
        }
    }

    let mut roster: Vec<StreamingPlayer> = (0..players)
        .map(|i| StreamingPlayer::outdoors(PlayerId(i as u32), rng.point(half).extend(10.0)))
        .collect();

    let interval = settings.evaluation_interval();
    let mut destroyed = 0usize;
    let mut respawned = 0usize;
    for tick in 0..ticks {
        for player in &mut roster {
            let step = Vec2::new(rng.range(-60.0, 60.0), rng.range(-60.0, 60.0));
            let next = (player.position.truncate() + step)
                .clamp(Vec2::splat(-half), Vec2::splat(half));
            player.position = next.extend(player.position.z);
        }

        let report = coordinator.update(&roster);
        respawned += report.respawned;

        // Wreck a live vehicle every few passes so respawn timers run.
        if tick % 5 == 4 {
            if let Some(handle) = vehicles.iter().copied().find(|h| coordinator.is_live(*h)) {
                if coordinator.report_destroyed(handle)? {
                    destroyed += 1;
                }
            }
        }

        if tick % 10 == 0 {
            tracing::info!(
                tick,
                vehicles = coordinator.live_count(EntityClass::Vehicle),
                objects = coordinator.live_count(EntityClass::Object),
                pickups = coordinator.live_count(EntityClass::Pickup),
                "streaming progress"
            );
        }
        clock.advance(interval);
    }

    for class in EntityClass::ALL {
        println!(
            "{class}: {} live of {} registered",
            coordinator.live_count(class),
            coordinator.definition_count(class)
        );
    }
    let timer = coordinator.pass_timer();
    println!(
        "passes: {} recent, avg {:?}, min {:?}, max {:?}",
        timer.count(),
        timer.average(),
        timer.min(),
        timer.max()
    );
    for class in EntityClass::ALL {
        println!(
            "  {class}: avg {:?}, max {:?}",
            timer.class_average(class),
            timer.class_max(class)
        );
    }
    if let Some(class) = timer.slowest_class() {
        println!("slowest class: {class}");
    }
    println!(
        "engine: {} spawned, {} destroyed; {destroyed} wrecked, {respawned} respawned",
        coordinator.engine().spawned_total(),
        coordinator.engine().destroyed_total()
    );
    Ok(())
}

fn bench(
    settings: &StreamSettings,
    records: usize,
    queries: usize,
    count: usize,
) -> anyhow::Result<()> {
    let stream_distance = settings.vehicles.stream_distance;
    let mut grid = SpatialGrid::new(settings.world_size, stream_distance)?;
    let mut rng = Sequence(7);
    let half = settings.world_size / 2.0 - 1.0;

    let start = Instant::now();
    for id in 0..records {
        grid.insert(GridRecord::outdoors(id, rng.point(half).extend(0.0)))?;
    }
    println!(
        "populate {records} records: {:?}, {} of {} cells occupied",
        start.elapsed(),
        grid.occupied_cells(),
        grid.width() * grid.width()
    );

    let points: Vec<Vec2> = (0..queries).map(|_| rng.point(half)).collect();
    let start = Instant::now();
    let mut found = 0usize;
    for point in &points {
        found += grid.closest(*point, count).len();
    }
    let elapsed = start.elapsed();
    println!(
        "closest(k={count}) x {queries}: {elapsed:?} total, {:?}/query, {found} results",
        elapsed / queries.max(1) as u32
    );

    Ok(())
}
