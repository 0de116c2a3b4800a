//! Run the optical table alignment loop against simulated hardware.
//!
//! Two simulated optical tables feed a simulated PSD; the telescope mount
//! slews periodically and each slew shifts the PSD spots, standing in for
//! flexure. The loop has to bring the spots back to nominal every time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use hardware::sim::{SimPlatform, SimPositioner, SimPsd};
use pas_control::{
    shared_platform, DeviceRegistry, DeviceType, Identity, PanelController, PasConfig, PasLogic,
    PositionerController, PsdController,
};
use pas_math::PanelType;
use tracing::{info, Level};

/// Optical table alignment loop on simulated hardware
#[derive(Parser, Debug)]
#[command(name = "pas_logic_sim")]
#[command(about = "Align two simulated optical tables on a simulated PSD")]
#[command(version)]
struct Args {
    /// JSON configuration file (defaults are used if omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Initial PSD spot offsets from the tables' start pose: x1 y1 x2 y2
    #[arg(long, num_args = 4, allow_negative_numbers = true, default_values_t = [0.5, -0.4, 0.0, 0.6])]
    offsets: Vec<f64>,

    /// Spot drift added to every channel on each slew
    #[arg(long, default_value = "0.35")]
    flexure: f64,

    /// Seconds between slews
    #[arg(long, default_value = "5")]
    slew_every: u64,

    /// Positioner polls each slew lasts
    #[arg(long, default_value = "3")]
    slew_polls: usize,

    /// Alignment loop poll interval in milliseconds (overrides the config)
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Total run time in seconds
    #[arg(long, default_value = "20")]
    run_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => PasConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PasConfig::default(),
    };
    if let Some(poll_ms) = args.poll_ms {
        config.logic.poll_interval_ms = poll_ms;
    }
    let offsets: [f64; 4] = args
        .offsets
        .as_slice()
        .try_into()
        .context("--offsets takes four values")?;

    let tables = [SimPlatform::homed(), SimPlatform::homed()];
    let psd = SimPsd::coupled(
        [tables[0].handle(), tables[1].handle()],
        config.logic.angular_scale,
        offsets,
    )?;
    let psd_handle = psd.handle();
    let positioner = SimPositioner::new(180.0, 45.0);
    let positioner_handle = positioner.handle();

    let mut registry = DeviceRegistry::new();
    for (table, position) in tables.into_iter().zip(config.logic.table_positions) {
        let id = Identity::new(DeviceType::Panel, position, format!("sim-ot-{position}"));
        let panel = PanelController::new(
            id,
            PanelType::Opt,
            shared_platform(table),
            config.panel.clone(),
        )?;
        registry.insert_panel(&Arc::new(Mutex::new(panel)))?;
    }
    registry.insert(&Arc::new(Mutex::new(PsdController::new(
        Identity::new(DeviceType::Psd, config.logic.psd_position, "sim-psd"),
        Box::new(psd),
        config.psd.clone(),
    ))))?;
    registry.insert(&Arc::new(Mutex::new(PositionerController::new(
        Identity::new(DeviceType::Positioner, config.logic.positioner_position, "sim-mount"),
        Box::new(positioner),
    ))))?;

    info!("Starting alignment loop for {} s", args.run_secs);
    let logic = PasLogic::new(Arc::new(registry), config.logic.clone());
    let terminate = Arc::new(AtomicBool::new(false));
    let worker = {
        let terminate = Arc::clone(&terminate);
        thread::spawn(move || logic.run(&terminate))
    };

    let start = Instant::now();
    let mut next_slew = Duration::from_secs(args.slew_every);
    while start.elapsed() < Duration::from_secs(args.run_secs) && !worker.is_finished() {
        if start.elapsed() >= next_slew {
            info!("Slewing; spots drift by {}", args.flexure);
            psd_handle.add_offsets(&[args.flexure; 4])?;
            positioner_handle.schedule_motion(args.slew_polls)?;
            next_slew += Duration::from_secs(args.slew_every);
        }
        thread::sleep(Duration::from_millis(50));
    }

    terminate.store(true, Ordering::Relaxed);
    match worker.join() {
        Ok(result) => result.context("alignment loop failed")?,
        Err(_) => anyhow::bail!("alignment loop panicked"),
    }
    info!(
        "Done after {} PSD reads",
        psd_handle.read_count().context("reading PSD statistics")?
    );
    Ok(())
}
