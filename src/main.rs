// src/main.rs
// Host process entry point and the single construction site: config file ->
// reactor -> MCU session -> steppers -> toolhead, then the event loop until
// the shutdown latch trips. Move requests normally arrive from the g-code
// front-end process; a `moves_file` option feeds a prepared motion list for
// standalone operation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use parking_lot::Mutex;

use printhost::configfile::Configfile;
use printhost::error::FatalEvent;
use printhost::kinematics::cartesian::CartesianKinematics;
use printhost::kinematics::AxisLimits;
use printhost::mcu::{McuSession, SessionHandle, CLOCK_QUERY_PERIOD};
use printhost::reactor::{Reactor, NEVER};
use printhost::serialhdl::TcpTransport;
use printhost::stepper::{StepDispatch, Stepper, StepperSync};
use printhost::toolhead::Toolhead;
use printhost::trapq::TrapQ;

const POLL_PERIOD: f64 = 0.050;
const FLUSH_PERIOD: f64 = 0.100;
const FEED_PERIOD: f64 = 0.250;
const STATS_PERIOD: f64 = 5.0;
const MOVES_PER_FEED: usize = 40;
const STEP_TOLERANCE: f64 = 0.000_025;

#[derive(Parser)]
#[command(name = "printhost", version, about = "Host-side motion control daemon")]
struct Args {
    /// Printer configuration file.
    config: PathBuf,
    /// Log file path; stderr when omitted.
    #[arg(long)]
    log: Option<PathBuf>,
}

fn init_logging(log_path: &Option<PathBuf>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_path {
        let file = std::fs::File::create(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// One parsed move request from a moves file: `x y z e feedrate` per line.
struct FileMove {
    pos: [f64; 4],
    speed: f64,
}

fn read_moves_file(path: &str) -> Result<Vec<FileMove>> {
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let mut moves = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<f64> = line
            .split_whitespace()
            .map(|f| f.parse::<f64>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("moves file line {}", lineno + 1))?;
        if fields.len() != 5 {
            return Err(anyhow!("moves file line {}: want 5 fields", lineno + 1));
        }
        moves.push(FileMove {
            pos: [fields[0], fields[1], fields[2], fields[3]],
            speed: fields[4],
        });
    }
    Ok(moves)
}

fn build_and_run(config: Configfile) -> Result<()> {
    let mut reactor = Reactor::new();
    let latch = reactor.shutdown_latch();

    // MCU session.
    let address = config
        .get("mcu", "address", None)
        .map_err(|e| anyhow!("{e}"))?;
    let transport = TcpTransport::connect(&address).map_err(|e| anyhow!("{e}"))?;
    let mut session =
        McuSession::connect("mcu", Box::new(transport), latch.clone()).map_err(|e| anyhow!("{e}"))?;

    // Steppers.
    let axis_sections = ["stepper_x", "stepper_y", "stepper_z"];
    let mut inverts = Vec::new();
    let mut step_dists = Vec::new();
    let mut limits = Vec::new();
    for section in axis_sections {
        let rotation_distance = config
            .getfloat(section, "rotation_distance", Some(40.0), Some(0.0), None)
            .map_err(|e| anyhow!("{e}"))?;
        let full_steps = config
            .getint(section, "full_steps_per_rotation", Some(200), Some(1), None)
            .map_err(|e| anyhow!("{e}"))?;
        let microsteps = config
            .getint(section, "microsteps", Some(16), Some(1), None)
            .map_err(|e| anyhow!("{e}"))?;
        let invert = config
            .getboolean(section, "invert_step", Some(false))
            .map_err(|e| anyhow!("{e}"))?;
        let pos_min = config
            .getfloat(section, "position_min", Some(0.0), None, None)
            .map_err(|e| anyhow!("{e}"))?;
        let pos_max = config
            .getfloat(section, "position_max", Some(200.0), Some(pos_min), None)
            .map_err(|e| anyhow!("{e}"))?;
        let axis_accel = config
            .getfloat(section, "max_accel", None, Some(0.0), None)
            .or_else(|_| config.getfloat("printer", "max_accel", None, Some(0.0), None))
            .map_err(|e| anyhow!("{e}"))?;
        inverts.push(invert);
        step_dists.push(rotation_distance / (full_steps * microsteps) as f64);
        limits.push(AxisLimits { min: pos_min, max: pos_max, max_accel: axis_accel });
    }

    let oids = session.configure_steppers(&inverts).map_err(|e| anyhow!("{e}"))?;
    let handle = SessionHandle::new(session);
    let mcu_freq = handle.mcu_freq();
    let max_error = (STEP_TOLERANCE * mcu_freq) as u32;

    let steppers: Vec<Stepper> = axis_sections
        .iter()
        .zip(oids.iter())
        .zip(step_dists.iter())
        .map(|((name, oid), dist)| Stepper::new(name, *oid, *dist, max_error, 1 << 16))
        .collect();

    // Kinematics and planner.
    let max_velocity = config
        .getfloat("printer", "max_velocity", None, Some(0.0), None)
        .map_err(|e| anyhow!("{e}"))?;
    let max_z_velocity = config
        .getfloat("printer", "max_z_velocity", Some(max_velocity / 20.0), Some(0.0), None)
        .map_err(|e| anyhow!("{e}"))?;
    let max_z_accel = config
        .getfloat("printer", "max_z_accel", Some(limits[2].max_accel / 20.0), Some(0.0), None)
        .map_err(|e| anyhow!("{e}"))?;
    let kin = CartesianKinematics::new(limits, max_z_velocity, max_z_accel);

    let trapq = Arc::new(Mutex::new(TrapQ::new()));
    let sync = StepperSync::new(Arc::clone(&trapq), steppers, Box::new(handle.clone()));
    let toolhead = Arc::new(Mutex::new(
        Toolhead::new(&config, Box::new(kin), trapq, Box::new(sync)).map_err(|e| anyhow!("{e}"))?,
    ));

    // Periodic work on the event loop.
    let clock_session = handle.clone();
    reactor.register_timer(
        CLOCK_QUERY_PERIOD,
        Box::new(move |r, now| {
            if clock_session.0.lock().clock_tick(now).is_err() {
                return NEVER;
            }
            r.monotonic() + CLOCK_QUERY_PERIOD
        }),
    );

    let poll_session = handle.clone();
    reactor.register_timer(
        POLL_PERIOD,
        Box::new(move |_r, now| {
            match poll_session.0.lock().poll_events(now) {
                Ok(()) => now + POLL_PERIOD,
                Err(_) => NEVER,
            }
        }),
    );

    let flush_toolhead = Arc::clone(&toolhead);
    let flush_session = handle.clone();
    let flush_latch = latch.clone();
    reactor.register_timer(
        FLUSH_PERIOD,
        Box::new(move |_r, now| {
            let mut th = flush_toolhead.lock();
            if let Err(e) = th.flush_handler(now) {
                if e.is_fatal() {
                    error!("{}", FatalEvent::new(&e, now, Some("mcu".to_string())));
                    th.drain();
                    flush_session.0.lock().emergency_stop();
                    flush_latch.trip();
                    return NEVER;
                }
            }
            now + FLUSH_PERIOD
        }),
    );

    let stats_session = handle.clone();
    reactor.register_timer(
        STATS_PERIOD,
        Box::new(move |_r, now| {
            info!("{}", stats_session.0.lock().stats());
            now + STATS_PERIOD
        }),
    );

    // Optional standalone move feed.
    if let Ok(path) = config.get("printer", "moves_file", None) {
        let mut moves = read_moves_file(&path)?.into_iter();
        info!("feeding moves from {path}");
        let feed_toolhead = Arc::clone(&toolhead);
        let feed_latch = latch.clone();
        reactor.register_timer(
            FEED_PERIOD,
            Box::new(move |_r, now| {
                let mut th = feed_toolhead.lock();
                for _ in 0..MOVES_PER_FEED {
                    let mv = match moves.next() {
                        Some(mv) => mv,
                        None => {
                            if let Err(e) = th.wait_moves(now) {
                                warn!("final flush failed: {e}");
                            }
                            info!("moves file complete");
                            feed_latch.trip();
                            return NEVER;
                        }
                    };
                    if let Err(e) = th.move_to(now, mv.pos, mv.speed) {
                        error!("{}", FatalEvent::new(&e, now, None));
                        feed_latch.trip();
                        return NEVER;
                    }
                }
                now + FEED_PERIOD
            }),
        );
    }

    info!("printhost ready; entering event loop");
    reactor.run();

    // Coordinated halt: quiesce motion, stop the MCU, let the worker drain.
    toolhead.lock().drain();
    {
        let mut session = handle.0.lock();
        session.request_shutdown("host exit");
        session.join();
    }
    info!("printhost exited");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log)?;
    let config = Configfile::read_file(&args.config)
        .map_err(|e| anyhow!("{e}"))
        .with_context(|| format!("loading {}", args.config.display()))?;
    build_and_run(config)
}
