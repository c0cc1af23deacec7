use avbus::error::{BusError, BusResult};
use avbus::estimator::FusedState;
use avbus::fault_injection::{FaultInjectionConfig, FaultInjector, InjectedFault};
use avbus::fdir::FdirAction;
use avbus::node::{FlightNode, NodeContext};
use avbus::protocol::{decode_components, encode_components, Message, MissionTime, NodeId, TopicId};
use avbus::{FlightExecutive, ManualTime, MissionConfig, TelemetrySnapshot};
use clap::{App, Arg};
use colored::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;
use tracing::{error, info, Level};

const DEFAULT_PROFILE: &str = "profiles/demo.json";
const DEFAULT_FRAMES: &str = "1000";
const DEFAULT_SEED: &str = "42";
const DEFAULT_FAULT_RATE: &str = "1.0";
const ALTIMETERS: [&str; 3] = ["alt_a", "alt_b", "alt_c"];

// Simulated ascent profile
const START_ALTITUDE_M: f64 = 1000.0;
const CLIMB_RATE_M_S: f64 = 50.0;
const TARGET_ALTITUDE_M: f64 = 2000.0;

type SharedInjector = Arc<Mutex<FaultInjector>>;

fn true_altitude(now: MissionTime) -> f64 {
    START_ALTITUDE_M + CLIMB_RATE_M_S * now.as_secs_f64()
}

fn lock(injector: &SharedInjector) -> BusResult<std::sync::MutexGuard<'_, FaultInjector>> {
    injector
        .lock()
        .map_err(|_| BusError::InvalidState("fault injector lock poisoned"))
}

/// Radar altimeter replica. Reads the simulated truth and lets the fault
/// injector tamper with what it reports.
struct Altimeter {
    injector: SharedInjector,
    time: ManualTime,
    topic: Option<TopicId>,
}

impl FlightNode for Altimeter {
    fn step(&mut self, ctx: &mut NodeContext<'_>) -> BusResult<()> {
        let topic = match self.topic {
            Some(topic) => topic,
            None => *self.topic.insert(ctx.topic("altitude")?.id),
        };

        // Small deterministic noise, well inside the voting epsilon
        let noise = ((ctx.frame() * 7 + u64::from(ctx.id().0) * 13) % 21) as f64 / 100.0 - 0.1;
        let (reading, overrun_us) = {
            let injector = lock(&self.injector)?;
            (
                injector.apply_to_value(ctx.id(), true_altitude(ctx.now()) + noise),
                injector.overrun_us(ctx.id()),
            )
        };
        if overrun_us > 0 {
            self.time.advance(overrun_us);
        }

        let Some(altitude) = reading else {
            return Ok(());
        };
        ctx.publish_values(topic, &[altitude])?;
        ctx.heartbeat();
        Ok(())
    }
}

/// Altitude-hold guidance on top of the fused navigation state.
struct Guidance {
    nav: Option<TopicId>,
    thrust: Option<TopicId>,
    last_thrust: f64,
}

impl FlightNode for Guidance {
    fn step(&mut self, ctx: &mut NodeContext<'_>) -> BusResult<()> {
        let nav = match self.nav {
            Some(topic) => topic,
            None => *self.nav.insert(ctx.topic("nav_state")?.id),
        };
        let thrust = match self.thrust {
            Some(topic) => topic,
            None => *self.thrust.insert(ctx.topic("thrust_cmd")?.id),
        };

        let latest = ctx
            .deliveries_on(nav)
            .last()
            .map(|delivery| FusedState::decode(delivery.message.payload(), delivery.message.timestamp()))
            .transpose()?;
        if let Some(state) = latest {
            let altitude = state.state.first().copied().unwrap_or_default();
            let velocity = state.state.get(1).copied().unwrap_or_default();
            self.last_thrust = (0.02 * (TARGET_ALTITUDE_M - altitude) - 0.3 * velocity).clamp(-10.0, 10.0);
        }
        ctx.publish_values(thrust, &[self.last_thrust])?;
        ctx.heartbeat();
        Ok(())
    }

    fn restart(&mut self) {
        self.last_thrust = 0.0;
    }
}

/// Telemetry-class node summarising what reached the ground link.
struct Downlink {
    topic: Option<TopicId>,
}

impl FlightNode for Downlink {
    fn step(&mut self, ctx: &mut NodeContext<'_>) -> BusResult<()> {
        let topic = match self.topic {
            Some(topic) => topic,
            None => *self.topic.insert(ctx.topic("downlink")?.id),
        };
        let mut thrust = 0.0;
        let mut received = 0u32;
        for delivery in ctx.deliveries() {
            received += 1;
            if let Ok(values) = decode_components(delivery.message.payload()) {
                if values.len() == 1 {
                    thrust = values[0];
                }
            }
        }
        ctx.publish_values(topic, &[f64::from(received), thrust])?;
        ctx.heartbeat();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("avbus-sim")
        .version("0.1.0")
        .author("Space Systems Engineering Team")
        .about("Avionics bus mission simulator with deterministic fault injection")
        .arg(
            Arg::with_name("profile")
                .short("p")
                .long("profile")
                .value_name("FILE")
                .help("Mission profile (JSON)")
                .takes_value(true)
                .default_value(DEFAULT_PROFILE),
        )
        .arg(
            Arg::with_name("frames")
                .short("n")
                .long("frames")
                .value_name("COUNT")
                .help("Number of frames to run")
                .takes_value(true)
                .default_value(DEFAULT_FRAMES),
        )
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .value_name("SEED")
                .help("Fault injection seed")
                .takes_value(true)
                .default_value(DEFAULT_SEED),
        )
        .arg(
            Arg::with_name("fault-rate")
                .long("fault-rate")
                .value_name("PERCENT")
                .help("Chance per frame of a new injected fault")
                .takes_value(true)
                .default_value(DEFAULT_FAULT_RATE),
        )
        .arg(
            Arg::with_name("realtime")
                .short("r")
                .long("realtime")
                .help("Pace frames at the profile's frame period"),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print the final telemetry snapshot as JSON"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Verbose logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let profile = matches.value_of("profile").unwrap_or(DEFAULT_PROFILE);
    let frames: u64 = matches.value_of("frames").unwrap_or(DEFAULT_FRAMES).parse()?;
    let seed: u64 = matches.value_of("seed").unwrap_or(DEFAULT_SEED).parse()?;
    let fault_rate: f32 = matches.value_of("fault-rate").unwrap_or(DEFAULT_FAULT_RATE).parse()?;

    println!("{}", "Avionics Bus Simulator".bold());
    println!("======================");
    println!("profile: {}  frames: {}  seed: {}", profile.cyan(), frames, seed);

    let config = MissionConfig::from_file(profile)?;
    let time = ManualTime::new();
    let injector: SharedInjector = Arc::new(Mutex::new(FaultInjector::new_with_config(
        FaultInjectionConfig {
            enabled: fault_rate > 0.0,
            rate_percent: fault_rate,
            ..FaultInjectionConfig::default()
        },
        seed,
    )));

    let mut executive = FlightExecutive::from_config(&config, time.clone())?;
    let mut altimeters = Vec::new();
    for name in ALTIMETERS {
        altimeters.push(executive.attach(
            name,
            Box::new(Altimeter {
                injector: Arc::clone(&injector),
                time: time.clone(),
                topic: None,
            }),
        )?);
    }
    executive.attach(
        "gnc",
        Box::new(Guidance {
            nav: None,
            thrust: None,
            last_thrust: 0.0,
        }),
    )?;
    executive.attach(
        "downlink",
        Box::new(Downlink { topic: None }),
    )?;

    if let Err(e) = executive.start() {
        println!("{} {}", "schedule rejected:".red().bold(), e);
        return Err(e.into());
    }
    info!(frames, "mission started");

    let mut interval = matches
        .is_present("realtime")
        .then(|| time::interval(Duration::from_micros(config.frame_period_us)));

    for _ in 0..frames {
        if let Some(interval) = interval.as_mut() {
            interval.tick().await;
        }

        {
            let mut injector = lock(&injector)?;
            if let Some(active) = injector.update(&altimeters, true_altitude(executive.clock().now())) {
                println!(
                    "{} {:?} on {} for {} frames",
                    "INJECT".yellow(),
                    active.fault,
                    active.target,
                    active.frames_remaining
                );
            }
        }
        inject_link_corruption(&mut executive, &injector, &altimeters)?;

        let report = match executive.run_frame() {
            Ok(report) => report,
            Err(e) => {
                error!("frame failed: {}", e);
                println!("{} {}", "FRAME ERROR".red().bold(), e);
                break;
            }
        };
        for action in &report.actions {
            let line = format!("frame {:>6} {:?}", report.frame, action);
            match action {
                FdirAction::Quarantine(_) | FdirAction::Deschedule(_) | FdirAction::ShrinkQuorum { .. } => {
                    println!("{} {}", "ISOLATE".red(), line);
                }
                FdirAction::Restart(_) | FdirAction::Readmit(_) => println!("{} {}", "RECOVER".yellow(), line),
                FdirAction::Release(_) => println!("{} {}", "RELEASE".green(), line),
                FdirAction::Retire(_) => println!("{} {}", "RETIRE".red().bold(), line),
            }
        }
        if report.halted() {
            println!(
                "{} frame {}: {}",
                "SYSTEM_HALT".red().bold(),
                report.frame,
                executive.scheduler().halt_reason().unwrap_or("unknown")
            );
            break;
        }
    }

    let snapshot = TelemetrySnapshot::capture(&executive)?;
    print_summary(&snapshot);
    if matches.is_present("json") {
        println!("{}", snapshot.to_json()?);
    }
    Ok(())
}

/// Sends a bit-flipped copy of a reading over the link for every altimeter
/// with an active frame-corruption fault.
fn inject_link_corruption(
    executive: &mut FlightExecutive<ManualTime>,
    injector: &SharedInjector,
    altimeters: &[NodeId],
) -> BusResult<()> {
    let topic = executive.topic_id("altitude")?;
    let schema = executive.bus().spec(topic)?.schema;
    let now = executive.clock().now();

    for &node in altimeters {
        let frame = {
            let mut injector = lock(injector)?;
            if injector.fault_for(node) != Some(InjectedFault::CorruptFrame) {
                continue;
            }
            let payload = encode_components(&[true_altitude(now)])?;
            let mut frame = Message::new(topic, node, u64::MAX, now, schema, payload).encode();
            injector.corrupt(&mut frame);
            frame
        };
        if let Err(e) = executive.ingest_frame(&frame) {
            info!(node = %node, "link frame rejected: {}", e);
        }
    }
    Ok(())
}

fn print_summary(snapshot: &TelemetrySnapshot) {
    println!();
    println!("{}", "Mission summary".bold());
    println!("  time:        {}", snapshot.time);
    println!("  state:       {:?}", snapshot.scheduler_state);
    println!("  frames:      {}", snapshot.executive.frames);
    println!("  overruns:    {}", snapshot.executive.overruns);
    println!("  clock drift: {:.3} us", snapshot.clock_offset_us);
    if let Some(fused) = &snapshot.fused_state {
        println!("  nav state:   {:?} ({:?})", fused.state, fused.confidence);
    }
    println!(
        "  votes:       {} agreed / {} degraded / {} byzantine",
        snapshot.voter.agreed, snapshot.voter.insufficient, snapshot.voter.byzantine
    );
    if let Some(mtbf_s) = snapshot.mtbf_s {
        println!("  mtbf:        {:.3} s", mtbf_s);
    }

    println!("{}", "Nodes".bold());
    for node in &snapshot.nodes {
        let health = match node.health {
            Some(state) => format!("{:?}", state),
            None => "-".to_string(),
        };
        let health = if node.quarantined {
            health.red()
        } else {
            health.green()
        };
        println!(
            "  {:<10} {:<12} scheduled={} restarts={}",
            node.name, health, node.scheduled, node.restart_attempts
        );
    }

    println!("{} ({} records)", "Fault log".bold(), snapshot.fault_log.len());
    for record in snapshot.fault_log.iter().rev().take(10).rev() {
        println!(
            "  #{:<4} frame {:>6} node {:<6} {:?} -> {:?} ({:?})",
            record.id, record.frame, record.node, record.fault, record.action, record.outcome
        );
    }
}
