use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rustpill_lib::transport::available_ports;
use rustpill_lib::{ClientConfig, HeaterClient, Link, SerialConfig, ServoClient, ServoConfig};

/// One-shot control of a rustpill board: servo channels and the PID heater.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port the board is attached to (e.g. /dev/ttyACM0).
    /// Without it the board is looked up by USB serial number or product string.
    #[arg(short, long, env = "RUSTPILL_PORT")]
    port: Option<String>,
    /// USB serial number of the board to use when several are attached.
    /// Ignored when --port is given.
    #[arg(long = "serial", env = "RUSTPILL_SERIAL")]
    serial_number: Option<String>,
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,
    /// JSON file with client settings; the flags below override it.
    #[arg(long)]
    client_config: Option<PathBuf>,
    /// Response deadline per attempt, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Extra attempts for requests that are safe to repeat.
    #[arg(long)]
    retries: Option<u32>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// List serial ports on this host.
    Ports,
    /// Check the link with echo requests.
    Ping {
        #[arg(default_value_t = 2137)]
        token: u16,
        #[arg(short, long, default_value_t = 2)]
        count: u16,
    },
    /// Print the board's unique id.
    Id,
    /// Print the PWM configuration of every channel.
    Config {
        #[arg(long)]
        json: bool,
    },
    /// Calibrate a channel: duty cycles at 0° and 180°.
    Configure {
        channel: u8,
        min: u32,
        max: u32,
        /// Bounds are pulse widths in microseconds instead of raw duty cycles.
        #[arg(long)]
        us: bool,
    },
    /// Move a servo; without --channel the sole configured channel is used.
    SetAngle {
        angle: u8,
        #[arg(short, long)]
        channel: Option<u8>,
    },
    /// Read a servo position.
    GetAngle {
        #[arg(short, long)]
        channel: Option<u8>,
    },
    /// Change the PWM frequency. The board disables every channel.
    Frequency { hz: u32 },
    #[command(subcommand)]
    Heater(HeaterAction),
}

#[derive(Subcommand, Debug)]
enum HeaterAction {
    /// Hand the heater to the PI controller.
    Enable,
    Disable,
    /// Open-loop duty in per-mille (0-1000).
    Duty { duty: u16 },
    /// Stage new gains; they take effect on the next recalc.
    Pid {
        kp: f32,
        ki: f32,
        #[arg(long, default_value_t = 0.0)]
        kd: f32,
        /// Run a controller step right away so the gains go live.
        #[arg(long)]
        commit: bool,
    },
    /// Run one controller step, committing staged gains.
    Recalc,
    /// Print the controller state.
    Vals {
        #[arg(long)]
        json: bool,
    },
    Setpoint { value: f32 },
    /// Clear the integrator.
    Reset,
}

fn setup_logging(
    log_file_path: Option<PathBuf>,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path)
            .with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, -v for DEBUG (wire bytes), -vv for TRACE
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn client_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.client_config {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open client config at: {:?}", path))?;
            serde_json::from_reader(file)
                .with_context(|| format!("Failed to parse client config at: {:?}", path))?
        }
        None => ClientConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config = config.with_response_timeout(Duration::from_millis(ms));
    }
    if let Some(retries) = cli.retries {
        config = config.with_max_retries(retries);
    }
    Ok(config)
}

fn open_link(cli: &Cli) -> Result<Link> {
    let config = client_config(cli)?;
    debug!(?config, "Client settings");
    let link = match cli.port.as_deref() {
        Some(port) => Link::open(SerialConfig::new(port).with_baud_rate(cli.baud), config)
            .with_context(|| format!("Failed to open {}", port))?,
        None => Link::discover(
            cli.serial_number.as_deref(),
            SerialConfig::default().with_baud_rate(cli.baud),
            config,
        )
        .context("Failed to find the board. Pass --port or --serial")?,
    };
    info!(baud = cli.baud, "Connected");
    Ok(link)
}

fn print_config(config: &ServoConfig) {
    println!("PWM frequency: {} Hz (max duty {})", config.frequency_hz, config.max_duty_cycle);
    for channel in &config.channels {
        let state = if channel.enabled { "on" } else { "off" };
        match channel.calibration() {
            Some(calibration) => println!(
                "  {} | {:>3}° duty {:>5} | {}",
                calibration,
                calibration.to_angle(channel.current_duty_cycle),
                channel.current_duty_cycle,
                state
            ),
            None => println!("  CH{}: not calibrated | {}", channel.channel, state),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(&cli) {
        error!("{:?}", e);
        process::exit(1);
    }

    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Action::Ports => {
            let ports = available_ports().context("Failed to list serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found.");
            }
            for port in ports {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}  {:04x}:{:04x}  {} {}  S/N {}",
                        port.port_name,
                        vid,
                        pid,
                        port.manufacturer.as_deref().unwrap_or("-"),
                        port.product.as_deref().unwrap_or("-"),
                        port.serial_number.as_deref().unwrap_or("-")
                    ),
                    _ => println!("{}", port.port_name),
                }
            }
        }
        Action::Ping { token, count } => {
            let link = open_link(cli)?;
            for i in 0..*count {
                let sent = token.wrapping_add(i);
                let echoed = link.ping(sent).context("Ping failed")?;
                println!("pong {}", echoed);
            }
        }
        Action::Id => {
            let identity = open_link(cli)?.get_id().context("Failed to read board id")?;
            println!("Serial number: {}", identity.serial_number());
            if let Some(id) = identity.as_u128() {
                println!("As integer:    {}", id);
            }
        }
        Action::Config { json } => {
            let servo = ServoClient::connect(open_link(cli)?)?;
            let config = servo.config().context("Board returned no configuration")?;
            if *json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print_config(config);
            }
        }
        Action::Configure { channel, min, max, us } => {
            let mut servo = ServoClient::connect(open_link(cli)?)?;
            let (min, max) = if *us {
                (servo.us_to_duty_cycle(*min), servo.us_to_duty_cycle(*max))
            } else {
                (
                    u16::try_from(*min).context("Duty cycle must fit in 16 bits")?,
                    u16::try_from(*max).context("Duty cycle must fit in 16 bits")?,
                )
            };
            servo
                .configure_channel(*channel, min, max)
                .with_context(|| format!("Failed to configure channel {}", channel))?;
            println!("CH{}: {}..{} duty", channel, min, max);
        }
        Action::SetAngle { angle, channel } => {
            let mut servo = ServoClient::connect(open_link(cli)?)?;
            let duty = match channel {
                Some(channel) => servo.set_angle(*channel, *angle)?,
                None => servo.set_angle_default(*angle)?,
            };
            println!("{}° (duty {})", angle, duty);
        }
        Action::GetAngle { channel } => {
            let mut servo = ServoClient::connect(open_link(cli)?)?;
            let angle = match channel {
                Some(channel) => servo.get_angle(*channel)?,
                None => servo.get_angle_default()?,
            };
            println!("{}°", angle);
        }
        Action::Frequency { hz } => {
            let mut servo = ServoClient::new(open_link(cli)?)?;
            let config = servo.set_frequency(*hz).context("Failed to set PWM frequency")?;
            print_config(&config);
        }
        Action::Heater(action) => run_heater(HeaterClient::new(open_link(cli)?)?, action)?,
    }
    Ok(())
}

fn run_heater(mut heater: HeaterClient, action: &HeaterAction) -> Result<()> {
    match action {
        HeaterAction::Enable => heater.enable_heater()?,
        HeaterAction::Disable => heater.disable_heater()?,
        HeaterAction::Duty { duty } => heater
            .set_heater_duty(*duty)
            .context("Failed to set heater duty")?,
        HeaterAction::Pid { kp, ki, kd, commit } => {
            heater.set_pid_consts(*kp, *ki, *kd)?;
            if *commit {
                heater.recalc_pi()?;
                println!("Gains committed");
            } else {
                println!("Gains staged; run `heater recalc` to apply");
            }
        }
        HeaterAction::Recalc => {
            if let Some(constants) = heater.recalc_pi()? {
                println!("Committed kp {} ki {} kd {}", constants.kp, constants.ki, constants.kd);
            }
            let values = heater.get_pid_vals()?;
            println!("Output: {:.1}", values.output);
        }
        HeaterAction::Vals { json } => {
            let values = heater.get_pid_vals()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&values)?);
            } else {
                println!("{}", values);
            }
        }
        HeaterAction::Setpoint { value } => heater.set_setpoint(*value)?,
        HeaterAction::Reset => heater.reset_pid()?,
    }
    Ok(())
}
