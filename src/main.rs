//! CLI Entry Point for daq-stream
//!
//! Provides a command-line interface for:
//! - Listing the configured devices and their capabilities
//! - Running one trial: every configured input records, every configured
//!   output plays a sine, outputs start synchronized to their start source
//!
//! # Usage
//!
//! ```bash
//! daq-stream info --config config/daq-stream.toml
//! daq-stream run --duration 2.0 --rate 1000
//! ```
//!
//! Ctrl-C interrupts a running trial.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_stream::acquire::Acquire;
use daq_stream::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use daq_stream::logging;
use daq_stream::registry::{register_builtin, DeviceRegistry};
use daq_stream::signal::{SignalDescriptor, SignalList};
use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "daq-stream")]
#[command(about = "Real-time analog I/O streaming for DAQ boards", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured devices
    Info,

    /// Run one trial on every configured device
    Run {
        /// Trial length in seconds
        #[arg(long, default_value = "1.0")]
        duration: f64,

        /// Sample rate in Hz for devices that do not inherit one
        #[arg(long, default_value = "1000")]
        rate: f64,

        /// Channels recorded per input device
        #[arg(long, default_value = "1")]
        channels: u32,

        /// Stimulus frequency in Hz
        #[arg(long, default_value = "10")]
        frequency: f32,

        /// Stimulus amplitude in volts
        #[arg(long, default_value = "1.0")]
        amplitude: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        EngineConfig::load_from(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };
    config.validate()?;
    logging::init_from_config(&config)?;

    let mut registry = DeviceRegistry::new();
    register_builtin(&mut registry);
    registry.open_all(&config.devices)?;

    let result = match cli.command {
        Commands::Info => {
            list_devices(&registry);
            Ok(())
        }
        Commands::Run {
            duration,
            rate,
            channels,
            frequency,
            amplitude,
        } => {
            let stimulus = Stimulus {
                duration,
                rate,
                channels,
                frequency,
                amplitude,
            };
            run_trial(&registry, &config, stimulus).await
        }
    };

    registry.close_all();
    result
}

fn list_devices(registry: &DeviceRegistry) {
    if registry.is_empty() {
        println!("No devices configured");
        return;
    }
    for device in registry.list_devices() {
        println!(
            "{:<12} {:<7} {:<11} {:<12} {}",
            device.ident, device.direction, device.driver, device.path, device.info
        );
    }
}

struct Stimulus {
    duration: f64,
    rate: f64,
    channels: u32,
    frequency: f32,
    amplitude: f32,
}

impl Stimulus {
    fn input_list(&self, device_channels: u32) -> SignalList {
        let mut list = SignalList::input().with_duration(self.duration);
        for channel in 0..self.channels.min(device_channels) {
            list.push(SignalDescriptor::new(channel).with_sample_rate(self.rate));
        }
        list
    }

    fn output_list(&self) -> SignalList {
        let n = (self.duration * self.rate).round() as usize;
        let data = (0..n)
            .map(|i| {
                let t = i as f32 / self.rate as f32;
                self.amplitude * (TAU * self.frequency * t).sin()
            })
            .collect();
        SignalList::output().with_signal(
            SignalDescriptor::new(0)
                .with_sample_rate(self.rate)
                .with_data(data),
        )
    }
}

async fn run_trial(registry: &DeviceRegistry, config: &EngineConfig, stimulus: Stimulus) -> Result<()> {
    let acquire = Arc::new(Acquire::from_registry(registry, &config.acquire));

    let inputs = registry.inputs();
    let mut input_lists: Vec<SignalList> = inputs
        .iter()
        .map(|d| stimulus.input_list(d.channels()))
        .collect();
    let mut output_lists: Vec<SignalList> = registry.outputs().iter().map(|_| stimulus.output_list()).collect();

    // Live view of the first input
    let monitor = inputs.first().map(|device| {
        let mut rx = device.subscribe(config.acquire.subscriber_capacity);
        let ident = device.ident().to_string();
        tokio::spawn(async move {
            let mut scans = 0usize;
            while let Some(batch) = rx.recv().await {
                scans += batch.n_scans();
                debug!(device = %ident, sequence = batch.sequence, scans, "Batch");
            }
        })
    });

    let failed = acquire.test_read(&mut input_lists) + acquire.test_write(&mut output_lists);
    if failed > 0 {
        for list in input_lists.iter().chain(output_lists.iter()) {
            if list.failed() {
                warn!(errors = %list.error_text(), "Signal list rejected");
            }
        }
        anyhow::bail!("{} signal(s) rejected", failed);
    }

    let stop = acquire.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping trial");
            stop.request_stop();
        }
    });

    let wait_timeout = config.acquire.wait_timeout + Duration::from_secs_f64(stimulus.duration);
    let trial = Arc::clone(&acquire);
    let (input_lists, output_lists, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = trial
            .start_read(&mut input_lists)
            .and_then(|()| trial.start_write(&mut output_lists))
            .and_then(|()| trial.wait(wait_timeout));
        (input_lists, output_lists, outcome)
    })
    .await?;
    ctrl_c.abort();

    let statuses = acquire.statuses();
    let signal_index = acquire.signal_index();
    acquire.reset()?;
    let reports = outcome?;

    for (list, device) in input_lists.iter().zip(inputs.iter()) {
        for sig in list.iter() {
            info!(
                device = %device.ident(),
                channel = sig.channel(),
                samples = sig.trace().len(),
                signal_index = ?sig.trace().signal_index(),
                "Recorded"
            );
        }
    }
    info!(
        outputs = output_lists.len(),
        pumps = reports.len(),
        signal_index = ?signal_index,
        "Trial complete"
    );
    for (ident, status) in statuses {
        println!("{:<12} {:?}", ident, status);
    }

    if let Some(monitor) = monitor {
        monitor.abort();
    }
    Ok(())
}
