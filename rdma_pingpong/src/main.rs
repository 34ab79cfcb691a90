/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use rdma_pingpong::CancelToken;
use rdma_pingpong::ExitStatus;
use rdma_pingpong::LoopbackFabric;
use rdma_pingpong::PingPongConfig;
use rdma_pingpong::PingPongError;
use rdma_pingpong::Session;
use rdma_pingpong::report::Units;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rdma_pingpong", version, about = "RDMA send/receive ping-pong benchmark")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = r#"Run one side of a ping-pong over RDMA. Without REMOTE, wait for a peer"#)]
    Run(RunCommand),

    #[clap(about = r#"Run both sides in this process over the loopback fabric"#)]
    Loopback(LoopbackCommand),

    #[clap(about = r#"List RDMA devices"#)]
    Devices,
}

#[derive(clap::Args, Debug)]
struct RunCommand {
    /// Host to connect to.
    remote: Option<String>,

    #[command(flatten)]
    args: SessionArgs,
}

#[derive(clap::Args, Debug)]
struct LoopbackCommand {
    #[command(flatten)]
    args: SessionArgs,

    /// Window for the initiator side; `--window` serves the responder.
    #[arg(long)]
    initiator_window: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct SessionArgs {
    /// Bytes exchanged per half-cycle.
    #[arg(long, short = 's')]
    size: Option<usize>,

    /// Number of full cycles.
    #[arg(long, short = 'n')]
    iters: Option<usize>,

    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Spin on the buffer contents before waiting for each receive completion.
    #[arg(long)]
    busy_wait: bool,

    /// Send the buffer as it is instead of stamping the pattern first.
    #[arg(long)]
    no_overwrite: bool,

    /// Copy between the external window and a host buffer on every transfer.
    #[arg(long, conflicts_with = "peer_direct")]
    copy_through: bool,

    /// Register the external window itself.
    #[arg(long)]
    peer_direct: bool,

    /// File or device node backing the external window.
    #[arg(long)]
    window: Option<PathBuf>,

    /// Bound on every completion and busy-wait (e.g. "500ms", "10s").
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// YAML file layered between the defaults and the environment.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Report sizes and rates in powers of 1024.
    #[arg(long)]
    binary_units: bool,
}

impl SessionArgs {
    /// Defaults, then the config file, then the environment, then flags.
    fn resolve(&self, remote: Option<String>) -> anyhow::Result<PingPongConfig> {
        let mut config = match &self.config {
            Some(path) => PingPongConfig::from_yaml_file(path)?,
            None => PingPongConfig::default(),
        };
        config.apply_env();

        if let Some(size) = self.size {
            config.size = size;
        }
        if let Some(iters) = self.iters {
            config.iterations = iters;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if remote.is_some() {
            config.remote = remote;
        }
        if self.busy_wait {
            config.busy_wait = true;
        }
        if self.no_overwrite {
            config.always_overwrite = false;
        }
        if self.copy_through {
            config.copy_through = true;
        }
        if self.peer_direct {
            config.peer_direct = true;
        }
        if let Some(window) = &self.window {
            config.window_path = Some(window.clone());
        }
        if let Some(timeout) = self.timeout {
            config.completion_timeout = timeout;
            config.busy_wait_timeout = timeout;
        }
        Ok(config)
    }

    fn units(&self) -> Units {
        if self.binary_units {
            Units::Binary
        } else {
            Units::Si
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Cancels the session on SIGINT or SIGTERM.
fn install_cancel() -> CancelToken {
    let cancel = CancelToken::new();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, cancel.flag()) {
            tracing::warn!("failed to install handler for signal {}: {}", signal, e);
        }
    }
    cancel
}

fn fail(err: PingPongError) -> ExitStatus {
    let status = err.exit_status();
    tracing::error!("{} [{}]", err, status);
    status
}

fn resolve_config(args: &SessionArgs, remote: Option<String>) -> Result<PingPongConfig, ExitStatus> {
    let config = args.resolve(remote).map_err(|e| {
        tracing::error!("{:#}", e);
        ExitStatus::BadArgs
    })?;
    config.validate().map_err(fail)?;
    Ok(config)
}

#[cfg(feature = "verbs")]
fn run_verbs(command: RunCommand, cancel: CancelToken) -> Result<(), ExitStatus> {
    let config = resolve_config(&command.args, command.remote)?;
    let device = rdma_pingpong::devices::first_usable_device().map_err(fail)?;
    tracing::info!("using RDMA device {}", device.name);

    let report = Session::new(rdma_pingpong::verbs::RdmaCmFabric, config)
        .and_then(|session| session.with_cancel(cancel).run())
        .map_err(fail)?;
    println!("{}", report.display(command.args.units()));
    Ok(())
}

#[cfg(not(feature = "verbs"))]
fn run_verbs(command: RunCommand, _cancel: CancelToken) -> Result<(), ExitStatus> {
    resolve_config(&command.args, command.remote)?;
    tracing::error!("built without the `verbs` feature; only `loopback` is available");
    Err(ExitStatus::NoRdmaDevice)
}

fn run_loopback(command: LoopbackCommand, cancel: CancelToken) -> Result<(), ExitStatus> {
    let config = resolve_config(&command.args, None)?;
    let units = command.args.units();
    let (responder, initiator) = config
        .loopback_pair(command.initiator_window)
        .map_err(fail)?;
    let fabric = LoopbackFabric::new();

    let responder = Session::new(fabric.clone(), responder)
        .map_err(fail)?
        .with_cancel(cancel.clone());
    let initiator = Session::new(fabric, initiator)
        .map_err(fail)?
        .with_cancel(cancel.clone());

    let server = std::thread::Builder::new()
        .name("responder".to_string())
        .spawn(move || responder.run())
        .map_err(|e| {
            tracing::error!("failed to spawn responder thread: {}", e);
            ExitStatus::RunProblem
        })?;

    let client = initiator.run();
    if client.is_err() {
        // Unblock a responder still waiting on the connection or a completion.
        cancel.cancel();
    }
    let server = server.join().unwrap_or_else(|_| {
        Err(PingPongError::Cancelled("responder thread"))
    });

    let server = server.map_err(fail);
    let client = client.map_err(fail);
    let server = server?;
    let client = client?;
    println!("{}", server.display(units));
    println!("{}", client.display(units));
    Ok(())
}

#[cfg(feature = "verbs")]
fn list_devices() -> Result<(), ExitStatus> {
    let devices = rdma_pingpong::devices::get_all_devices();
    if devices.is_empty() {
        return Err(fail(PingPongError::NoDevice));
    }
    for device in devices {
        print!("{}", device);
    }
    Ok(())
}

#[cfg(not(feature = "verbs"))]
fn list_devices() -> Result<(), ExitStatus> {
    tracing::error!("built without the `verbs` feature; no devices to list");
    Err(ExitStatus::NoRdmaDevice)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Run(command) => run_verbs(command, install_cancel()),
        Command::Loopback(command) => run_loopback(command, install_cancel()),
        Command::Devices => list_devices(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(status) => status.into(),
    }
}
