use std::{io::Write, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use gazeguard_core::{
    channel, device::DeviceAdapter, engine::runtime, export, CommandChannel, ControlClient,
    DeviceRegistry, DeviceWorker, Engine, EngineConfig, EngineIo, GazeError, Timers,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::{broadcast, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const NOTICE_CAPACITY: usize = 64;

fn main() -> gazeguard_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Engine(args) => run_engine(args),
        Commands::Console { connect } => run_console(connect),
        Commands::Devices => {
            for id in DeviceRegistry::builtin().ids() {
                println!("{id}");
            }
            Ok(())
        }
    }
}

fn run_engine(args: EngineArgs) -> gazeguard_core::Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(device) = args.device {
        config.device.id = device;
    }
    if let Some(bind) = args.bind {
        config.control.bind = bind;
    }
    config.validate()?;

    // Device selection happens once, before anything else is started.
    let adapter = DeviceRegistry::builtin().select(&config.device)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve_engine(config, adapter))
}

async fn serve_engine(
    config: EngineConfig,
    adapter: Box<dyn DeviceAdapter>,
) -> gazeguard_core::Result<()> {
    let (device_tx, device_rx) = mpsc::unbounded_channel();
    let worker = DeviceWorker::spawn(adapter, device_tx)?;
    let engine = Engine::new(&config, worker.control())?;

    let cancel = CancellationToken::new();
    let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

    let listener = TcpListener::bind(&config.control.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "command channel listening");
    let (commands_tx, commands) = CommandChannel::bounded(config.control.queue_depth);
    let control = tokio::spawn(channel::serve(
        listener,
        commands_tx,
        notices.clone(),
        cancel.clone(),
    ));

    let (exports_tx, exports) = mpsc::channel(config.control.queue_depth);
    // `validate` refuses an export bind without a terminator secret.
    let exporter = match (&config.export.bind, &config.export.terminator_secret) {
        (Some(bind), Some(secret)) => {
            let listener = TcpListener::bind(bind).await?;
            tracing::info!(addr = %listener.local_addr()?, "export endpoint listening");
            Some(tokio::spawn(export::serve(
                listener,
                exports_tx,
                secret.clone(),
                cancel.clone(),
            )))
        }
        _ => {
            tracing::info!("export endpoint disabled");
            None
        }
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let io = EngineIo {
        commands,
        device: device_rx,
        exports,
        notices,
        cancel: cancel.clone(),
    };
    let timers = Timers {
        stimulus: config.stimulus.frame_interval(),
        reaper: config.store.reap_interval(),
    };
    let engine = runtime::run(engine, io, timers).await;

    cancel.cancel();
    if let Err(err) = control.await {
        tracing::warn!(error = %err, "command channel task failed");
    }
    if let Some(exporter) = exporter {
        if let Err(err) = exporter.await {
            tracing::warn!(error = %err, "export task failed");
        }
    }
    worker.shutdown();
    // Dropping the engine removes the store directory and everything in it.
    drop(engine);
    Ok(())
}

fn run_console(connect: String) -> gazeguard_core::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(console(connect))
}

async fn console(connect: String) -> gazeguard_core::Result<()> {
    let mut client = ControlClient::connect(connect.as_str())
        .await
        .map_err(|err| GazeError::msg(format!("cannot reach engine at {connect}: {err}")))?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut prompt = "[*] > ";

    loop {
        print!("{prompt}");
        std::io::stdout().flush()?;

        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let reply = client.request(line).await?;
                for notice in &reply.notices {
                    println!("* {notice}");
                }
                println!("{}", reply.text);
                prompt = if reply.ok { "[*] > " } else { "[!] > " };
                if reply.ok && line == "exit" {
                    break;
                }
            }
            notice = client.next_notice() => println!("\n* {}", notice?),
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Privilege-separated eye-tracking capture engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the privileged engine that owns the device and the store.
    Engine(EngineArgs),
    /// Open an interactive control surface against a running engine.
    Console {
        /// Address of the engine's command channel.
        #[arg(short, long, default_value = "127.0.0.1:55365")]
        connect: String,
    },
    /// List the registered device identifiers.
    Devices,
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Device identifier from the registry. Overrides the config file.
    #[arg(short, long)]
    device: Option<String>,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address for the command channel. Overrides the config file.
    #[arg(short, long)]
    bind: Option<String>,
}
