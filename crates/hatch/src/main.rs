//! CLI for attaching to instance consoles.

use eyre::WrapErr as _;
use hatch_console::{ConsoleCoordinator, ConsoleMode, HostTerminal, ProxyBackend, Terminal as _};

#[derive(clap::Parser)]
#[command(name = "hatch", about = "Attach to the console of a running instance")]
struct Args {
    /// Enable debug logging to ~/.hatch/logs
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Attach to an instance console.
    Console {
        /// Instance name.
        instance: String,
        /// Console type: `console` for the text console, `vga` for SPICE.
        #[arg(short = 't', long = "type", default_value = "console")]
        console_type: String,
        /// Take over the console if another client holds it.
        #[arg(short, long)]
        force: bool,
        /// Print the console log instead of attaching.
        #[arg(long)]
        show_log: bool,
    },
}

fn setup_logging(debug: bool) -> eyre::Result<()> {
    if debug {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".hatch")
            .join("logs");
        std::fs::create_dir_all(&log_dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let log_path = log_dir.join(format!("{timestamp}.log"));
        let log_file = std::fs::File::create(&log_path)?;

        // The console owns the terminal, so logs never go to stderr here.
        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .init();

        eprintln!("debug log: {}", log_path.display());
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

/// Forward SIGWINCH as local size changes.
#[cfg(unix)]
fn watch_resize() -> eyre::Result<Option<hatch_console::control::ResizeEvents>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut winch =
        signal(SignalKind::window_change()).wrap_err("failed to watch terminal resizes")?;
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if let Some(size) = HostTerminal.size()
                && tx.send(size).is_err()
            {
                break;
            }
        }
    });
    Ok(Some(rx))
}

#[cfg(not(unix))]
fn watch_resize() -> eyre::Result<Option<hatch_console::control::ResizeEvents>> {
    Ok(None)
}

async fn run_console(
    instance: String,
    console_type: &str,
    force: bool,
    show_log: bool,
) -> eyre::Result<()> {
    let session = hatch_console::Session::new(instance, console_type, force, show_log)?;

    let config = hatch_config::load().wrap_err("failed to load hatch configuration")?;
    let keys = hatch_console::DetachKeys::try_from(&config.keybinds)
        .wrap_err("invalid detach keybinding")?;
    let hint = config.keybinds.describe()?;

    let client = hatch_client::Client::from_config(&config.daemon);
    tracing::debug!("using daemon at {}", client.socket().display());
    let coordinator = ConsoleCoordinator::new(
        hatch_client::DaemonConsole::new(client),
        HostTerminal,
        hatch_console::CommandViewer::new(&config.viewer),
    )
    .with_detach_keys(keys, hint)
    .with_proxy_backend(ProxyBackend::from_choice(config.proxy.backend));

    match session.mode {
        ConsoleMode::Text => {
            let resize = if session.show_log {
                None
            } else {
                watch_resize()?
            };
            coordinator
                .run(&session, resize)
                .await
                .wrap_err_with(|| format!("console of '{}' failed", session.instance))?;
        }
        ConsoleMode::Graphical => {
            // Ctrl-C is the only way out when no viewer window exists.
            let interrupt = hatch_console::DisconnectSignal::new();
            let on_ctrl_c = interrupt.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupted, closing graphical console");
                    on_ctrl_c.close(hatch_console::DisconnectReason::Detached);
                }
            });
            coordinator
                .with_interrupt(interrupt)
                .run(&session, None)
                .await
                .wrap_err_with(|| format!("console of '{}' failed", session.instance))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = <Args as clap::Parser>::parse();
    setup_logging(args.debug)?;

    let result = match args.command {
        Command::Console {
            instance,
            console_type,
            force,
            show_log,
        } => run_console(instance, &console_type, force, show_log).await,
    };

    // A blocked stdin read would otherwise hold up runtime shutdown.
    match result {
        Ok(()) => std::process::exit(0),
        Err(report) => {
            eprintln!("Error: {report:?}");
            std::process::exit(1);
        }
    }
}
