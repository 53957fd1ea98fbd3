use clap::Parser;

use conductor::args::{Cli, Command, DaemonAction};
use conductor::commands;
use conductor::output::Console;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let console = Console::stdout();
    if let Err(err) = run(cli, &console).await {
        console.error(format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, console: &Console) -> anyhow::Result<()> {
    match cli.command {
        Command::Daemon { action } => match action {
            DaemonAction::Run => commands::daemon_run(cli.socket).await,
            DaemonAction::Status => commands::daemon_status(console, cli.socket).await,
            DaemonAction::Shutdown => commands::daemon_shutdown(console, cli.socket).await,
        },
        Command::List => commands::list(console, cli.socket).await,
        Command::Start {
            name,
            command,
            args,
        } => commands::start(console, cli.socket, name, command, args).await,
        Command::Stop { name, force } => commands::stop(console, cli.socket, name, force).await,
        Command::Restart { name } => commands::restart(console, cli.socket, name).await,
        Command::Delete { name } => commands::delete(console, cli.socket, name).await,
        Command::Logs { name, lines } => commands::logs(console, cli.socket, name, lines).await,
    }
}
