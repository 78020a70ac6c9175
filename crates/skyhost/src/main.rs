//! skyhost CLI - manage game servers hosted by skyhostd

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod commands;
mod output;

use cli::{Cli, Commands, TaskCommand};
use commands::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    output::set_json_mode(cli.json);

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("skyhost={0},skyhost_ipc={0}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let client = get_client(cli.config.clone(), cli.socket.clone())?;

    let result = match cli.command {
        Commands::Ping => ping::execute(&client).await,
        Commands::List => list::execute(&client).await,
        Commands::Create(args) => server::create(&client, args).await,
        Commands::Delete { id } => server::delete(&client, &id).await,
        Commands::Start { id } => power::start(&client, &id).await,
        Commands::Stop { id, wait } => power::stop(&client, &id, wait).await,
        Commands::Kill { id } => power::kill(&client, &id).await,
        Commands::Install { id } => server::install(&client, &id).await,
        Commands::Stats { id } => power::stats(&client, &id).await,
        Commands::Status { id } => power::status(&client, &id).await,
        Commands::Console(args) => console::execute(&client, args).await,
        Commands::Send { id, command } => console::send(&client, &id, &command.join(" ")).await,
        Commands::Data { id } => data::show(&client, &id).await,
        Commands::Set(args) => data::set(&client, args).await,
        Commands::Backup { id } => backup::create(&client, &id).await,
        Commands::Backups { id } => backup::list(&client, &id).await,
        Commands::Restore { id, file } => backup::restore(&client, &id, &file).await,
        Commands::Task(args) => match args.command {
            TaskCommand::List { id } => task::list(&client, &id).await,
            TaskCommand::Add { id, name, file } => task::add(&client, &id, &name, &file).await,
            TaskCommand::Remove { id, name } => task::remove(&client, &id, &name).await,
            TaskCommand::Run { id, name } => task::run(&client, &id, &name).await,
        },
        Commands::Shutdown => shutdown::execute(&client).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
