use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "wqm-cli")]
#[command(about = "WABA quality monitor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one trigger loop invocation against the schedules due now.
    Tick,
    /// Reconcile the given projects immediately, ignoring schedules.
    Reconcile {
        #[arg(long = "project", required = true)]
        projects: Vec<Uuid>,
    },
    Migrate,
    Serve,
}

fn init_tracing() {
    let json = std::env::var("WQM_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Tick) {
        Commands::Tick => {
            let result = wqm_sync::run_tick_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Reconcile { projects } => {
            let result = wqm_sync::run_projects_from_env(&projects).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Migrate => {
            wqm_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            wqm_web::serve_from_env().await?;
        }
    }

    Ok(())
}
