use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use tracing::info;

use marketplace_ledger::{
    auth::{JwtKeys, Role},
    config,
    migrator::{self, Migrator},
};

#[derive(Parser)]
#[command(name = "ledgerctl", about = "Operator tooling for the marketplace ledger", version)]
struct Cli {
    /// Overrides the configured database URL
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand)]
    Migrate(MigrateCommands),
    /// Issues a caller token signed with the configured `jwt_secret`
    Token {
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value = "user")]
        role: Role,
        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Applies every pending migration
    Up,
    /// Rolls back the most recent migrations
    Down {
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
    /// Prints applied and pending migrations
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);
    let database_url = cli.database_url.unwrap_or_else(|| cfg.database_url.clone());

    match cli.command {
        Commands::Migrate(MigrateCommands::Up) => migrator::run_migration(&database_url).await?,
        Commands::Migrate(MigrateCommands::Down { steps }) => {
            migrator::rollback_migration(&database_url, steps).await?
        }
        Commands::Migrate(MigrateCommands::Status) => {
            let db = Database::connect(&database_url).await?;
            Migrator::status(&db).await?;
        }
        Commands::Token {
            user_id,
            role,
            ttl_minutes,
        } => {
            let token = JwtKeys::new(&cfg.jwt_secret)
                .issue(user_id, role, Duration::minutes(ttl_minutes))
                .context("failed to sign token")?;
            info!(user_id, %role, ttl_minutes, "token issued");
            println!("{}", token);
        }
    }

    Ok(())
}
