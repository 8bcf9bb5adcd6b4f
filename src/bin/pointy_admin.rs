//! Pointy Admin CLI
//!
//! Maintenance against the shared PostgreSQL store:
//! 1. `migrate`: create the backing relation
//! 2. `sweep`: remove rows past their TTL
//! 3. `show`: print a session aggregate as JSON
//! 4. `release-lock`: force-delete a lock record left by a crashed holder
//! 5. `disconnect`: drop a dead connection and notify its sessions
//!
//! Usage:
//!   cargo run --features database,cli --bin pointy-admin -- sweep
//!   cargo run --features database,cli --bin pointy-admin -- show <session-id>
//!   cargo run --features database,cli --bin pointy-admin -- release-lock --session <session-id>

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use pointy_core::dispatch::HttpDispatcher;
use pointy_core::kv::{KvStore, PgKvStore, RecordKey};
use pointy_core::telemetry::init_tracing;
use pointy_core::session::rows::load_aggregate;
use pointy_core::{session_lock_key, CallContext, CoreConfig, Notifier};

/// Administration for the pointing session store
#[derive(Parser, Debug)]
#[command(name = "pointy-admin")]
#[command(about = "Inspect and repair the shared session store")]
struct Args {
    /// Database URL (defaults to DATABASE_URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Per-command timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the kv_records relation and indexes
    Migrate,

    /// Delete expired rows from the session and lock tables
    Sweep,

    /// Print a session aggregate
    Show {
        session_id: String,
        /// Include the facilitator key
        #[arg(long)]
        unredacted: bool,
    },

    /// Force-release a lock
    ReleaseLock {
        /// Raw lock id
        #[arg(long, conflicts_with = "session")]
        lock_id: Option<String>,
        /// Release the lock guarding this session
        #[arg(long)]
        session: Option<String>,
    },

    /// Remove every row referencing a connection and notify affected sessions
    Disconnect {
        connection_id: String,
        /// Connection-management endpoint (defaults to GATEWAY_ENDPOINT)
        #[arg(long, env = "GATEWAY_ENDPOINT")]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("pointy_core=info,pointy_admin=info");

    let args = Args::parse();
    let config = CoreConfig::from_env().context("invalid configuration")?;
    let database_url = args
        .database_url
        .clone()
        .or_else(|| config.database_url.clone())
        .context("DATABASE_URL must be set")?;

    let store = PgKvStore::connect(&database_url)
        .await
        .context("unable to connect to database")?;
    let ctx = CallContext::with_timeout(Duration::from_secs(args.timeout));

    match args.command {
        Command::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Command::Sweep => {
            let now = Utc::now();
            for table in [&config.session_table, &config.lock_table] {
                let removed = store.purge_expired(&ctx, table, now).await?;
                println!("{}: removed {} expired rows", table, removed);
            }
        }
        Command::Show {
            session_id,
            unredacted,
        } => {
            let Some(mut session) =
                load_aggregate(&store, &ctx, &config.session_table, &session_id).await?
            else {
                bail!("session {} not found", session_id);
            };
            if !unredacted {
                session.facilitator_session_key = String::new();
            }
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        Command::ReleaseLock { lock_id, session } => {
            let lock_id = match (lock_id, session) {
                (Some(id), _) => id,
                (None, Some(session_id)) => session_lock_key(&session_id),
                (None, None) => bail!("pass --lock-id or --session"),
            };
            store
                .delete(&ctx, &config.lock_table, &RecordKey::partition(lock_id.as_str()), None)
                .await?;
            println!("released {}", lock_id);
        }
        Command::Disconnect {
            connection_id,
            endpoint,
        } => {
            let Some(endpoint) = endpoint.or_else(|| config.gateway_endpoint.clone()) else {
                bail!("GATEWAY_ENDPOINT must be set to notify remaining watchers");
            };
            let kv: Arc<dyn KvStore> = Arc::new(store);
            let notifier = Notifier::from_config(kv, Arc::new(HttpDispatcher::new(endpoint)), &config);
            let report = notifier.disconnect(&ctx, &connection_id).await?;
            println!(
                "removed {} rows, notified {} sessions",
                report.rows_removed,
                report.sessions.len()
            );
        }
    }

    Ok(())
}
