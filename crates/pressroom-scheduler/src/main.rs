use anyhow::Context;
use clap::Parser;
use pressroom_scheduler::SchedulerBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let args = Args::parse();
    let pool = sqlx::PgPool::connect(&args.database_url)
        .await
        .context("failed to connect to the database")?;

    pressroom_scheduler::store::ensure_schema(&pool)
        .await
        .context("failed to prepare the pressroom schema")?;

    let mut scheduler = SchedulerBuilder::new(pool).build()?;

    // The monitors are detached daemons with no shutdown protocol, so a
    // plain exit is the whole story.
    tokio::task::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;

        tracing::info!("got Ctrl^C, shutting down");
        std::process::exit(0);
    });

    tracing::info!("pressroom beat starting up");
    scheduler.run().await
}
