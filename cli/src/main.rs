use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_resource::{DataReader, Read, Resources, SourceFn};
use clap::Parser;
use color_eyre::eyre;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// User ids to fetch, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "1")]
    id: Vec<u32>,

    /// Number of readers requested per id
    #[arg(short, long, default_value_t = 3)]
    repeat: usize,

    /// Latency of the simulated API in milliseconds
    #[arg(short, long, default_value_t = 200)]
    delay_ms: u64,

    /// Make every API call fail
    #[arg(long)]
    fail: bool,
}

#[derive(Debug, Clone)]
struct User {
    id: u32,
    name: String,
}

#[derive(Debug, Error)]
#[error("User {0} not found")]
struct NotFound(u32);

fn fake_api(calls: Arc<AtomicUsize>, delay: Duration, fail: bool) -> SourceFn<(u32,), User, NotFound> {
    SourceFn::new(move |(id,): (u32,)| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            info!(id, "API call");
            tokio::time::sleep(delay).await;
            if fail {
                Err(NotFound(id))
            } else {
                Ok(User {
                    id,
                    name: format!("user-{id}"),
                })
            }
        }
    })
}

/// Reads until the reader settles, the same way a UI would retry after a suspension.
async fn render(reader: &DataReader<User, NotFound>) -> eyre::Result<String> {
    loop {
        match reader.read_with(|user| format!("#{} {}", user.id, user.name)) {
            Read::Suspended(suspension) => {
                debug!("Suspended, waiting for the API");
                suspension.await;
            }
            Read::Resolved(line) => return Ok(line),
            Read::Failed(err) => return Err(err.into()),
        }
    }
}

async fn render_all(resources: &Resources, api: &SourceFn<(u32,), User, NotFound>, cli: &Cli) -> eyre::Result<()> {
    let mut readers = Vec::new();
    for &id in &cli.id {
        for _ in 0..cli.repeat {
            readers.push((id, resources.initialize(api, (id,))?));
        }
    }

    let rendered = join_all(readers.iter().map(|(_, reader)| render(reader))).await;
    for ((id, _), line) in readers.iter().zip(rendered) {
        match line {
            Ok(line) => println!("{line}"),
            Err(err) => println!("#{id} failed: {err}"),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let calls = Arc::new(AtomicUsize::new(0));
    let api = fake_api(calls.clone(), Duration::from_millis(cli.delay_ms), cli.fail);
    let resources = Resources::new()?;

    render_all(&resources, &api, &cli).await?;
    println!("API calls after first pass: {}", calls.load(Ordering::SeqCst));

    // Everything is cached now, this pass must not hit the API
    render_all(&resources, &api, &cli).await?;
    println!("API calls after cached pass: {}", calls.load(Ordering::SeqCst));

    let Some(&first) = cli.id.first() else {
        return Ok(());
    };
    resources.invalidate(&api, &(first,))?;
    render_all(&resources, &api, &cli).await?;
    println!(
        "API calls after invalidating #{first}: {}",
        calls.load(Ordering::SeqCst)
    );

    Ok(())
}
