#![allow(clippy::cognitive_complexity)]
use anyhow::anyhow;

mod startup_health;

use credential_store::{CredentialStore, memory::MemoryStore, sqlite::SqliteDb};
use external_api::{ExternalApi, Health};
use gateway_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    prelude::*,
    tokio::{runtime::Builder, signal},
};
use lease_registry::{LeaseRegistry, Replica};
use startup_health::verify_background_task_running;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.gateway_log, config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start server"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    // resolver lookups block
    let fqdn = tokio::task::spawn_blocking({
        let config = config.clone();
        move || config.replica_fqdn()
    })
    .await?
    .context("could not determine replica fqdn, set --replica-fqdn")?;
    let replica = Replica::new(fqdn);
    info!(%replica, "using replica identity");

    match config.store {
        StoreBackend::Sqlite => {
            info!(database_url = ?config.database_url, "using credential database");
            let store = SqliteDb::new(&config.database_url)
                .await
                .with_context(|| format!("failed to open {}", config.database_url))?;
            run(config, store, replica).await
        }
        StoreBackend::Memory => {
            warn!("using in-memory credential store, all state is lost on exit");
            run(config, MemoryStore::new(), replica).await
        }
    }
}

/// Serve the gateway over `store` until ctrl-c
async fn run<S>(config: cli::Config, store: S, replica: Replica) -> Result<()>
where
    S: CredentialStore + Clone,
{
    let registry = LeaseRegistry::new(store, replica)
        .with_store_timeout(config.store_timeout())
        .with_validity_window(config.enforce_validity_window);
    let flusher = Arc::new(registry.flush_coordinator());

    // claims recorded before a restart are stale
    for service in &config.flush_on_start {
        let count = flusher
            .flush(service)
            .await
            .with_context(|| format!("failed to flush leases for service {service}"))?;
        info!(%service, count, "flushed leases on start");
    }

    let api = ExternalApi::new(config.external_api, Arc::new(registry), Arc::clone(&flusher))
        .with_request_timeout(config.request_timeout());

    let token = CancellationToken::new();
    let api_sender = api.sender();
    let mut api_task = api.start(token.clone());

    // Keep health BAD until the api is confirmed running.
    if let Err(err) = verify_background_task_running("external API", &mut api_task).await {
        token.cancel();
        return Err(err.context("startup check failed"));
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    tokio::select! {
        res = shutdown_signal(token.clone()) => {
            res?;
            info!("received ctrl-c, shutting down");
        }
        res = &mut api_task => {
            token.cancel();
            return Err(match res {
                Ok(()) => anyhow!("external API exited unexpectedly"),
                Err(err) => anyhow!("external API panicked: {err}"),
            });
        }
    }

    let _ = api_sender.send(Health::Bad).await;
    if let Err(err) = api_task.await {
        error!(?err, "error waiting for web server API");
    }
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
