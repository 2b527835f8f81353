use anyhow::{bail, Error};
use clap::Parser;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, trace, Instrument};

use lakeq::api::{self, AppState};
use lakeq::blob::{BlobStore, FsBlobStore};
use lakeq::config::{ConfigContext, Role};
use lakeq::db::DbHandle;
use lakeq::queue::{JobQueue, MemoryQueue, PgJobQueue};
use lakeq::server::{self, WorkerDeps};
use lakeq::stats::QueueStatsReporter;
use lakeq::status::{
    spawn_purge, JobStatusStore, MemoryStatusBackend, PgStatusBackend, StatusBackend,
};
use lakeq::submit::JobSubmissionService;
use lakeq::table::{FsTableWriter, TableWriter};
use lakeq::telemetry;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let status_config = config.status();
    let queue_config = config.queue();

    let (backend, queue): (Arc<dyn StatusBackend>, Arc<dyn JobQueue>) = match &config.connect_url {
        Some(connect_url) => {
            trace!("Connecting to db:{}", connect_url);
            let handle = DbHandle::new(connect_url).await?;
            let backend: Arc<dyn StatusBackend> = Arc::new(PgStatusBackend::new(handle.clone()));
            let queue: Arc<dyn JobQueue> =
                Arc::new(PgJobQueue::declare(handle, queue_config).await?);
            (backend, queue)
        }
        None if config.role != Role::All => {
            bail!(
                "role {:?} needs --connect_url: the in-memory queue and status store are process-local",
                config.role
            );
        }
        None => {
            info!("No connect_url given, using in-memory queue and status store");
            let backend: Arc<dyn StatusBackend> = Arc::new(MemoryStatusBackend::default());
            let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new(queue_config.name));
            (backend, queue)
        }
    };
    spawn_purge(cancel_token.clone(), backend.clone(), PURGE_INTERVAL);
    let statuses = JobStatusStore::new(backend, &status_config);

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.blob_root));
    let tables: Arc<dyn TableWriter> = Arc::new(FsTableWriter::new(&config.lake_root));

    let mut tasks = vec![];

    if config.role.runs_workers() {
        let cancel_token = cancel_token.clone();
        let deps = WorkerDeps {
            queue: queue.clone(),
            blobs: blobs.clone(),
            tables,
            statuses: statuses.clone(),
            config: config.worker(),
        };
        let workers_count = config.num;
        tasks.push(tokio::spawn(
            async move {
                if let Err(err) = server::serve(cancel_token.clone(), deps, workers_count).await {
                    error!("Error starting server: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("server")),
        ));
    }

    if config.role.runs_api() {
        let cancel_token = cancel_token.clone();
        let state = AppState {
            submissions: JobSubmissionService::new(
                blobs,
                statuses.clone(),
                queue.clone(),
                config.submission(),
            ),
            statuses,
            reporter: QueueStatsReporter::new(queue.clone()),
            queue,
        };
        let api_config = config.api();
        tasks.push(tokio::spawn(
            async move {
                if let Err(err) = api::serve(cancel_token.clone(), api_config, state).await {
                    error!("Error starting HTTP server: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("api")),
        ));
    }

    debug!("Done starting components");
    println!("Waiting for server to shutdown...");
    futures::future::join_all(tasks)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Current dir: {:?}", env::current_dir()?);
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "lakeq=debug,tower_http=info");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); signal_token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); signal_token.cancel()},
            _ = signal_token.cancelled() => {},
        }
    });

    let result = app.await?;
    token.cancel();
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(result?)
}
