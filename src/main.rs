use std::sync::Arc;
use std::time::Duration;

use dicom_arc::api::{self, AppState};
use dicom_arc::config::AppConfig;
use dicom_arc::context::ServerContext;
use dicom_arc::dimse::association::pool::AssociationPools;
use dicom_arc::dimse::control::ControlClient;
use dicom_arc::dimse::scp::{DimseServer, ScpState};
use dicom_arc::error::ArcError;
use dicom_arc::index::{GlobalProperty, Index};
use dicom_arc::jobs::{move_scu, peer_store, store_scu, JobFactories, JobsEngine};
use dicom_arc::query_retrieve::QueryRetrieveArchive;
use dicom_arc::storage::FilesystemStorage;

use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

const QUERY_ARCHIVE_CAPACITY: usize = 100;

fn init_logger(level: tracing::Level) -> Result<(), anyhow::Error> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

/// Registers one factory per job family so the registry snapshot can be
/// unserialized after a restart.
fn job_factories(context: &ServerContext, pools: &AssociationPools) -> JobFactories {
	let mut factories = JobFactories::new();

	{
		let context = context.clone();
		let pools = pools.clone();
		factories.register(
			store_scu::JOB_TYPE,
			Box::new(move |payload| {
				let remote = payload
					.get("Remote")
					.and_then(serde_json::Value::as_str)
					.ok_or_else(|| {
						ArcError::BadFileFormat(String::from("store job without Remote"))
					})?;
				let modality = context
					.config()
					.modality(remote)
					.ok_or_else(|| ArcError::InexistentItem(format!("modality {remote}")))?;
				let pool = pools
					.get(remote)
					.cloned()
					.ok_or_else(|| ArcError::InexistentItem(format!("modality {remote}")))?;
				let timeout = if modality.has_timeout() {
					Duration::from_millis(modality.timeout)
				} else {
					Duration::MAX
				};
				let job = store_scu::DicomModalityStoreJob::unserialize(
					context.clone(),
					pool,
					timeout,
					payload,
				)?;
				Ok(Box::new(job))
			}),
		);
	}

	{
		let context = context.clone();
		let pools = pools.clone();
		factories.register(
			move_scu::JOB_TYPE,
			Box::new(move |payload| {
				let remote = payload
					.get("Remote")
					.and_then(serde_json::Value::as_str)
					.ok_or_else(|| {
						ArcError::BadFileFormat(String::from("move job without Remote"))
					})?;
				let modality = context
					.config()
					.modality(remote)
					.cloned()
					.ok_or_else(|| ArcError::InexistentItem(format!("modality {remote}")))?;
				let pool = pools
					.get(remote)
					.cloned()
					.ok_or_else(|| ArcError::InexistentItem(format!("modality {remote}")))?;
				let client = ControlClient::new(pool, modality);
				let job = move_scu::DicomMoveScuJob::unserialize(client, payload)?;
				Ok(Box::new(job))
			}),
		);
	}

	{
		let context = context.clone();
		factories.register(
			peer_store::JOB_TYPE,
			Box::new(move |payload| {
				let job = peer_store::PeerStoreJob::unserialize(context.clone(), payload)?;
				Ok(Box::new(job))
			}),
		);
	}

	factories
}

/// Reloads the jobs registry persisted before the last shutdown or crash.
fn restore_jobs(context: &ServerContext, jobs: &JobsEngine, factories: &JobFactories) {
	let snapshot = context
		.index()
		.read(|t| t.get_global_property(GlobalProperty::JobsRegistry));

	match snapshot {
		Ok(Some(serialized)) => match serde_json::from_str(&serialized) {
			Ok(snapshot) => match jobs.restore(&snapshot, factories) {
				Ok(count) => info!("Restored {count} jobs from the previous run"),
				Err(err) => warn!("Failed to restore the jobs registry: {err}"),
			},
			Err(err) => warn!("Discarding malformed jobs registry snapshot: {err}"),
		},
		Ok(None) => {}
		Err(err) => warn!("Failed to read the jobs registry snapshot: {err}"),
	}
}

fn persist_jobs(context: &ServerContext, jobs: &JobsEngine) {
	let snapshot = jobs.snapshot().to_string();
	let result = context.index().write(&dicom_arc::index::NullListener, |t| {
		t.set_global_property(GlobalProperty::JobsRegistry, &snapshot)
	});
	if let Err(err) = result {
		warn!("Failed to persist the jobs registry: {err}");
	}
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = Arc::new(AppConfig::new()?);
	init_logger(config.telemetry.level)?;
	debug!("Config: {config:?}");

	std::fs::create_dir_all(&config.storage.path)?;
	let index = Index::open(&config.storage.path.join("index.db"), true)?;
	let storage = Arc::new(FilesystemStorage::new(config.storage.path.join("blobs")));

	let context = ServerContext::new(index, storage, Arc::clone(&config));
	let pools = AssociationPools::new(&config);

	let jobs = JobsEngine::new();
	let factories = job_factories(&context, &pools);
	restore_jobs(&context, &jobs, &factories);
	jobs.start(config.jobs.workers);

	// Periodic registry snapshots for crash recovery.
	{
		let context = context.clone();
		let jobs = jobs.clone();
		let interval = Duration::from_millis(config.jobs.persist_interval.max(1000));
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				persist_jobs(&context, &jobs);
			}
		});
	}

	// The DICOM SCP runs next to the HTTP server.
	{
		let scp = DimseServer::new(ScpState {
			context: context.clone(),
			jobs: jobs.clone(),
			pools: pools.clone(),
			config: Arc::clone(&config),
		});
		tokio::spawn(async move {
			if let Err(err) = scp.spawn().await {
				tracing::error!("DICOM server terminated: {err}");
			}
		});
	}

	let state = AppState {
		context: context.clone(),
		jobs: jobs.clone(),
		pools,
		queries: Arc::new(QueryRetrieveArchive::new(QUERY_ARCHIVE_CAPACITY)),
		config: Arc::clone(&config),
	};

	let http = &config.server.http;
	info!("Starting HTTP server on http://{}:{}", http.interface, http.port);

	let app = api::routes()
		.layer(tower_http::trace::TraceLayer::new_for_http())
		.with_state(state);

	let listener = tokio::net::TcpListener::bind((http.interface, http.port)).await?;
	axum::serve(listener, app)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!("Shutting down");
		})
		.await?;

	jobs.shutdown();
	persist_jobs(&context, &jobs);

	Ok(())
}
