use super::progress::RunProgress;
use super::GlobalOpts;
use crate::output::Output;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use cinesync_config::{Config, CredentialStore, PathManager, TmdbCredentials};
use cinesync_core::{BatchFileStore, MovieStore, RunReport, SyncContext, SyncPipeline};
use cinesync_sources::{FailureTally, MovieLensLoader, TmdbClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Effective configuration for this invocation.
pub struct Settings {
    pub paths: PathManager,
    pub config: Config,
    pub config_file: PathBuf,
}

impl Settings {
    pub fn load(opts: &GlobalOpts) -> Result<Self> {
        let paths = PathManager::default();
        let config_file = opts.config.clone().unwrap_or_else(|| paths.config_file());
        let mut config = Config::load_or_default(&config_file)
            .map_err(|e| eyre!("Failed to load config from {}: {:#}", config_file.display(), e))?;

        if let Some(batch_size) = opts.batch_size {
            config.pipeline.batch_size = batch_size;
        }
        if let Some(workers) = opts.workers {
            config.pipeline.max_workers = workers;
        }
        config
            .validate()
            .map_err(|e| eyre!("Invalid configuration in {}: {:#}", config_file.display(), e))?;

        Ok(Self {
            paths,
            config,
            config_file,
        })
    }

    pub fn credential_store(&self) -> Result<CredentialStore> {
        let file = self.paths.credentials_file();
        let mut store = CredentialStore::new(file.clone());
        store
            .load()
            .map_err(|e| eyre!("Failed to load credentials from {}: {:#}", file.display(), e))?;
        Ok(store)
    }

    pub fn open_store(&self) -> Result<MovieStore> {
        let path = self.paths.database_file(&self.config);
        MovieStore::open(&path).wrap_err_with(|| format!("Failed to open movie store at {}", path.display()))
    }
}

/// What a command needs opened before it runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Requirements {
    pub catalog: bool,
    pub dataset: bool,
    pub batch_files: bool,
}

/// A pipeline wired to the configured catalog, store and dataset, with
/// Ctrl+C hooked to its cancellation token.
pub struct Session {
    pub pipeline: SyncPipeline,
    progress: Arc<RunProgress>,
}

impl Session {
    pub fn open(opts: &GlobalOpts, output: &Output, needs: Requirements) -> Result<Self> {
        let settings = Settings::load(opts)?;
        let config = &settings.config;

        let credentials = match settings.credential_store()?.tmdb_credentials() {
            Ok(credentials) => credentials,
            Err(e) if needs.catalog => return Err(eyre!("{}", e)),
            // Load-only runs never reach the catalog
            Err(_) => TmdbCredentials {
                api_key: None,
                bearer_token: None,
            },
        };

        let tally = Arc::new(FailureTally::new());
        let client = TmdbClient::new(&config.tmdb, &config.cache, credentials, Arc::clone(&tally))
            .map_err(|e| eyre!("Failed to create TMDB client: {:#}", e))?
            .with_movies_since_max_pages(config.pipeline.movies_since_max_pages);

        let store = settings.open_store()?;
        let progress = Arc::new(RunProgress::new(output.is_human() && !output.is_quiet()));
        let cancel = CancellationToken::new();
        install_interrupt_handler(cancel.clone());

        let mut ctx = SyncContext::new(Arc::new(client), store, tally)
            .with_cancel(cancel)
            .with_observer(progress.clone())
            .with_batch_size(config.pipeline.batch_size)
            .with_max_workers(config.pipeline.max_workers);

        if needs.dataset {
            let dir = settings.paths.movielens_dir(config);
            let loader = MovieLensLoader::load(&dir)
                .map_err(|e| eyre!("Failed to load MovieLens dataset from {}: {:#}", dir.display(), e))?;
            ctx = ctx.with_loader(Arc::new(loader));
        }
        if needs.batch_files {
            let dir = settings.paths.batch_dir(config);
            let batch_files = BatchFileStore::new(&dir)
                .map_err(|e| eyre!("Failed to prepare batch directory {}: {:#}", dir.display(), e))?;
            ctx = ctx.with_batch_files(batch_files);
        }

        Ok(Self {
            pipeline: SyncPipeline::new(ctx),
            progress,
        })
    }

    /// Clear the progress bars and turn the pipeline result into the
    /// command's result.
    pub fn finish(&self, result: anyhow::Result<RunReport>) -> Result<RunReport> {
        self.progress.finish();
        result.map_err(|e| eyre!("{:#}", e))
    }
}

fn install_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!(operation = "shutdown", "Interrupt received, finishing in-flight work");
                cancel.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}
