use super::progress::is_interactive;
use super::prompts;
use super::session::Settings;
use super::GlobalOpts;
use crate::output::Output;
use crate::ConfigCommands;
use cinesync_config::{mask, Config};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use comfy_table::{Cell, Color};
use owo_colors::OwoColorize;
use serde_json::json;

pub async fn run_config(cmd: ConfigCommands, opts: &GlobalOpts, output: &Output) -> Result<()> {
    match cmd {
        ConfigCommands::Show => show_config(opts, output),
        ConfigCommands::Init { force } => init_config(force, opts, output),
        ConfigCommands::Credentials { api_key, bearer_token } => {
            store_credentials(api_key, bearer_token, opts, output)
        }
    }
}

fn show_config(opts: &GlobalOpts, output: &Output) -> Result<()> {
    let settings = Settings::load(opts)?;
    let config = &settings.config;
    let credentials = settings.credential_store()?.tmdb_credentials().ok();
    let masked = |value: Option<&String>| value.map(|v| mask(v)).unwrap_or_else(|| "not set".to_string());
    let api_key = masked(credentials.as_ref().and_then(|c| c.api_key.as_ref()));
    let bearer_token = masked(credentials.as_ref().and_then(|c| c.bearer_token.as_ref()));

    if !output.is_human() {
        output.json(&json!({
            "config_file": settings.config_file,
            "config_file_exists": settings.config_file.exists(),
            "config": config,
            "database": settings.paths.database_file(config),
            "movielens_dir": settings.paths.movielens_dir(config),
            "batch_dir": settings.paths.batch_dir(config),
            "credentials": { "api_key": api_key, "bearer_token": bearer_token },
        }));
        return Ok(());
    }
    if output.is_quiet() {
        return Ok(());
    }

    if !settings.config_file.exists() {
        output.warn(format!(
            "No config file at {}; showing built-in defaults. Run 'cinesync config init' to write one.",
            settings.config_file.display()
        ));
    }

    let mut table = super::summary::styled_table();
    table.set_header(vec![
        Cell::new("Setting").fg(Color::Cyan).add_attribute(comfy_table::Attribute::Bold),
        Cell::new("Value").fg(Color::Cyan).add_attribute(comfy_table::Attribute::Bold),
    ]);
    let rows: Vec<(&str, String)> = vec![
        ("Config file", settings.config_file.display().to_string()),
        ("Database", settings.paths.database_file(config).display().to_string()),
        ("MovieLens data", settings.paths.movielens_dir(config).display().to_string()),
        ("Batch files", settings.paths.batch_dir(config).display().to_string()),
        ("TMDB base URL", config.tmdb.base_url.clone()),
        ("TMDB language", config.tmdb.language.clone()),
        ("Requests per second", config.tmdb.requests_per_second.to_string()),
        ("Max retries", config.tmdb.max_retries.to_string()),
        ("Retry base delay", format!("{} ms", config.tmdb.retry_base_delay_ms)),
        ("Request timeout", format!("{} s", config.tmdb.request_timeout_secs)),
        ("Max pages", config.tmdb.max_pages.to_string()),
        ("Cache TTL", format!("{} s", config.cache.ttl_secs)),
        ("Cache sweep interval", format!("{} s", config.cache.sweep_interval_secs)),
        ("Batch size", config.pipeline.batch_size.to_string()),
        ("Workers", config.pipeline.max_workers.to_string()),
        ("Max pages for 'missing'", config.pipeline.movies_since_max_pages.to_string()),
        ("TMDB API key", api_key),
        ("TMDB bearer token", bearer_token),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    println!("{}", table);

    if credentials.is_none() {
        println!(
            "{} No TMDB credentials; run 'cinesync config credentials' or set TMDB_API_KEY",
            "⚠".yellow()
        );
    }
    Ok(())
}

fn init_config(force: bool, opts: &GlobalOpts, output: &Output) -> Result<()> {
    let settings = Settings::load(opts)?;
    let path = &settings.config_file;
    if path.exists() && !force {
        return Err(eyre!("{} already exists; pass --force to overwrite it", path.display()));
    }

    Config::default()
        .save_to_file(path)
        .map_err(|e| eyre!("Failed to write {}: {:#}", path.display(), e))?;
    settings
        .paths
        .ensure_directories()
        .map_err(|e| eyre!("Failed to create data directories: {:#}", e))?;

    output.success(format!("Wrote default configuration to {}", path.display()));
    Ok(())
}

fn store_credentials(
    api_key: Option<String>,
    bearer_token: Option<String>,
    opts: &GlobalOpts,
    output: &Output,
) -> Result<()> {
    let settings = Settings::load(opts)?;
    let mut store = settings.credential_store()?;

    let (api_key, bearer_token) = if api_key.is_none() && bearer_token.is_none() {
        if !is_interactive() {
            return Err(eyre!("Pass --api-key or --bearer-token when not running in a terminal"));
        }
        (
            prompts::prompt_secret("TMDB API key (leave empty to skip)")?,
            prompts::prompt_secret("TMDB bearer token (leave empty to skip)")?,
        )
    } else {
        (api_key, bearer_token)
    };
    if api_key.is_none() && bearer_token.is_none() {
        return Err(eyre!("No credentials given, nothing stored"));
    }

    if let Some(key) = api_key {
        output.info(format!("API key: {}", mask(&key)));
        store.set_tmdb_api_key(key);
    }
    if let Some(token) = bearer_token {
        output.info(format!("Bearer token: {}", mask(&token)));
        store.set_tmdb_bearer_token(token);
    }
    store
        .save()
        .map_err(|e| eyre!("Failed to save credentials: {:#}", e))?;

    output.success(format!("Saved TMDB credentials to {}", settings.paths.credentials_file().display()));
    Ok(())
}
