use super::session::{Requirements, Session};
use super::summary::report_run;
use super::GlobalOpts;
use crate::output::Output;
use chrono::NaiveDate;
use cinesync_core::{BatchType, FetchRequest};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::path::PathBuf;

/// `init`: MovieLens load for a range of release years.
pub async fn run_init(
    start_year: i32,
    end_year: Option<i32>,
    enrich: bool,
    opts: &GlobalOpts,
    output: &Output,
) -> Result<()> {
    let needs = Requirements {
        catalog: enrich,
        dataset: true,
        ..Requirements::default()
    };
    let session = Session::open(opts, output, needs)?;
    let end_year = resolve_end_year(&session, end_year)?;
    output.info(format!("Loading MovieLens titles from {} to {}", start_year, end_year));

    let report = session.finish(session.pipeline.initial_load(start_year, end_year, enrich).await)?;
    report_run(&report, output)
}

/// `changes`: re-sync ids the catalog changed in the last `days` days.
pub async fn run_changes(days: u32, opts: &GlobalOpts, output: &Output) -> Result<()> {
    let session = Session::open(opts, output, catalog_only())?;
    let report = session.finish(session.pipeline.process_changes(days).await)?;
    report_run(&report, output)
}

/// `update`: re-sync one movie.
pub async fn run_update(tmdb_id: u64, opts: &GlobalOpts, output: &Output) -> Result<()> {
    let session = Session::open(opts, output, catalog_only())?;
    let report = session.finish(session.pipeline.update_movie(tmdb_id).await)?;
    if report.created + report.updated == 0 && report.fatal.is_none() {
        output.warn(format!("Movie {} was not stored; see the log for details", tmdb_id));
    }
    report_run(&report, output)
}

/// `missing`: add catalog movies released after the newest stored date.
pub async fn run_missing(
    after_date: Option<NaiveDate>,
    end_year: Option<i32>,
    opts: &GlobalOpts,
    output: &Output,
) -> Result<()> {
    let session = Session::open(opts, output, catalog_only())?;
    let report = session.finish(session.pipeline.missing(after_date, end_year).await)?;
    report_run(&report, output)
}

pub enum FetchTarget {
    Initial {
        start_year: i32,
        end_year: Option<i32>,
        enrich: bool,
    },
    Missing {
        after_date: Option<NaiveDate>,
        end_year: Option<i32>,
    },
    Changes {
        days: u32,
    },
}

/// `fetch`: collect records into a YAML batch file without touching the store.
pub async fn run_fetch(target: FetchTarget, opts: &GlobalOpts, output: &Output) -> Result<()> {
    let needs = match &target {
        FetchTarget::Initial { enrich, .. } => Requirements {
            catalog: *enrich,
            dataset: true,
            batch_files: true,
        },
        _ => Requirements {
            catalog: true,
            batch_files: true,
            ..Requirements::default()
        },
    };
    let session = Session::open(opts, output, needs)?;

    let request = match target {
        FetchTarget::Initial {
            start_year,
            end_year,
            enrich,
        } => FetchRequest::Initial {
            start_year,
            end_year: resolve_end_year(&session, end_year)?,
            enrich,
        },
        FetchTarget::Missing { after_date, end_year } => FetchRequest::Missing { after_date, end_year },
        FetchTarget::Changes { days } => FetchRequest::Changes { days },
    };

    let report = session.finish(session.pipeline.fetch_to_file(request).await)?;
    if report.files.is_empty() && report.fatal.is_none() {
        output.info("Nothing new to write");
    }
    report_run(&report, output)
}

/// `load`: upsert batch files written by `fetch`.
pub async fn run_load(
    file: Option<PathBuf>,
    batch_type: Option<BatchType>,
    opts: &GlobalOpts,
    output: &Output,
) -> Result<()> {
    if let Some(path) = &file {
        if !path.is_file() {
            return Err(eyre!("Batch file not found: {}", path.display()));
        }
    }
    let needs = Requirements {
        batch_files: true,
        ..Requirements::default()
    };
    let session = Session::open(opts, output, needs)?;
    let report = session.finish(session.pipeline.load_from_files(file, batch_type).await)?;
    report_run(&report, output)
}

fn catalog_only() -> Requirements {
    Requirements {
        catalog: true,
        ..Requirements::default()
    }
}

/// Default end year: the newest year in the MovieLens dataset.
fn resolve_end_year(session: &Session, end_year: Option<i32>) -> Result<i32> {
    if let Some(year) = end_year {
        return Ok(year);
    }
    session
        .pipeline
        .context()
        .loader
        .as_ref()
        .map(|loader| loader.latest_year())
        .ok_or_else(|| eyre!("MovieLens dataset is not loaded"))
}
