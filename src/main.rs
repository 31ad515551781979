#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]

use std::process::ExitCode;

use svnload::archive::FsArchive;
use svnload::loader::{LoadOutcome, Loader};
use svnload::svn::dump_session::DumpSession;
use svnload::{cli, params_file};

enum RunError {
    Generic,
    Usage,
}

fn main() -> ExitCode {
    match main_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Generic) => ExitCode::from(1),
        Err(RunError::Usage) => ExitCode::from(2),
    }
}

fn main_inner() -> Result<(), RunError> {
    let args = match <cli::Cli as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return Err(RunError::Usage);
        }
    };

    let stderr_log_level = args
        .stderr_log_level
        .unwrap_or(cli::LogLevel::Info)
        .to_log_level_filter();
    let file_log_level = args.file_log_level.map(cli::LogLevel::to_log_level_filter);

    if let Err(e) = init_logger(stderr_log_level, args.log_file.as_deref(), file_log_level) {
        eprintln!("failed to initialize logging: {e}");
        return Err(RunError::Generic);
    }

    let params = match args.params {
        None => params_file::LoadParams::default(),
        Some(ref params_path) => {
            let params_raw = std::fs::read_to_string(params_path).map_err(|e| {
                tracing::error!("failed to read {params_path:?}: {e}");
                RunError::Generic
            })?;
            toml::from_str(&params_raw).map_err(|e| {
                tracing::error!("failed to parse {params_path:?}: {e}");
                RunError::Generic
            })?
        }
    };

    let origin = args
        .origin
        .unwrap_or_else(|| args.src.to_string_lossy().into_owned());

    let workdir = args.workdir.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("svnload-{}", std::process::id()))
    });

    let mut session = DumpSession::open(&args.src).map_err(|e| {
        tracing::error!("failed to open SVN source {:?}: {e}", args.src);
        RunError::Generic
    })?;

    let mut archive = FsArchive::open(args.archive.clone()).map_err(|e| {
        tracing::error!("failed to open archive {:?}: {e}", args.archive);
        RunError::Generic
    })?;

    let outcome = Loader::new(&mut session, &mut archive, origin, workdir)
        .start_from_scratch(args.start_from_scratch)
        .limits(params.submit_limits())
        .run()
        .map_err(|e| {
            tracing::error!("{e}");
            RunError::Generic
        })?;

    match outcome {
        LoadOutcome::Full {
            head_revision,
            snapshot_id,
        } => {
            tracing::info!("done: head r{head_revision}, snapshot {snapshot_id}");
        }
        LoadOutcome::Uneventful { snapshot_id } => {
            tracing::info!("done: nothing new, snapshot {snapshot_id}");
        }
        LoadOutcome::Interrupted => {
            tracing::info!("interrupted");
        }
    }

    Ok(())
}

fn init_logger(
    stderr_level: tracing::Level,
    file_path: Option<&std::path::Path>,
    file_level: Option<tracing::Level>,
) -> Result<(), std::io::Error> {
    use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    let stderr_sub = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            stderr_level,
        ));

    let file_sub = if let Some(file_path) = file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        let filter = tracing_subscriber::filter::LevelFilter::from_level(
            file_level.unwrap_or(tracing::Level::DEBUG),
        );
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .with_filter(filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_sub)
        .with(file_sub)
        .init();

    Ok(())
}
