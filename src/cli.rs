use std::path::PathBuf;

#[derive(clap::Parser)]
pub struct Cli {
    #[arg(
        long = "stderr-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum stderr log level (info by default)"
    )]
    pub stderr_log_level: Option<LogLevel>,
    #[arg(
        long = "log-file",
        value_name = "PATH",
        help = "File to write logs (besides stderr)"
    )]
    pub log_file: Option<PathBuf>,
    #[arg(
        long = "file-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum file log level (debug by default)"
    )]
    pub file_log_level: Option<LogLevel>,
    #[arg(
        long = "src",
        short = 's',
        value_name = "PATH",
        help = "Source Subversion dump file (optionally compressed) or repository directory"
    )]
    pub src: PathBuf,
    #[arg(
        long = "archive",
        short = 'a',
        value_name = "PATH",
        help = "Archive root directory"
    )]
    pub archive: PathBuf,
    #[arg(
        long = "origin",
        value_name = "URL",
        help = "Origin URL recorded for the visit (defaults to the source path)"
    )]
    pub origin: Option<String>,
    #[arg(
        long = "workdir",
        value_name = "PATH",
        help = "Scratch directory for the working copy (defaults to a temporary directory)"
    )]
    pub workdir: Option<PathBuf>,
    #[arg(
        long = "params",
        short = 'P',
        value_name = "FILE",
        help = "Load parameters (TOML)"
    )]
    pub params: Option<PathBuf>,
    #[arg(
        long = "start-from-scratch",
        help = "Ignore any previous visit and reload from revision 1"
    )]
    pub start_from_scratch: bool,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
pub enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl LogLevel {
    pub fn to_log_level_filter(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}
