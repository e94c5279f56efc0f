mod analytics;
mod backend;
mod config;
mod dashboard;
mod error;
mod models;
mod report;
mod service;
mod session;
mod storage;
mod ui;

use backend::http::HttpBackend;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{
    data_dir, db_path, delete_access_token, ensure_initialized, load_config, save_config,
    set_access_token, AppConfig, TokenLocation,
};
use dashboard::DashboardState;
use error::AppError;
use models::{LogUsageRequest, TimeWindow, TokenSeriesKind, UsageLogEntry, UsageSnapshot};
use service::{LoadResult, UsageService};
use session::SessionStore;
use std::fs;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use storage::Storage;
use tracing_subscriber::EnvFilter;
use ui::run::run_tui;

#[derive(Debug, Parser)]
#[command(name = "aetheria-usage")]
#[command(about = "Aetheria AI token usage dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: Option<String>,
    },
    Logout,
    Tui,
    Report {
        #[arg(long)]
        window: Option<String>,
        #[arg(long, default_value = "total")]
        series: String,
        #[arg(long, default_value = "table")]
        format: String,
        /// Use the rows cached by the last successful fetch.
        #[arg(long)]
        offline: bool,
    },
    LogUsage {
        #[arg(long)]
        input_tokens: u64,
        #[arg(long)]
        output_tokens: u64,
    },
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn validate_window(input: &str) -> Result<TimeWindow, AppError> {
    TimeWindow::from_label(input).ok_or_else(|| {
        AppError::Config("Unsupported window. Use 7d, 30d, 90d, or all.".into())
    })
}

fn validate_series(input: &str) -> Result<TokenSeriesKind, AppError> {
    TokenSeriesKind::from_label(input).ok_or_else(|| {
        AppError::Config("Unsupported series. Use total, input, or output.".into())
    })
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn open_log_file() -> Option<fs::File> {
    let dir = data_dir().ok()?;
    fs::create_dir_all(&dir).ok()?;
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("aetheria-usage.log"))
        .ok()
}

fn init_tracing(to_file: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);

    // The TUI owns the terminal, so its events go to a file next to the cache.
    if to_file {
        if let Some(file) = open_log_file() {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
            return;
        }
    }
    let _ = builder.with_writer(std::io::stderr).try_init();
}

fn build_service(cfg: &AppConfig) -> Result<(Arc<UsageService>, Arc<SessionStore>), AppError> {
    let sessions = Arc::new(SessionStore::from_config(cfg));
    let backend = Arc::new(HttpBackend::from_config(cfg)?);
    let service = Arc::new(UsageService::new(backend, sessions.clone()));
    Ok((service, sessions))
}

async fn fetch_snapshot(
    service: &UsageService,
    storage: &mut Storage,
) -> Result<UsageSnapshot, AppError> {
    match service.load().await? {
        LoadResult::Fresh(snapshot) => {
            storage.replace_snapshot(&snapshot)?;
            Ok(snapshot)
        }
        // Only one load is ever in flight from the CLI.
        LoadResult::Superseded => Err(AppError::Network("request was superseded".into())),
    }
}

fn print_logs_csv(rows: &[UsageLogEntry]) {
    println!("id,user_id,input_tokens,output_tokens,total_tokens,created_at");
    for r in rows {
        println!(
            "{},{},{},{},{},{}",
            csv_field(&r.id),
            csv_field(&r.user_id),
            r.input_tokens,
            r.output_tokens,
            r.total_tokens,
            csv_field(&r.created_at.to_rfc3339()),
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Commands::Tui));

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            eprintln!("Error: {}", err.user_message());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<(), AppError> {
    match command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized aetheria-usage config and data directories.");
        }
        Commands::Login { token, user_id } => {
            if token.trim().is_empty() {
                return Err(AppError::Config("Access token must not be empty.".into()));
            }
            ensure_initialized()?;
            let mut cfg = load_config()?;
            let location = set_access_token(&token)?;
            if user_id.is_some() {
                cfg.user_id = user_id;
                save_config(&cfg)?;
            }
            match location {
                TokenLocation::Keyring => println!("Access token stored in the OS keyring."),
                TokenLocation::File(path) => {
                    println!("Access token stored in {}", path.display())
                }
            }
        }
        Commands::Logout => {
            ensure_initialized()?;
            delete_access_token()?;
            println!("Access token removed.");
        }
        Commands::Tui => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let mut storage = Storage::open(&db_path()?)?;
            let (service, sessions) = build_service(&cfg)?;
            run_tui(&cfg, service, sessions, &mut storage).await?;
        }
        Commands::Report {
            window,
            series,
            format,
            offline,
        } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let window = match window {
                Some(w) => validate_window(&w)?,
                None => cfg.default_time_window(),
            };
            let series = validate_series(&series)?;
            let as_json = match format.to_ascii_lowercase().as_str() {
                "json" => true,
                "table" => false,
                _ => {
                    return Err(AppError::Config(
                        "Unsupported report format. Use table or json".into(),
                    ))
                }
            };

            let mut storage = Storage::open(&db_path()?)?;
            let snapshot = if offline {
                storage.load_snapshot()?.ok_or_else(|| {
                    AppError::Config("No cached usage yet. Run `report` online first.".into())
                })?
            } else {
                let (service, _sessions) = build_service(&cfg)?;
                fetch_snapshot(&service, &mut storage).await?
            };

            let state = DashboardState::from_snapshot(&snapshot, window, series, Utc::now());
            if as_json {
                let report = match &state {
                    DashboardState::Data(report) => Some(report),
                    _ => None,
                };
                let out = serde_json::json!({
                    "window": window,
                    "series": series,
                    "fetched_at": snapshot.fetched_at,
                    "empty": report.is_none(),
                    "report": report,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                print!("{}", report::render_text(&state));
            }
        }
        Commands::LogUsage {
            input_tokens,
            output_tokens,
        } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let (service, _sessions) = build_service(&cfg)?;
            service
                .log_usage(LogUsageRequest {
                    input_tokens,
                    output_tokens,
                })
                .await?;
            println!("Logged {input_tokens} input and {output_tokens} output tokens.");
        }
        Commands::Export { format } => {
            ensure_initialized()?;
            let storage = Storage::open(&db_path()?)?;
            if format.eq_ignore_ascii_case("json") {
                println!("{}", storage.export_json()?);
            } else if format.eq_ignore_ascii_case("csv") {
                print_logs_csv(&storage.load_logs()?);
            } else {
                return Err(AppError::Config(
                    "Unsupported export format. Use json or csv".into(),
                ));
            }
        }
    }

    Ok(())
}
