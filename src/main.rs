use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use log::debug;

use sheetshot::{
    auth::Authenticator,
    drive::DriveClient,
    runner::{Runner, RunnerOptions},
    sheets::SheetsClient,
    types::PipelineError,
    utils::DEFAULT_STAGING_DIR,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Sheet-driven full-page screenshot uploader", long_about = None)]
struct Args {
    /// Number of retries per failed URL
    #[arg(short = 'r', long, default_value_t = 3)]
    retries: u32,
    /// Seconds to wait between URLs
    #[arg(long, default_value_t = 3)]
    inter_url_delay: u64,
    /// Seconds to wait for a page to reach readyState complete
    #[arg(long, default_value_t = 30)]
    page_load_timeout: u64,
    /// Local staging directory for screenshots (overrides SCREENSHOTS_DIR)
    #[arg(short = 'd', long)]
    screenshots_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct Config {
    spreadsheet_id: String,
    sheet_range: String,
    drive_folder_id: String,
    cookies_path: PathBuf,
    screenshots_dir: PathBuf,
    credentials_path: PathBuf,
}

impl Config {
    fn from_env(args: &Args) -> anyhow::Result<Self> {
        let mut missing = vec![];
        let mut require = |name: &str| match std::env::var(name) {
            Ok(v) if !v.trim().is_empty() => Some(v),
            _ => {
                missing.push(name.to_string());
                None
            }
        };

        let spreadsheet_id = require("SPREADSHEET_ID");
        let sheet_range = require("SHEET_RANGE");
        let drive_folder_id = require("DRIVE_FOLDER_ID");
        let cookies_path = require("COOKIES_PATH");

        if !missing.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            ))
            .into());
        }

        let screenshots_dir = args
            .screenshots_dir
            .clone()
            .or_else(|| std::env::var("SCREENSHOTS_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR));
        let credentials_path = std::env::var("CREDENTIALS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("credentials.json"));

        Ok(Config {
            spreadsheet_id: spreadsheet_id.unwrap(),
            sheet_range: sheet_range.unwrap(),
            drive_folder_id: drive_folder_id.unwrap(),
            cookies_path: PathBuf::from(cookies_path.unwrap()),
            screenshots_dir,
            credentials_path,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = Config::from_env(&args)?;
    debug!("starting run with {:?}", config);

    let auth = Arc::new(Authenticator::from_key_file(&config.credentials_path)?);
    let sheets = SheetsClient::new(auth.clone(), &config.spreadsheet_id, &config.sheet_range)?;
    let drive = DriveClient::new(auth, &config.drive_folder_id);

    let options = RunnerOptions::default_builder()
        .max_retries(args.retries)
        .inter_url_delay_secs(args.inter_url_delay)
        .page_load_timeout_secs(args.page_load_timeout)
        .staging_dir(config.screenshots_dir)
        .cookies_path(Some(config.cookies_path))
        .build()
        .context("invalid runner options")?;

    let mut runner = Runner::new(sheets, drive, options)
        .await
        .context("could not initialize runner")?;

    let summary = runner.run().await?;
    runner.shutdown();

    println!("process completed!");
    println!("  successful: {}", summary.successful);
    println!("  failed:     {}", summary.failed);
    println!("  total:      {}", summary.total);

    Ok(())
}
