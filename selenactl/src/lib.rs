use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use selena_core::{
    BatchRunner, BfoPortal, ConfigBundle, DownloadVerifier, Identifier, LaunchOverrides,
    RunReport, SessionLauncher,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] selena_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("browser error: {0}")]
    Browser(#[from] selena_core::BrowserError),
    #[error("input file holds no valid identifiers: {0}")]
    EmptyInput(PathBuf),
    #[error("run aborted: {0}")]
    Aborted(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Unattended disclosure-archive downloader", long_about = None)]
pub struct Cli {
    /// Path to the main selena.toml
    #[arg(long, default_value = "configs/selena.toml")]
    pub config: PathBuf,
    /// Alternative path to browser.toml
    #[arg(long)]
    pub browser_config: Option<PathBuf>,
    /// Override for the archive output root
    #[arg(long)]
    pub output_root: Option<PathBuf>,
    /// Override for the run report path
    #[arg(long)]
    pub report_path: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Processes every identifier in the input file
    Run(RunArgs),
    /// Validates the input file without touching the browser
    CheckInput(CheckInputArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// File with one tax identifier per line
    pub input: PathBuf,
    /// Override the reporting years from the config
    #[arg(long, value_delimiter = ',')]
    pub years: Vec<u16>,
    /// Run the browser with a visible window
    #[arg(long, default_value_t = false)]
    pub headed: bool,
}

#[derive(Args, Debug)]
pub struct CheckInputArgs {
    /// File with one tax identifier per line
    pub input: PathBuf,
}

pub async fn run(cli: Cli) -> Result<()> {
    init_tracing();
    match &cli.command {
        Commands::Run(args) => run_batch(&cli, args).await,
        Commands::CheckInput(args) => {
            let inspection = inspect_input(&args.input)?;
            render(&inspection, cli.format)?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_batch(cli: &Cli, args: &RunArgs) -> Result<()> {
    let bundle = load_bundle(cli)?;
    let mut selena = bundle.selena;
    if let Some(root) = &cli.output_root {
        selena.paths.output_root = root.to_string_lossy().to_string();
    }
    if !args.years.is_empty() {
        selena.years.targets = args.years.clone();
    }

    let inspection = inspect_input(&args.input)?;
    for line in &inspection.invalid {
        warn!(line = line.number, content = %line.content, "skipping invalid input line");
    }
    if inspection.identifiers.is_empty() {
        return Err(AppError::EmptyInput(args.input.clone()));
    }

    let launcher = SessionLauncher::new(bundle.browser, &selena.paths.output_root);
    let overrides = LaunchOverrides {
        headless: args.headed.then_some(false),
    };
    let session = launcher.launch_with_overrides(overrides).await?;
    let page = session.open_page().await?;
    let portal = BfoPortal::new(page, selena.pacing.step_delay_ms);
    let verifier = DownloadVerifier::new(selena.verifier.clone())?;

    let runner = BatchRunner::new(&portal, &verifier, &selena);
    let report = runner.run(&inspection.identifiers).await;
    session.shutdown().await?;

    let report_path = cli
        .report_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(&selena.paths.report_path));
    write_report(&report, &report_path, cli.format)?;
    let aborted = report.aborted().map(str::to_string);
    render(&ReportOutput(report), cli.format)?;

    if let Some(reason) = aborted {
        return Err(AppError::Aborted(reason));
    }
    Ok(())
}

fn load_bundle(cli: &Cli) -> Result<ConfigBundle> {
    let selena = selena_core::load_selena_config(&cli.config)?;
    let config_dir = cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let browser_path = cli
        .browser_config
        .clone()
        .unwrap_or_else(|| config_dir.join("browser.toml"));
    let browser = selena_core::load_browser_config(&browser_path)?;
    Ok(ConfigBundle { selena, browser })
}

fn write_report(report: &RunReport, path: &Path, format: OutputFormat) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let rendered = match format {
        OutputFormat::Text => report.render_text(),
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
    };
    fs::write(path, rendered)?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct InvalidLine {
    pub number: usize,
    pub content: String,
}

/// Outcome of parsing one input file: valid identifiers in input order plus
/// the rejected lines. Duplicates survive here; the batch runner dedupes.
#[derive(Debug, Serialize)]
pub struct InputInspection {
    pub identifiers: Vec<Identifier>,
    pub invalid: Vec<InvalidLine>,
}

pub fn inspect_input(path: &Path) -> Result<InputInspection> {
    let content = fs::read_to_string(path)?;
    let mut identifiers = Vec::new();
    let mut invalid = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match Identifier::parse(trimmed) {
            Some(identifier) => identifiers.push(identifier),
            None => invalid.push(InvalidLine {
                number: index + 1,
                content: trimmed.to_string(),
            }),
        }
    }
    Ok(InputInspection {
        identifiers,
        invalid,
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for InputInspection {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Identifiers: {} valid, {} invalid",
            self.identifiers.len(),
            self.invalid.len()
        )];
        for line in &self.invalid {
            lines.push(format!("  line {}: {}", line.number, line.content));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ReportOutput(RunReport);

impl DisplayFallback for ReportOutput {
    fn display(&self) -> String {
        self.0.render_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn inspect_input_separates_valid_and_invalid_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "7707083893").unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  770708389312  ").unwrap();
        writeln!(file, "not-a-number").unwrap();
        writeln!(file, "7707083893").unwrap();

        let inspection = inspect_input(file.path()).unwrap();
        let raw: Vec<&str> = inspection
            .identifiers
            .iter()
            .map(|identifier| identifier.as_str())
            .collect();
        // Duplicates are kept; the batch runner owns dedupe.
        assert_eq!(raw, vec!["7707083893", "770708389312", "7707083893"]);
        assert_eq!(inspection.invalid.len(), 1);
        assert_eq!(inspection.invalid[0].number, 5);
        assert_eq!(inspection.invalid[0].content, "not-a-number");
    }

    #[test]
    fn missing_input_file_is_an_io_error() {
        let err = inspect_input(Path::new("does-not-exist.txt")).unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[test]
    fn inspection_text_lists_invalid_lines() {
        let inspection = InputInspection {
            identifiers: vec![Identifier::parse("7707083893").unwrap()],
            invalid: vec![InvalidLine {
                number: 3,
                content: "abc".into(),
            }],
        };
        let text = inspection.display();
        assert!(text.contains("1 valid, 1 invalid"));
        assert!(text.contains("line 3: abc"));
    }
}
