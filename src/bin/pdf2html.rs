//! CLI binary for pdf2html.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConversionConfig`, renders progress, and turns outcomes into exit
//! codes: 0 when every page passed, 2 when some pages ended best-effort,
//! 1 on fatal errors.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2html::{
    convert, ConversionConfig, PageSelection, ProgressHook, TextDirection,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress hook using indicatif ────────────────────────────────────────

/// Terminal progress: one bar across pages, a log line per iteration.
struct CliProgress {
    bar: ProgressBar,
    target: u8,
}

impl CliProgress {
    fn new(target: u8) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:40.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar, target })
    }
}

impl ProgressHook for CliProgress {
    fn on_document_start(&self, total_pages: usize) {
        self.bar.set_length(total_pages as u64);
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_skipped(&self, page_num: usize, _total: usize) {
        self.bar
            .println(format!("  {} Page {page_num}  already complete, skipped", dim("–")));
        self.bar.inc(1);
    }

    fn on_iteration(&self, page_num: usize, iteration: u32, max_retries: u32, score: Option<u8>) {
        let verdict = match score {
            Some(s) if s >= self.target => green(&format!("{s}/100")),
            Some(s) => yellow(&format!("{s}/100")),
            None => red("step failed"),
        };
        self.bar.println(format!(
            "    {} page {page_num} iteration {iteration}/{max_retries}  {verdict}",
            dim("·")
        ));
    }

    fn on_page_complete(
        &self,
        page_num: usize,
        total: usize,
        success: bool,
        score: u8,
        iterations: u32,
    ) {
        let mark = if success { green("✓") } else { yellow("⚠") };
        let status = if success { "passed" } else { "best-effort" };
        self.bar.println(format!(
            "  {mark} Page {page_num:>3}/{total:<3}  {status}  {}  {}",
            bold(&format!("{score}/100")),
            dim(&format!("{iterations} iterations")),
        ));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, processed: usize, passed: usize) {
        self.bar.finish_and_clear();
        if processed == passed {
            eprintln!("{} {} pages converted at target quality", green("✔"), bold(&passed.to_string()));
        } else {
            eprintln!(
                "{} {}/{} pages met the target ({} best-effort)",
                yellow("⚠"),
                bold(&passed.to_string()),
                processed,
                processed - passed,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert every page
  pdf2html convert paper.pdf

  # Pages 1-3, stricter target, more retries
  pdf2html convert --pages 1-3 --target 90 --max-retries 8 paper.pdf

  # RTL document with a known language
  pdf2html convert --language arabic --direction rtl journal.pdf

  # Re-process pages that already have a final.html
  pdf2html convert --force paper.pdf

  # Validate credentials and renderer dependencies
  pdf2html check

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY / GOOGLE_API_KEY   Gemini credential (generator + judge A)
  OPENAI_API_KEY                    OpenAI credential (judge B; enables
                                    cross-model judging and the gate's
                                    second perspective)
  PDF2HTML_DPI                      Rasterisation DPI (default 300)
  PDF2HTML_TARGET                   Fidelity target (default 85)
  PDF2HTML_MAX_RETRIES              Iteration budget per page (default 5)
  PDF2HTML_JUDGE_A_WEIGHT           Cross-model weight for judge A (0.5)
  PDF2HTML_JUDGE_B_WEIGHT           Cross-model weight for judge B (0.5)
  PDF2HTML_CROSS_MODEL              Enable judge B (default true)
  PDF2HTML_EQUATION_SPECIALIST      Enable the equation specialist (true)
  PDF2HTML_VERIFICATION             Enable the verification gate (true)
  PDF2HTML_GENERATOR_MODEL          Generator model id override
  PDF2HTML_JUDGE_MODEL              Judge model id override
  PDFIUM_LIB_PATH                   Path to an existing libpdfium

EXIT CODES:
  0  every processed page met the fidelity target
  2  conversion finished but some pages ended best-effort
  1  fatal error (bad input, missing credentials)
"#;

/// Convert PDF documents to pixel-faithful HTML using a vision-model
/// refinement loop.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2html",
    version,
    about = "Convert PDF documents to pixel-faithful HTML using a vision-model refinement loop",
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a PDF document to per-page HTML.
    Convert {
        /// Path to the PDF file.
        input: PathBuf,

        /// Page selection: all, 5, 1-3, or 1,3,5 (1-indexed).
        #[arg(short, long, default_value = "all")]
        pages: String,

        /// Target fidelity score (0-100).
        #[arg(short, long)]
        target: Option<u8>,

        /// Maximum refinement iterations per page.
        #[arg(short = 'r', long)]
        max_retries: Option<u32>,

        /// Output directory (artifacts land under <output>/<pdf-stem>/).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override the detected document language.
        #[arg(short, long)]
        language: Option<String>,

        /// Override the detected text direction: rtl or ltr.
        #[arg(short, long)]
        direction: Option<String>,

        /// Rasterisation DPI (72-600).
        #[arg(long)]
        dpi: Option<u32>,

        /// Re-process pages whose directory already has a final.html.
        #[arg(long)]
        force: bool,

        /// Disable the progress bar.
        #[arg(long)]
        no_progress: bool,

        /// Enable DEBUG-level logs.
        #[arg(short, long)]
        verbose: bool,

        /// Suppress all output except errors.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate credentials and renderer dependencies.
    Check,

    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("pdf2html {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Check => run_check(),
        Command::Convert {
            input,
            pages,
            target,
            max_retries,
            output,
            language,
            direction,
            dpi,
            force,
            no_progress,
            verbose,
            quiet,
        } => {
            let show_progress = !quiet && !no_progress;
            init_logging(verbose, quiet || show_progress);

            let mut config = ConversionConfig::from_env();
            config.pages = PageSelection::parse(&pages)?;
            config.force = force;
            if let Some(t) = target {
                config.target_score = t.min(100);
            }
            if let Some(r) = max_retries {
                config.max_retries = r.max(1);
            }
            if let Some(o) = output {
                config.output_dir = o;
            }
            if let Some(l) = language {
                config.language_override = Some(l);
            }
            if let Some(d) = direction {
                config.direction_override = Some(parse_direction(&d)?);
            }
            if let Some(d) = dpi {
                config.dpi = d.clamp(72, 600);
            }
            if show_progress {
                config.progress =
                    Some(CliProgress::new(config.target_score) as Arc<dyn ProgressHook>);
            }

            // Ctrl-C requests cooperative cancellation: the current
            // render/judge cycle completes and partial state persists.
            let cancel = Arc::new(AtomicBool::new(false));
            config.cancel = Arc::clone(&cancel);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\n{} finishing current iteration, then stopping…", yellow("interrupt:"));
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let outcome = convert(&input, &config).await.context("Conversion failed")?;

            if !quiet {
                eprintln!(
                    "\n{}  {} processed, {} passed, {} best-effort, {} skipped  {}",
                    bold("Summary:"),
                    outcome.summary.processed_pages,
                    outcome.summary.passed_pages,
                    outcome.summary.best_effort_pages,
                    outcome.summary.skipped_pages,
                    dim(&format!("{}ms", outcome.summary.total_duration_ms)),
                );
                eprintln!("{} {}", dim("artifacts:"), outcome.document_dir.display());
            }

            if !outcome.all_passed() {
                std::process::exit(2);
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, suppress_info: bool) {
    let filter = if verbose {
        "debug"
    } else if suppress_info {
        // The progress bar provides the feedback that matters.
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();
}

fn parse_direction(s: &str) -> Result<TextDirection> {
    TextDirection::parse(s)
        .ok_or_else(|| anyhow::anyhow!("invalid direction '{s}': expected 'rtl' or 'ltr'"))
}

/// `pdf2html check`: verify credentials, pdfium, and Chromium.
fn run_check() -> Result<()> {
    let mut ok = true;

    match pdf2html::provider::generator_from_env(None, 10) {
        Ok(model) => {
            use pdf2html::VisionModel;
            println!("{} generator credential       {}", green("✓"), dim(model.name()));
        }
        Err(e) => {
            ok = false;
            println!("{} generator credential       {e}", red("✗"));
        }
    }

    match pdf2html::provider::judges_from_env(None, 10) {
        Ok((_, Some(_))) => {
            println!("{} cross-model judging        second credential found", green("✓"));
        }
        Ok((_, None)) => {
            println!(
                "{} cross-model judging        single credential only (judge B disabled)",
                yellow("⚠")
            );
        }
        Err(_) => {
            // Already reported under the generator check.
        }
    }

    match pdf2html::pipeline::ingest::bind_pdfium() {
        Ok(_) => println!("{} pdfium library             bound", green("✓")),
        Err(e) => {
            ok = false;
            println!("{} pdfium library             {e}", red("✗"));
        }
    }

    match chromiumoxide::BrowserConfig::builder().build() {
        Ok(_) => println!("{} chromium executable        found", green("✓")),
        Err(e) => {
            ok = false;
            println!("{} chromium executable        {e}", red("✗"));
        }
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
