use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use survey_pulse::intake::Step;
use survey_pulse::prompts::question_header;
use survey_pulse::render::render_summary_text;
use survey_pulse::viz_export::JsonFileSink;
use survey_pulse::{
    spawn_auto_refresh, AgeCohort, AppConfig, DashboardController, FilterEvent, HttpBackend,
    IntakeEvent, RefreshOutcome, ResponseCollector, SentimentLabel,
};

/// Survey Pulse - conversational survey intake and sentiment dashboard
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to YAML config file (overrides SURVEY_PULSE_CONFIG environment variable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL, e.g. http://localhost:5000/api
    #[arg(long)]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer the survey from the terminal
    Intake {
        /// Email to identify with; asked on stdin when omitted
        #[arg(short, long)]
        email: Option<String>,
    },
    /// Fetch, aggregate and render the dashboard charts
    Dashboard {
        /// Output directory for chart files (default: config output_dir)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Render once and exit instead of auto-refreshing
        #[arg(long)]
        once: bool,

        /// Seconds between refreshes (default: config refresh_interval_secs)
        #[arg(long)]
        interval: Option<u64>,

        /// Only show one sentiment (positive, neutral, negative)
        #[arg(long, value_parser = parse_sentiment)]
        sentiment: Option<SentimentLabel>,

        /// Hide an age cohort (18-25, 26-35, 36-45, 46-60, 60+); repeatable
        #[arg(long = "exclude-cohort", value_parser = parse_cohort)]
        exclude_cohorts: Vec<AgeCohort>,

        /// Print one user's answers and the users table after the first load
        #[arg(long)]
        user: Option<String>,
    },
}

fn parse_sentiment(s: &str) -> Result<SentimentLabel, String> {
    SentimentLabel::ALL
        .into_iter()
        .find(|l| l.to_string() == s.to_ascii_lowercase())
        .ok_or_else(|| format!("expected positive, neutral or negative, got {s:?}"))
}

fn parse_cohort(s: &str) -> Result<AgeCohort, String> {
    AgeCohort::ALL
        .into_iter()
        .find(|c| c.label() == s)
        .ok_or_else(|| format!("unknown cohort {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let mut cfg = AppConfig::load(args.config.as_deref())?;
    if let Some(base) = args.api_base {
        debug!("Using API base from --api-base argument: {}", base);
        cfg.api_base = base;
        cfg.validate()?;
    }
    info!("Starting survey-pulse - api_base={}, timezone={}", cfg.api_base, cfg.timezone);

    let backend = Arc::new(HttpBackend::new(cfg.api_url()?, cfg.request_timeout())?);

    match args.command {
        Command::Intake { email } => run_intake(&cfg, backend, email).await,
        Command::Dashboard {
            output_dir,
            once,
            interval,
            sentiment,
            exclude_cohorts,
            user,
        } => {
            let mut events: Vec<FilterEvent> = exclude_cohorts
                .into_iter()
                .map(FilterEvent::ToggleCohort)
                .collect();
            events.extend(sentiment.map(FilterEvent::ToggleSentiment));
            let interval = interval.map(Duration::from_secs).unwrap_or(cfg.refresh_interval());
            if interval.is_zero() {
                bail!("--interval must be positive");
            }
            let dir = output_dir.unwrap_or_else(|| cfg.output_dir.clone());
            run_dashboard(&cfg, backend, dir, once, interval, events, user).await
        }
    }
}

async fn read_line(lines: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    tokio::select! {
        line = lines.next_line() => line.context("reading stdin"),
        _ = tokio::signal::ctrl_c() => Ok(None),
    }
}

async fn run_intake(cfg: &AppConfig, backend: Arc<HttpBackend>, email: Option<String>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interactive = email.is_none();
    let mut email = email;

    // A rejected collector is finished; a fresh one is built per attempt.
    let mut collector = loop {
        let address = match email.take() {
            Some(e) => e,
            None => {
                println!("Correo electrónico:");
                match read_line(&mut lines).await? {
                    Some(l) => l.trim().to_string(),
                    None => return Ok(()),
                }
            }
        };

        let mut collector = ResponseCollector::new(
            cfg.intake_script()?,
            cfg.identity_policy()?,
            backend.clone(),
            backend.clone(),
        );
        match collector.start(&address).await {
            Ok(_) => break collector,
            Err(e) if e.is_validation() && interactive => println!("{}", e.user_message()),
            Err(e) => {
                println!("{}", e.user_message());
                return Err(e.into());
            }
        }
    };

    let printer = spawn_event_printer(collector.subscribe());
    if let Some(prompt) = collector.current_prompt() {
        println!("\n{}\n{}", question_header(0, collector.script().len()), prompt);
    }

    let outcome = loop {
        let Some(line) = read_line(&mut lines).await? else {
            collector.abandon();
            break Ok(());
        };
        match collector.submit_answer(&line).await {
            Ok(Step::Next { .. }) => {}
            Ok(Step::Finished) => break Ok(()),
            Err(e) if e.is_validation() => {}
            Err(e) => break Err(e.into()),
        }
    };

    drop(collector);
    printer.await.context("event printer task")?;
    outcome
}

/// Prints intake events until the collector is dropped.
fn spawn_event_printer(
    mut rx: tokio::sync::broadcast::Receiver<IntakeEvent>,
) -> tokio::task::JoinHandle<()> {
    use tokio::sync::broadcast::error::RecvError;

    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(ev) => ev,
                Err(RecvError::Lagged(n)) => {
                    warn!("Intake events dropped - count={}", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                IntakeEvent::Prompted { index, total, prompt } => {
                    println!("\n{}\n{}", question_header(index, total), prompt)
                }
                IntakeEvent::AnswerRejected => {
                    println!("{}", survey_pulse::prompts::EMPTY_ANSWER_MESSAGE)
                }
                IntakeEvent::Submitting => println!("\nEnviando respuestas..."),
                IntakeEvent::Finished { message }
                | IntakeEvent::Errored { message }
                | IntakeEvent::Rejected { message } => println!("{}", message),
                IntakeEvent::Abandoned => println!("\nEncuesta cancelada."),
                IntakeEvent::Answered { .. } => {}
            }
        }
    })
}

async fn run_dashboard(
    cfg: &AppConfig,
    backend: Arc<HttpBackend>,
    output_dir: PathBuf,
    once: bool,
    interval: Duration,
    events: Vec<FilterEvent>,
    user: Option<String>,
) -> Result<()> {
    let sink = JsonFileSink::new(&output_dir)?;
    let controller = DashboardController::new(backend, Box::new(sink), cfg.tz()?, cfg.years.clone());
    info!(
        "Dashboard starting - output_dir={}, interval={}s, once={}",
        output_dir.display(),
        interval.as_secs(),
        once
    );

    match controller.refresh().await? {
        RefreshOutcome::Stale { reason } if once => bail!("initial load failed: {}", reason),
        RefreshOutcome::Stale { reason } => warn!("Initial load failed, will retry - reason={}", reason),
        _ => {}
    }
    for event in events {
        controller.apply(event).await?;
    }
    print_summary(&controller).await;

    if let Some(email) = user {
        let history = controller.history(&email).await;
        println!("\nHistory for {} ({} answers):", email, history.len());
        for c in history {
            println!(
                "- [{}] {} -> {} ({})",
                c.timestamp.as_deref().unwrap_or("?"),
                c.prompt,
                c.answer,
                c.sentiment_label.as_deref().unwrap_or("?")
            );
        }
        let users = controller.visible_users().await;
        println!("\nUsers in selected cohorts: {}", users.len());
        for u in users {
            println!(
                "- {} {} ({})",
                u.email,
                u.name.as_deref().unwrap_or(""),
                u.age.map(|a| a.to_string()).unwrap_or_default()
            );
        }
    }

    if once {
        return controller.close().await;
    }

    let cancel = CancellationToken::new();
    let ticker = spawn_auto_refresh(controller.clone(), interval, cancel.clone());
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    cancel.cancel();
    ticker.await.context("auto-refresh task")?;

    print_summary(&controller).await;
    controller.close().await
}

async fn print_summary(controller: &DashboardController) {
    let status = controller.status().await;
    match controller.view().await {
        Some(view) => print!("{}", render_summary_text(&view, status.reason.as_deref())),
        None => println!("No data loaded yet."),
    }
}
