use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use is_terminal::IsTerminal;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use editreview::config::Config;
use editreview::diff::{self, DiffDisplayConfig, diff_stats};
use editreview::edit::load_edits;
use editreview::encoding::EncodingPolicy;
use editreview::host::{ChannelHost, ChannelSink, HostEvent};
use editreview::logging;
use editreview::protocol::{DiffAction, DiffResultPayload, InboundMessage, OutboundEvent};
use editreview::review::ReviewOutcome;
use editreview::service;
use editreview::transform::{apply_forward_report, reconstruct_before_report};
use editreview::writer::read_decoded;

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq, Default)]
enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn should_color(self) -> bool {
        match self {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => io::stdout().is_terminal(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Reconstruct(cmd) => handle_reconstruct(cmd)?,
        Command::Preview(cmd) => handle_preview(cmd)?,
        Command::Stats(cmd) => handle_stats(cmd)?,
        Command::Review(cmd) => handle_review(cmd).await?,
        Command::Serve(cmd) => handle_serve(cmd).await?,
        Command::Log(cmd) => handle_log(cmd)?,
    }

    Ok(())
}

fn handle_reconstruct(cmd: ReconstructCommand) -> Result<()> {
    let config = cmd.common.load_config()?;
    let policy = EncodingPolicy::new(config.encoding.as_deref())?;
    let target = locate(&config, &cmd.target);
    let after = read_text(&policy, &target)?;
    let edits = load_edits(&cmd.edits)?;
    let report = reconstruct_before_report(&after, &edits);

    if cmd.json {
        let stats = diff_stats(&report.content, &after);
        let outcomes: Vec<_> = report
            .outcomes
            .iter()
            .enumerate()
            .map(|(index, outcome)| json!({ "index": index, "outcome": outcome.label() }))
            .collect();
        let value = json!({
            "target": target,
            "before": report.content,
            "additions": stats.additions,
            "deletions": stats.deletions,
            "applied": report.applied(),
            "skipped": report.skipped(),
            "outcomes": outcomes,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", report.content);
    }
    Ok(())
}

fn handle_preview(cmd: PreviewCommand) -> Result<()> {
    let config = cmd.common.load_config()?;
    let policy = EncodingPolicy::new(config.encoding.as_deref())?;
    let target = locate(&config, &cmd.target);
    let before = if target.exists() {
        read_text(&policy, &target)?
    } else {
        String::new()
    };
    let edits = load_edits(&cmd.edits)?;
    let report = apply_forward_report(&before, &edits);
    let stats = diff_stats(&before, &report.content);

    if cmd.unified {
        print!(
            "{}",
            diff::unified_diff(
                &cmd.target.display().to_string(),
                &before,
                &report.content,
                cmd.common.context
            )
        );
    } else {
        println!("=== {} ===", target.display());
        if before == report.content {
            println!("no changes.");
        } else {
            print!(
                "{}",
                diff::render_diff(&before, &report.content, &cmd.common.diff_display_config())
            );
        }
    }
    println!(
        "preview summary: applied={}, skipped={}, +{} -{}",
        report.applied(),
        report.skipped(),
        stats.additions,
        stats.deletions
    );
    Ok(())
}

fn handle_stats(cmd: StatsCommand) -> Result<()> {
    let config = cmd.common.load_config()?;
    let policy = EncodingPolicy::new(config.encoding.as_deref())?;
    let before = read_text(&policy, &locate(&config, &cmd.before))?;
    let after = read_text(&policy, &locate(&config, &cmd.after))?;
    let stats = diff_stats(&before, &after);
    if cmd.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!("additions: {}", stats.additions);
        println!("deletions: {}", stats.deletions);
    }
    Ok(())
}

async fn handle_review(cmd: ReviewCommand) -> Result<()> {
    let config = cmd.common.load_config()?;
    let file_path = cmd.target.display().to_string();
    let message = match (&cmd.edits, &cmd.body_file) {
        (Some(edits_path), None) => {
            let operations = load_edits(edits_path)?;
            if cmd.applied {
                InboundMessage::ShowEditableDiff {
                    file_path,
                    operations,
                    status: cmd.new_file.then(|| "A".to_string()),
                }
            } else {
                InboundMessage::ShowInteractiveDiff {
                    file_path,
                    new_file_contents: None,
                    operations: Some(operations),
                    tab_name: cmd.tab_name.clone(),
                    is_new_file: cmd.new_file,
                }
            }
        }
        (None, Some(body)) => {
            if cmd.applied {
                bail!("--applied needs --edits; a body file has not been written yet");
            }
            let contents = fs::read_to_string(body)
                .with_context(|| format!("reading body file {}", body.display()))?;
            InboundMessage::ShowInteractiveDiff {
                file_path,
                new_file_contents: Some(contents),
                operations: None,
                tab_name: cmd.tab_name.clone(),
                is_new_file: cmd.new_file,
            }
        }
        _ => bail!("provide exactly one of --edits or --body-file"),
    };

    let (host, mut host_rx) = ChannelHost::new();
    let (sink, mut events) = ChannelSink::new();
    let handle = service::spawn(&config, host, sink)?;
    handle.submit(message)?;
    let display = cmd.common.diff_display_config();

    let result = loop {
        tokio::select! {
            Some(event) = host_rx.recv() => match event {
                HostEvent::ReviewOpened { session_id, request } => {
                    println!("=== {} ===", request.tab_label);
                    if request.before == request.after {
                        println!("no changes.");
                    } else {
                        print!("{}", diff::render_diff(&request.before, &request.after, &display));
                    }
                    let stats = request.stats();
                    println!("+{} -{}", stats.additions, stats.deletions);
                    let decision = if cmd.yes {
                        Decision::Apply
                    } else {
                        let path = request.file_path.clone();
                        tokio::task::spawn_blocking(move || prompt_decision(&path)).await??
                    };
                    let outcome = match decision {
                        Decision::Apply => ReviewOutcome::Applied(request.after.clone()),
                        Decision::Reject => ReviewOutcome::Rejected { reason: None },
                        Decision::Dismiss => ReviewOutcome::Dismissed,
                    };
                    handle.resolve(session_id, outcome).await?;
                }
                other => debug!(?other, "host event"),
            },
            Some(event) = events.recv() => match event {
                OutboundEvent::DiffResult(payload) => break payload,
                OutboundEvent::ErrorToast { message } => eprintln!("error: {message}"),
                other => debug!(?other, "outbound event"),
            },
            else => bail!("review service stopped before a result arrived"),
        }
    };

    report_result(&result)
}

fn report_result(result: &DiffResultPayload) -> Result<()> {
    match (result.action, &result.error) {
        (DiffAction::Apply, _) => println!("applied changes to {}", result.file_path),
        (DiffAction::Reject, None) => println!("rejected changes to {}", result.file_path),
        (DiffAction::Reject, Some(error)) => {
            return Err(anyhow!("review of {} failed: {error}", result.file_path));
        }
        (DiffAction::Dismiss, _) => {
            println!("dismissed; {} left as found", result.file_path)
        }
    }
    Ok(())
}

async fn handle_serve(cmd: ServeCommand) -> Result<()> {
    let config = cmd.common.load_config()?;
    let (host, host_rx) = ChannelHost::new();
    let (sink, events) = ChannelSink::new();
    let handle = service::spawn(&config, host, sink)?;
    let printer = tokio::spawn(print_events(host_rx, events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundMessage>(trimmed) {
            Ok(message) => handle.submit(message)?,
            Err(err) => warn!(error = %err, "ignoring malformed message"),
        }
    }

    let dismissed = handle.teardown().await?;
    info!(dismissed, "input closed");
    drop(handle);
    printer.await??;
    Ok(())
}

/// Writes host and outbound events to stdout as JSON lines until both
/// channels close.
async fn print_events(
    mut host_rx: UnboundedReceiver<HostEvent>,
    mut events: UnboundedReceiver<OutboundEvent>,
) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut host_open = true;
    let mut events_open = true;
    while host_open || events_open {
        let line = tokio::select! {
            event = host_rx.recv(), if host_open => match event {
                Some(event) => serde_json::to_string(&event)?,
                None => {
                    host_open = false;
                    continue;
                }
            },
            event = events.recv(), if events_open => match event {
                Some(event) => serde_json::to_string(&event)?,
                None => {
                    events_open = false;
                    continue;
                }
            },
        };
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn handle_log(cmd: LogCommand) -> Result<()> {
    let config = cmd.common.load_config()?;
    let Some(journal) = config.journal() else {
        println!("review journal is disabled.");
        return Ok(());
    };
    let entries = journal.tail(cmd.tail)?;
    if entries.is_empty() {
        println!("review journal is empty.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "[{}] {:<8} +{:<5} -{:<5} {}",
            entry.timestamp, entry.action, entry.additions, entry.deletions, entry.path
        );
        if let Some(error) = &entry.error {
            println!("    error: {error}");
        }
    }
    Ok(())
}

fn locate(config: &Config, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config.project_root.join(path)
    }
}

fn read_text(policy: &EncodingPolicy, path: &Path) -> Result<String> {
    let decoded =
        read_decoded(policy, path).with_context(|| format!("reading {}", path.display()))?;
    if decoded.had_errors {
        warn!(
            path = %path.display(),
            encoding = decoded.encoding.name(),
            "decoding produced replacement characters"
        );
    }
    Ok(decoded.text)
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Apply,
    Reject,
    Dismiss,
}

fn prompt_decision(path: &Path) -> Result<Decision> {
    loop {
        print_prompt(&format!(
            "Review {}: [a]pply/[r]eject/[d]ismiss: ",
            path.display()
        ))?;
        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // closed input means nobody is deciding
            return Ok(Decision::Dismiss);
        }
        match input.trim().to_lowercase().as_str() {
            "a" | "apply" => return Ok(Decision::Apply),
            "r" | "reject" => return Ok(Decision::Reject),
            "d" | "dismiss" => return Ok(Decision::Dismiss),
            _ => {
                println!("Please enter a, r, or d.");
            }
        }
    }
}

fn print_prompt(message: &str) -> Result<()> {
    print!("{message}");
    io::stdout().flush()?;
    Ok(())
}

#[derive(Debug, Parser)]
#[command(
    name = "editreview",
    version,
    about = "Rebuild, preview and review proposed file edits"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the content a file had before the given edits were applied.
    Reconstruct(ReconstructCommand),
    /// Show what the given edits would do to a file.
    Preview(PreviewCommand),
    /// Count added and removed lines between two files.
    Stats(StatsCommand),
    /// Review a proposed change in the terminal and apply, reject or dismiss it.
    Review(ReviewCommand),
    /// Speak the JSON-lines message protocol over stdin/stdout.
    Serve(ServeCommand),
    /// Show recent review decisions.
    Log(LogCommand),
}

#[derive(Debug, Clone, Args)]
struct CommonArgs {
    /// Project root; writes outside it are refused.
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    root: Option<PathBuf>,
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, value_name = "ENCODING")]
    encoding: Option<String>,
    #[arg(long, default_value_t = 3)]
    context: usize,
    #[arg(long = "color", value_enum, default_value = "auto")]
    color: ColorChoice,
}

impl CommonArgs {
    fn load_config(&self) -> Result<Config> {
        let root = self.root.clone().unwrap_or_else(|| PathBuf::from("."));
        let mut config = Config::discover(&root, self.config.as_deref())?;
        if let Some(root) = &self.root {
            config.project_root = root.clone();
        }
        if let Some(encoding) = &self.encoding {
            config.encoding = Some(encoding.clone());
        }
        Ok(config)
    }

    fn diff_display_config(&self) -> DiffDisplayConfig {
        DiffDisplayConfig {
            context: self.context,
            colorize: self.color.should_color(),
        }
    }
}

#[derive(Debug, Args)]
struct ReconstructCommand {
    #[command(flatten)]
    common: CommonArgs,
    /// File holding the post-edit content.
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    target: PathBuf,
    /// Edit list (`.json`, otherwise YAML).
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    edits: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Args)]
struct PreviewCommand {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    target: PathBuf,
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    edits: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    unified: bool,
}

#[derive(Debug, Args)]
struct StatsCommand {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    before: PathBuf,
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    after: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Args)]
struct ReviewCommand {
    #[command(flatten)]
    common: CommonArgs,
    /// Path relative to the project root.
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    target: PathBuf,
    #[arg(long, value_name = "PATH", conflicts_with = "body_file")]
    edits: Option<PathBuf>,
    /// The edits are already on disk; rejecting restores the reconstructed original.
    #[arg(long, action = ArgAction::SetTrue, requires = "edits")]
    applied: bool,
    /// Proposed full content for the file.
    #[arg(long = "body-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    body_file: Option<PathBuf>,
    #[arg(long = "new-file", action = ArgAction::SetTrue)]
    new_file: bool,
    #[arg(long = "tab-name", value_name = "NAME")]
    tab_name: Option<String>,
    /// Apply without prompting.
    #[arg(long, action = ArgAction::SetTrue)]
    yes: bool,
}

#[derive(Debug, Args)]
struct ServeCommand {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct LogCommand {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long = "tail", default_value_t = 20)]
    tail: usize,
}
