use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use scalpel::doctor;
use scalpel::provider::{AnalysisProvider, ProviderClient, ProviderClientBuilder};
use scalpel::utils::{ensure_database_directory, normalize_client_ip};
use scalpel::{
    Analysis, AnalysisId, AnalysisIngestor, Comment, CommentId, Config, Database, NewComment,
    ReanalysisManager, ReanalysisWorker, Song, SongRanking, SongService, TaskQueue, TaskStatus,
    VoteDirection,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter directives.
const LOG_ENV_VAR: &str = "SCALPEL_LOG";

/// Error messages that point at bad input rather than a broken system.
const USER_ERROR_MARKERS: &[&str] = &[
    "cannot be empty",
    "not found",
    "No analysis found",
    "Cannot reply to a reply",
    "belongs to a different song",
    "must be at least",
    "Invalid vote type",
];

/// scalpel - versioned lyric analyses refined by community comments
#[derive(Parser)]
#[command(name = "scalpel")]
#[command(about = "Versioned lyric analyses refined by upvoted comments")]
#[command(version)]
struct Cli {
    /// Database file (overrides SCALPEL_DB_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Analysis provider base URL (overrides SCALPEL_PROVIDER_URL)
    #[arg(long, global = true, value_name = "URL")]
    provider_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search lyrics through the analysis provider
    Search(SearchCommand),
    /// Fetch (or reuse) the analysis of a song
    Analyze(SongCommand),
    /// Show the latest analysis of a song and record a view
    Show(SongCommand),
    /// List every version of a song's analysis
    History(SongCommand),
    /// Comment on the latest analysis of a song
    Comment(CommentCommand),
    /// List comments on a song, replies nested
    Comments(SongCommand),
    /// Delete one of your own comments
    DeleteComment(DeleteCommentCommand),
    /// Upvote or downvote a comment
    Vote(VoteCommand),
    /// Merge a comment into the analysis right away
    Reanalyze(ReanalyzeCommand),
    /// Process queued reanalyses
    Worker(WorkerCommand),
    /// Inspect the reanalysis queue
    Tasks(TasksCommand),
    /// Songs with the most views in the last 7 days
    Trending(RankingCommand),
    /// Songs with the most views overall
    MostViewed(RankingCommand),
    /// Songs with the most comments
    MostDiscussed(RankingCommand),
    /// Run health checks
    Doctor,
}

#[derive(Args)]
struct SearchCommand {
    /// Free-text query (at least 3 characters)
    query: String,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SongCommand {
    artist: String,
    track: String,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CommentCommand {
    artist: String,
    track: String,
    text: String,

    /// Reply to this top-level comment
    #[arg(long, value_name = "COMMENT_ID")]
    parent: Option<i64>,

    /// Author's user id
    #[arg(long, value_name = "USER_ID")]
    user: Option<i64>,

    /// Client address recorded for anonymous comments
    #[arg(long, value_name = "ADDR")]
    ip: Option<String>,
}

#[derive(Args)]
struct DeleteCommentCommand {
    comment_id: i64,

    #[arg(long, value_name = "USER_ID")]
    user: i64,
}

#[derive(Args)]
struct VoteCommand {
    comment_id: i64,

    /// up or down
    direction: VoteDirection,
}

#[derive(Args)]
struct ReanalyzeCommand {
    analysis_id: i64,
    comment_id: i64,
}

#[derive(Args)]
struct WorkerCommand {
    /// Process due tasks once and exit
    #[arg(long)]
    once: bool,
}

#[derive(Args)]
struct TasksCommand {
    /// Only show failed tasks
    #[arg(long)]
    failed: bool,

    /// Move failed tasks back to pending
    #[arg(long)]
    requeue: bool,

    #[arg(long, default_value_t = 50)]
    limit: usize,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct RankingCommand {
    #[arg(long, default_value_t = scalpel::service::DEFAULT_RANKING_LIMIT)]
    limit: usize,

    #[arg(long)]
    json: bool,
}

/// Resolved configuration plus the handles commands need.
struct App {
    config: Config,
}

impl App {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = Config::from_env()?;
        if let Some(db) = &cli.db {
            config.db_path = db.clone();
        }
        if let Some(url) = &cli.provider_url {
            config.provider_url = url.clone();
        }
        Ok(Self { config })
    }

    fn open_service(&self) -> Result<SongService> {
        ensure_database_directory(&self.config.db_path)?;
        let db = Database::open(&self.config.db_path).context("Failed to open database")?;
        Ok(SongService::new(db))
    }

    fn provider(&self) -> Result<Arc<ProviderClient>> {
        let client = ProviderClientBuilder::new()
            .base_url(&self.config.provider_url)
            .timeout(self.config.provider_timeout)
            .build()
            .context("Failed to create analysis provider client")?;
        Ok(Arc::new(client))
    }
}

fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        let exit_code = if is_user_error(&e) { 1 } else { 2 };
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var(LOG_ENV_VAR)
                .from_env_lossy(),
        )
        .try_init();
}

fn run(cli: &Cli) -> Result<()> {
    let app = App::new(cli)?;

    match &cli.command {
        Commands::Search(cmd) => execute_search(app.provider()?.as_ref(), cmd),
        Commands::Analyze(cmd) => {
            let ingestor = AnalysisIngestor::new(app.provider()?);
            execute_analyze(&app.open_service()?, &ingestor, cmd)
        }
        Commands::Show(cmd) => execute_show(&app.open_service()?, cmd),
        Commands::History(cmd) => execute_history(&app.open_service()?, cmd),
        Commands::Comment(cmd) => execute_comment(&app.open_service()?, cmd),
        Commands::Comments(cmd) => execute_comments(&app.open_service()?, cmd),
        Commands::DeleteComment(cmd) => execute_delete_comment(&app.open_service()?, cmd),
        Commands::Vote(cmd) => execute_vote(&app.open_service()?, cmd),
        Commands::Reanalyze(cmd) => {
            let manager = ReanalysisManager::new(app.provider()?);
            execute_reanalyze(&app.open_service()?, &manager, cmd)
        }
        Commands::Worker(cmd) => {
            let manager = ReanalysisManager::new(app.provider()?);
            let worker = ReanalysisWorker::new(manager, app.config.retry_policy.clone());
            execute_worker(&app.open_service()?, &worker, app.config.poll_interval, cmd)
        }
        Commands::Tasks(cmd) => execute_tasks(&app.open_service()?, cmd),
        Commands::Trending(cmd) => {
            let service = app.open_service()?;
            print_rankings("Trending this week", &service.trending(cmd.limit)?, "views", cmd.json)
        }
        Commands::MostViewed(cmd) => {
            let service = app.open_service()?;
            print_rankings("Most viewed", &service.most_viewed(cmd.limit)?, "views", cmd.json)
        }
        Commands::MostDiscussed(cmd) => {
            let service = app.open_service()?;
            print_rankings(
                "Most discussed",
                &service.most_discussed(cmd.limit)?,
                "comments",
                cmd.json,
            )
        }
        Commands::Doctor => {
            let service = app.open_service()?;
            let provider = app.provider()?;
            let report = doctor::run_health_checks(
                &app.config.db_path.display().to_string(),
                &service,
                &provider,
            )?;
            doctor_verdict(&report)
        }
    }
}

/// Fails when the report found problems, so `doctor` exits non-zero.
fn doctor_verdict(report: &doctor::DoctorReport) -> Result<()> {
    if !report.is_healthy() {
        bail!("Health checks reported problems");
    }
    Ok(())
}

/// Determines if an error is a user error (vs internal error).
///
/// User errors are validation failures and lookups of things that do not
/// exist. Internal errors include database failures and I/O errors.
fn is_user_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        let msg = cause.to_string();
        USER_ERROR_MARKERS.iter().any(|marker| msg.contains(marker))
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn execute_search(provider: &dyn AnalysisProvider, cmd: &SearchCommand) -> Result<()> {
    let response = provider.search(&cmd.query)?;
    if cmd.json {
        return print_json(&response);
    }

    if response.results.is_empty() {
        println!("No results.");
    }
    for result in &response.results {
        let title = result.get("title").and_then(|v| v.as_str());
        let artist = result.get("artist").and_then(|v| v.as_str());
        match (artist, title) {
            (Some(artist), Some(title)) => println!("{artist} - {title}"),
            _ => println!("{result}"),
        }
    }
    Ok(())
}

fn execute_analyze(service: &SongService, ingestor: &AnalysisIngestor, cmd: &SongCommand) -> Result<()> {
    let (song, analysis, created) = ingestor.ensure_analysis(service, &cmd.artist, &cmd.track)?;
    if cmd.json {
        return print_json(&analysis);
    }

    if created {
        println!("Stored new analysis (id: {})", analysis.id);
    } else {
        println!("Using existing analysis (id: {})", analysis.id);
    }
    print_analysis(&song, &analysis, None);
    Ok(())
}

#[derive(Serialize)]
struct ShowOutput<'a> {
    song: &'a Song,
    analysis: &'a Analysis,
    chain_views: i64,
}

fn execute_show(service: &SongService, cmd: &SongCommand) -> Result<()> {
    let (song, head) = require_song(service, &cmd.artist, &cmd.track)?;
    service.record_view(head.id)?;
    let chain_views = service.chain_view_count(head.original_analysis_id)?;

    if cmd.json {
        return print_json(&ShowOutput {
            song: &song,
            analysis: &head,
            chain_views,
        });
    }
    print_analysis(&song, &head, Some(chain_views));
    Ok(())
}

fn execute_history(service: &SongService, cmd: &SongCommand) -> Result<()> {
    let (song, head) = require_song(service, &cmd.artist, &cmd.track)?;
    let chain = service.analysis_chain(head.original_analysis_id)?;
    if cmd.json {
        return print_json(&chain);
    }

    println!("{}", song.label());
    for analysis in &chain {
        let headline = analysis
            .payload()
            .map(|p| p.overall_headline)
            .unwrap_or_else(|_| "(unreadable)".to_string());
        println!(
            "  v{:<3} id {:<6} views {:<6} {}  {}",
            analysis.version,
            analysis.id,
            analysis.view_count,
            format_date(analysis.created_at),
            headline
        );
    }
    Ok(())
}

fn execute_comment(service: &SongService, cmd: &CommentCommand) -> Result<()> {
    if cmd.text.trim().is_empty() {
        bail!("Comment text cannot be empty");
    }

    let mut input = NewComment::new(cmd.text.as_str());
    if let Some(parent) = cmd.parent {
        input = input.reply_to(CommentId::new(parent));
    }
    if let Some(user) = cmd.user {
        input = input.user(user);
    }
    if let Some(ip) = normalize_client_ip(None, cmd.ip.as_deref()) {
        input = input.ip_address(ip);
    }

    let comment = service
        .add_comment(&cmd.artist, &cmd.track, input)
        .context("Failed to add comment")?;
    println!(
        "Comment added (id: {}) to analysis {}",
        comment.id, comment.analysis_id
    );
    Ok(())
}

fn execute_comments(service: &SongService, cmd: &SongCommand) -> Result<()> {
    let comments = service.list_comments(&cmd.artist, &cmd.track)?;
    if cmd.json {
        return print_json(&comments);
    }

    if comments.is_empty() {
        println!("No comments yet.");
    }
    for comment in &comments {
        print_comment(comment, 0);
    }
    Ok(())
}

fn print_comment(comment: &Comment, depth: usize) {
    println!(
        "{:indent$}[{}] {:+} {}",
        "",
        comment.id,
        comment.upvote_count,
        comment.text,
        indent = depth * 4
    );
    for reply in &comment.replies {
        print_comment(reply, depth + 1);
    }
}

fn execute_delete_comment(service: &SongService, cmd: &DeleteCommentCommand) -> Result<()> {
    let id = CommentId::new(cmd.comment_id);
    if !service.delete_comment(id, cmd.user)? {
        bail!("Comment {id} not found for user {}", cmd.user);
    }
    println!("Comment {id} deleted");
    Ok(())
}

fn execute_vote(service: &SongService, cmd: &VoteCommand) -> Result<()> {
    let id = CommentId::new(cmd.comment_id);
    let Some(outcome) = service.vote(id, cmd.direction)? else {
        bail!("Comment {id} not found");
    };

    print!("Comment {} now has {} upvotes", outcome.comment_id, outcome.upvote_count);
    if outcome.reanalysis_queued {
        print!(" (reanalysis queued)");
    }
    println!();
    Ok(())
}

fn execute_reanalyze(service: &SongService, manager: &ReanalysisManager, cmd: &ReanalyzeCommand) -> Result<()> {
    let created = manager.trigger_reanalysis(
        service.database(),
        AnalysisId::new(cmd.analysis_id),
        CommentId::new(cmd.comment_id),
    )?;

    match created {
        Some(version) => println!(
            "Stored version {} (id: {}) of analysis chain {}",
            version.version, version.analysis_id, version.original_analysis_id
        ),
        None => println!(
            "Comment {} has fewer than {} upvotes; nothing to do",
            cmd.comment_id,
            manager.threshold()
        ),
    }
    Ok(())
}

fn execute_worker(
    service: &SongService,
    worker: &ReanalysisWorker,
    poll_interval: std::time::Duration,
    cmd: &WorkerCommand,
) -> Result<()> {
    if cmd.once {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let report = worker.run_once(service.database(), now)?;
        println!(
            "Processed {} task(s): {} done, {} skipped, {} retrying, {} failed",
            report.processed, report.done, report.skipped, report.retried, report.failed
        );
        return Ok(());
    }

    // Ctrl-C finishes the current pass and stops polling. A hard kill leaves
    // claims behind for the next worker to recover.
    let stop = Arc::new(AtomicBool::new(false));
    let on_interrupt = Arc::clone(&stop);
    ctrlc::set_handler(move || on_interrupt.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;
    worker.run(service.database(), poll_interval, &stop);
    Ok(())
}

fn execute_tasks(service: &SongService, cmd: &TasksCommand) -> Result<()> {
    let queue = TaskQueue::new(service.database());

    if cmd.requeue {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let count = queue.requeue_failed(now)?;
        println!("Requeued {count} failed task(s)");
        return Ok(());
    }

    let status = cmd.failed.then_some(TaskStatus::Failed);
    let tasks = queue.list(status, cmd.limit)?;
    if cmd.json {
        return print_json(&tasks);
    }

    let stats = queue.stats()?;
    println!(
        "pending {}  running {}  done {}  skipped {}  failed {}",
        stats.pending, stats.running, stats.done, stats.skipped, stats.failed
    );
    for task in &tasks {
        println!(
            "  #{:<5} comment {:<6} {:<8} attempts {}  {}",
            task.id,
            task.comment_id,
            task.status,
            task.attempts,
            task.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_rankings(title: &str, rankings: &[SongRanking], unit: &str, json: bool) -> Result<()> {
    if json {
        return print_json(rankings);
    }

    println!("{title}");
    if rankings.is_empty() {
        println!("  (none)");
    }
    for (rank, row) in rankings.iter().enumerate() {
        println!(
            "  {:>2}. {} - {} ({} {})",
            rank + 1,
            row.artist,
            row.track,
            row.count,
            unit
        );
    }
    Ok(())
}

fn require_song(service: &SongService, artist: &str, track: &str) -> Result<(Song, Analysis)> {
    service
        .latest_analysis_for(artist, track)?
        .with_context(|| format!("No analysis found for {} - {}", artist.trim(), track.trim()))
}

fn print_analysis(song: &Song, analysis: &Analysis, chain_views: Option<i64>) {
    println!("{}  (version {})", song.label(), analysis.version);
    if let Some(views) = chain_views {
        println!("Views: {views}");
    }

    match analysis.payload() {
        Ok(payload) => {
            println!();
            println!("{}", payload.overall_headline);
            println!();
            println!("{}", payload.introduction);
            for section in &payload.section_analyses {
                println!();
                println!("[{}]", section.section_name);
                if let Some(lines) = section.quoted_lines_text() {
                    println!("  \"{lines}\"");
                }
                println!("{}", section.analysis);
            }
            println!();
            println!("{}", payload.conclusion);
        }
        Err(_) => println!("{}", analysis.ai_response),
    }
}

fn format_date(at: OffsetDateTime) -> String {
    format!("{}-{:02}-{:02}", at.year(), u8::from(at.month()), at.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_song() -> (SongService, Analysis) {
        let service = SongService::new(Database::in_memory().unwrap());
        let song = service.get_or_create_song("Fake Artist", "Fake Track").unwrap();
        let analysis = service
            .create_initial_analysis(
                song.id,
                r#"{"overallHeadline":"h","introduction":"i","conclusion":"c"}"#,
            )
            .unwrap();
        (service, analysis)
    }

    fn comment_cmd(text: &str) -> CommentCommand {
        CommentCommand {
            artist: "Fake Artist".into(),
            track: "Fake Track".into(),
            text: text.into(),
            parent: None,
            user: None,
            ip: None,
        }
    }

    #[test]
    fn doctor_fails_when_report_is_unhealthy() {
        let (service, _) = service_with_song();
        let provider = ProviderClientBuilder::new()
            .base_url("http://127.0.0.1:9")
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap();

        let mut report = doctor::collect_report(":memory:", &service, &provider).unwrap();
        assert!(!report.is_healthy());
        let err = doctor_verdict(&report).unwrap_err();
        assert!(!is_user_error(&err));

        report.provider.status = doctor::HealthStatus::Ok;
        assert!(doctor_verdict(&report).is_ok());
    }

    #[test]
    fn cli_parses_vote_direction() {
        let cli = Cli::try_parse_from(["scalpel", "vote", "7", "up"]).unwrap();
        match cli.command {
            Commands::Vote(cmd) => {
                assert_eq!(cmd.comment_id, 7);
                assert_eq!(cmd.direction, VoteDirection::Up);
            }
            _ => panic!("expected vote command"),
        }
        assert!(Cli::try_parse_from(["scalpel", "vote", "7", "sideways"]).is_err());
    }

    #[test]
    fn cli_global_overrides_and_ranking_default() {
        let cli = Cli::try_parse_from([
            "scalpel",
            "trending",
            "--db",
            "/tmp/x.db",
            "--provider-url",
            "http://p:1",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(cli.provider_url.as_deref(), Some("http://p:1"));
        match cli.command {
            Commands::Trending(cmd) => assert_eq!(cmd.limit, 9),
            _ => panic!("expected trending command"),
        }
    }

    #[test]
    fn user_errors_are_classified() {
        assert!(is_user_error(&anyhow::anyhow!("Comment text cannot be empty")));
        assert!(is_user_error(
            &anyhow::anyhow!("No analysis found for a - b").context("Failed to add comment")
        ));
        assert!(!is_user_error(&anyhow::anyhow!("disk I/O error")));
    }

    #[test]
    fn comment_rejects_whitespace_only_text() {
        let (service, _) = service_with_song();
        let err = execute_comment(&service, &comment_cmd("   \n\t ")).unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn comment_records_normalized_ip() {
        let (service, _) = service_with_song();
        let mut cmd = comment_cmd("nice");
        cmd.ip = Some("::ffff:192.0.2.9".into());

        execute_comment(&service, &cmd).unwrap();

        let comments = service.list_comments("Fake Artist", "Fake Track").unwrap();
        assert_eq!(comments[0].ip_address.as_deref(), Some("192.0.2.9"));
    }

    #[test]
    fn vote_on_missing_comment_is_user_error() {
        let (service, _) = service_with_song();
        let err = execute_vote(
            &service,
            &VoteCommand {
                comment_id: 42,
                direction: VoteDirection::Up,
            },
        )
        .unwrap_err();
        assert!(is_user_error(&err));
    }

    #[test]
    fn show_records_a_view() {
        let (service, head) = service_with_song();
        let cmd = SongCommand {
            artist: "Fake Artist".into(),
            track: "Fake Track".into(),
            json: true,
        };

        execute_show(&service, &cmd).unwrap();
        execute_show(&service, &cmd).unwrap();

        assert_eq!(service.chain_view_count(head.id).unwrap(), 2);
    }

    #[test]
    fn show_unknown_song_is_user_error() {
        let (service, _) = service_with_song();
        let cmd = SongCommand {
            artist: "Nobody".into(),
            track: "Nothing".into(),
            json: false,
        };
        let err = execute_show(&service, &cmd).unwrap_err();
        assert!(is_user_error(&err));
    }

    #[test]
    fn format_date_is_iso_day() {
        let at = OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert_eq!(format_date(at), "1970-01-01");
    }
}
