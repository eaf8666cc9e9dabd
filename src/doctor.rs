//! Health check utilities for scalpel.
//!
//! Provides the `doctor` command functionality:
//! - System health checks (database, migrations, analysis provider)
//! - Reanalysis queue status
//! - Version-chain integrity scan

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::db::AppliedMigration;
use crate::models::AnalysisId;
use crate::provider::ProviderClient;
use crate::queue::{QueueStats, TaskQueue};
use crate::{Database, SongService};

// ANSI color codes for terminal output
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

/// Health status for a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is healthy
    Ok,
    /// Component has a warning but is functional
    Warning(String),
    /// Component is not functional
    Error(String),
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Ok)
    }
}

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub status: HealthStatus,
    pub file_path: String,
}

#[derive(Debug, Serialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub base_url: String,
}

#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub status: HealthStatus,
    pub stats: QueueStats,
}

/// Row counts for doctor output.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub songs: i64,
    pub analyses: i64,
    pub comments: i64,
    pub views: i64,
}

/// What is wrong with a version chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainProblem {
    /// Versions are not exactly `1..=N`.
    VersionGap { versions: Vec<i64> },
    /// The version-1 row is not the row the chain is named after.
    OriginMismatch { first_version_id: AnalysisId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainIssue {
    pub original_analysis_id: AnalysisId,
    pub problem: ChainProblem,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub database: DatabaseHealth,
    pub migrations: Vec<AppliedMigration>,
    pub provider: ProviderHealth,
    pub queue: QueueHealth,
    pub stats: CatalogStats,
    pub chain_issues: Vec<ChainIssue>,
}

impl DoctorReport {
    /// True when nothing is in an error state and every chain is intact.
    pub fn is_healthy(&self) -> bool {
        !matches!(self.database.status, HealthStatus::Error(_))
            && !matches!(self.provider.status, HealthStatus::Error(_))
            && self.chain_issues.is_empty()
    }
}

// ============================================================================
// Health Check Functions
// ============================================================================

/// Performs all health checks and prints results.
pub fn run_health_checks(
    db_path: &str,
    service: &SongService,
    provider: &ProviderClient,
) -> Result<DoctorReport> {
    let report = collect_report(db_path, service, provider)?;
    print_health_report(&report);
    Ok(report)
}

pub fn collect_report(
    db_path: &str,
    service: &SongService,
    provider: &ProviderClient,
) -> Result<DoctorReport> {
    let db = service.database();
    Ok(DoctorReport {
        database: check_database_health(db_path, db),
        migrations: db.applied_migrations()?,
        provider: check_provider_health(provider),
        queue: check_queue_health(db)?,
        stats: get_catalog_stats(db)?,
        chain_issues: scan_chain_integrity(db)?,
    })
}

fn check_database_health(db_path: &str, db: &Database) -> DatabaseHealth {
    let status = match db.connection().query_row("SELECT 1", [], |_| Ok(())) {
        Ok(_) => HealthStatus::Ok,
        Err(e) => HealthStatus::Error(format!("Connection test failed: {}", e)),
    };

    DatabaseHealth {
        status,
        file_path: db_path.to_string(),
    }
}

fn check_provider_health(provider: &ProviderClient) -> ProviderHealth {
    let status = match provider.ping() {
        Ok(code) if code >= 500 => HealthStatus::Warning(format!("Reachable, HTTP {}", code)),
        Ok(_) => HealthStatus::Ok,
        Err(e) => HealthStatus::Error(format!("Connection failed: {}", e)),
    };

    ProviderHealth {
        status,
        base_url: provider.base_url().to_string(),
    }
}

fn check_queue_health(db: &Database) -> Result<QueueHealth> {
    let stats = TaskQueue::new(db).stats()?;
    let status = if stats.failed > 0 {
        HealthStatus::Warning(format!("{} failed reanalysis task(s)", stats.failed))
    } else {
        HealthStatus::Ok
    };
    Ok(QueueHealth { status, stats })
}

fn get_catalog_stats(db: &Database) -> Result<CatalogStats> {
    let conn = db.connection();
    let count = |table: &str| -> Result<i64> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
    };

    Ok(CatalogStats {
        songs: count("songs")?,
        analyses: count("analyses")?,
        comments: count("comments")?,
        views: count("analysis_view_logs")?,
    })
}

/// Finds version chains that are not `1..=N` or whose first version is not
/// the chain's own origin row.
pub fn scan_chain_integrity(db: &Database) -> Result<Vec<ChainIssue>> {
    let conn = db.connection();
    let mut stmt = conn.prepare(
        "SELECT COALESCE(original_analysis_id, analysis_id), analysis_id, version
         FROM analyses ORDER BY 1, version",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut chains: BTreeMap<i64, Vec<(i64, i64)>> = BTreeMap::new();
    for row in rows {
        let (original, id, version) = row?;
        chains.entry(original).or_default().push((id, version));
    }

    let mut issues = Vec::new();
    for (original, members) in chains {
        let original_analysis_id = AnalysisId::new(original);
        let versions: Vec<i64> = members.iter().map(|&(_, v)| v).collect();

        let gapless = versions.iter().zip(1..).all(|(&v, expected)| v == expected);
        if !gapless {
            issues.push(ChainIssue {
                original_analysis_id,
                problem: ChainProblem::VersionGap { versions },
            });
            continue;
        }

        if let Some(&(first_id, _)) = members.first() {
            if first_id != original {
                issues.push(ChainIssue {
                    original_analysis_id,
                    problem: ChainProblem::OriginMismatch {
                        first_version_id: AnalysisId::new(first_id),
                    },
                });
            }
        }
    }
    Ok(issues)
}

// ============================================================================
// Pretty Printing
// ============================================================================

fn status_symbol(status: &HealthStatus) -> &'static str {
    match status {
        HealthStatus::Ok => "\u{2713}",
        HealthStatus::Warning(_) => "!",
        HealthStatus::Error(_) => "\u{2717}",
    }
}

fn status_color(status: &HealthStatus) -> &'static str {
    match status {
        HealthStatus::Ok => GREEN,
        HealthStatus::Warning(_) => YELLOW,
        HealthStatus::Error(_) => RED,
    }
}

fn status_text(status: &HealthStatus, ok: &str) -> String {
    match status {
        HealthStatus::Ok => ok.to_string(),
        HealthStatus::Warning(w) => w.clone(),
        HealthStatus::Error(e) => e.clone(),
    }
}

fn print_health_report(report: &DoctorReport) {
    println!("{}scalpel doctor{}", BOLD, RESET);
    println!();

    let db = &report.database;
    println!("{}Database{}", BOLD, RESET);
    println!(
        "  {}{}{} Connection: {}",
        status_color(&db.status),
        status_symbol(&db.status),
        RESET,
        status_text(&db.status, "OK")
    );
    println!("    {}Path: {}{}", DIM, db.file_path, RESET);
    println!();

    println!("{}Migrations{}", BOLD, RESET);
    if report.migrations.is_empty() {
        println!("  {}No migrations applied{}", YELLOW, RESET);
    } else {
        for m in &report.migrations {
            println!(
                "  {}{}{} v{}: {}",
                GREEN,
                status_symbol(&HealthStatus::Ok),
                RESET,
                m.version,
                m.description
            );
        }
    }
    println!();

    let provider = &report.provider;
    println!("{}Analysis provider{}", BOLD, RESET);
    println!(
        "  {}{}{} Status: {}",
        status_color(&provider.status),
        status_symbol(&provider.status),
        RESET,
        status_text(&provider.status, "Reachable")
    );
    println!("    {}URL: {}{}", DIM, provider.base_url, RESET);
    println!();

    let queue = &report.queue;
    println!("{}Reanalysis queue{}", BOLD, RESET);
    println!(
        "  {}{}{} {}",
        status_color(&queue.status),
        status_symbol(&queue.status),
        RESET,
        status_text(&queue.status, "No failed tasks")
    );
    println!(
        "    {}pending {}  running {}  done {}  skipped {}  failed {}{}",
        DIM,
        queue.stats.pending,
        queue.stats.running,
        queue.stats.done,
        queue.stats.skipped,
        queue.stats.failed,
        RESET
    );
    println!();

    println!("{}Version chains{}", BOLD, RESET);
    if report.chain_issues.is_empty() {
        println!("  {}{}{} All chains intact", GREEN, status_symbol(&HealthStatus::Ok), RESET);
    } else {
        for issue in &report.chain_issues {
            let detail = match &issue.problem {
                ChainProblem::VersionGap { versions } => format!("versions {:?}", versions),
                ChainProblem::OriginMismatch { first_version_id } => {
                    format!("version 1 is analysis {}", first_version_id)
                }
            };
            println!(
                "  {}{}{} chain {}: {}",
                RED,
                status_symbol(&HealthStatus::Error(String::new())),
                RESET,
                issue.original_analysis_id,
                detail
            );
        }
    }
    println!();

    let stats = &report.stats;
    println!("{}Statistics{}", BOLD, RESET);
    println!("  Songs:      {:>6}", stats.songs);
    println!("  Analyses:   {:>6}", stats.analyses);
    println!("  Comments:   {:>6}", stats.comments);
    println!("  Views:      {:>6}", stats.views);
}
