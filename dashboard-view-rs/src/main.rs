use chrono::{Datelike, Local, NaiveDate};
use clap::{Parser, Subcommand};
use dashboard_core::prelude::*;
use serde_json::Value;
use std::error::Error as _;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

const WEEKDAY_HEADER: &str = " Mo   Tu   We   Th   Fr   Sa   Su   ";

#[derive(Parser)]
#[command(name = "dashboard-view")]
#[command(about = "Render dashboard views from saved API payloads")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the items of a list payload, one JSON document per line.
    Normalize { payload: PathBuf },
    /// Print the month grid and the agenda for the records on it.
    Calendar {
        records: PathBuf,
        /// Month to show as YYYY-MM; defaults to the current month.
        #[arg(long)]
        month: Option<YearMonth>,
        /// Record field holding the display date.
        #[arg(long, default_value = "date")]
        field: String,
    },
    /// Print days remaining before each recycled record is purged.
    RecycleBin {
        records: PathBuf,
        /// Record field holding the deletion timestamp.
        #[arg(long, default_value = "deleted_at")]
        field: String,
        /// Only list records whose retention window has elapsed.
        #[arg(long, default_value_t = false)]
        expired: bool,
    },
    /// Print the configured pipeline stages in order.
    Stages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct YearMonth {
    year: i32,
    month: u32,
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let (year, month) = value
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {value:?}"))?;
        let year: i32 = year.parse().map_err(|_| format!("invalid year in {value:?}"))?;
        let month: u32 = month.parse().map_err(|_| format!("invalid month in {value:?}"))?;
        if !(1..=12).contains(&month) {
            return Err(format!("month must be between 01 and 12, got {month}"));
        }
        Ok(Self { year, month })
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

fn read_payload(path: &Path) -> Result<Value> {
    let source = std::fs::read_to_string(path).map_err(|err| CoreError::io(path, err))?;
    Ok(serde_json::from_str(&source)?)
}

fn normalize_lines(payload: &Value) -> Result<Vec<String>> {
    let shape = classify(payload);
    let label = match shape {
        PayloadShape::List(_) => "list".to_string(),
        PayloadShape::Envelope(key, _) => format!("envelope:{key}"),
        PayloadShape::Absent => "absent".to_string(),
        PayloadShape::Unrecognized => "unrecognized".to_string(),
    };
    let items = shape.items();
    let mut lines = Vec::with_capacity(items.len() + 1);
    lines.push(format!("# {} items ({label})", items.len()));
    for item in items {
        lines.push(serde_json::to_string(item)?);
    }
    Ok(lines)
}

fn calendar_lines(
    payload: &Value,
    month: YearMonth,
    field: &str,
    config: &DashboardConfig,
) -> Result<Vec<String>> {
    let registry = config.stage_registry()?;
    let entries: Vec<ScheduleEntry> = decode_items(payload);
    let buckets = CalendarBuckets::build(&entries, |entry| entry.field(field));
    let grid = MonthGrid::with_weeks(month.year, month.month, config.calendar.weeks)?;

    let title = NaiveDate::from_ymd_opt(month.year, month.month, 1)
        .map(|first| first.format("%B %Y").to_string())
        .unwrap_or_else(|| month.to_string());
    let mut lines = vec![title, WEEKDAY_HEADER.to_string()];
    for week in grid.weeks() {
        let row: Vec<String> = week
            .iter()
            .map(|cell| render_cell(cell, buckets.on(cell.date).len()))
            .collect();
        lines.push(row.join(""));
    }

    // Agenda walks the month's buckets, not the grid, so days a five-week
    // grid cannot show are still listed.
    for (date, records) in buckets.in_month(month.year, month.month) {
        let key = format_date_key(date);
        for entry in records {
            let title = entry.title.as_deref().unwrap_or("(untitled)");
            match entry.stage.as_deref() {
                Some(stage) => lines.push(format!("{key} {title} [{}]", registry.label_for(stage))),
                None => lines.push(format!("{key} {title}")),
            }
        }
    }
    if buckets.skipped() > 0 {
        lines.push(format!("# {} records without a usable date", buckets.skipped()));
    }
    Ok(lines)
}

/// Six columns per cell: day, then `*n` with the record count (capped at 99).
fn render_cell(cell: &CalendarCell, records: usize) -> String {
    let day = cell.date.day();
    match (cell.position, records) {
        (CellPosition::Current, 0) => format!(" {day:>2}   "),
        (CellPosition::Current, n) => format!(" {day:>2}{:<3}", format!("*{}", n.min(99))),
        (_, _) => format!("({day:>2})  "),
    }
}

fn recycle_bin_lines(
    payload: &Value,
    field: &str,
    expired_only: bool,
    config: &DashboardConfig,
    clock: &dyn Clock,
) -> Vec<String> {
    let policy = config.retention;
    let records: Vec<RecycledRecord> = decode_items(payload);
    if expired_only {
        let (expired, _) = policy.partition_expired(&records, |record| record.timestamp(field), clock);
        return expired
            .into_iter()
            .map(|record| format!("{} {}", record.id, record.display_name()))
            .collect();
    }

    let now = clock.now();
    records
        .iter()
        .map(|record| {
            let remaining = policy.days_remaining(record.timestamp(field), now);
            format!(
                "{:>8} {} {}",
                format_days_remaining(remaining),
                record.id,
                record.display_name()
            )
        })
        .collect()
}

fn stage_lines(config: &DashboardConfig) -> Result<Vec<String>> {
    let registry = config.stage_registry()?;
    Ok(registry
        .ordered()
        .iter()
        .map(|stage| format!("{} {} {} {}", stage.order, stage.key, stage.color, stage.label))
        .collect())
}

fn run(cli: &Cli, clock: &dyn Clock) -> Result<Vec<String>> {
    let config = DashboardConfig::load_or_default(cli.config.as_deref())?;
    match &cli.command {
        Commands::Normalize { payload } => normalize_lines(&read_payload(payload)?),
        Commands::Calendar {
            records,
            month,
            field,
        } => {
            let month = month.unwrap_or_else(|| {
                let today = Local::now().date_naive();
                YearMonth {
                    year: today.year(),
                    month: today.month(),
                }
            });
            calendar_lines(&read_payload(records)?, month, field, &config)
        }
        Commands::RecycleBin {
            records,
            field,
            expired,
        } => Ok(recycle_bin_lines(&read_payload(records)?, field, *expired, &config, clock)),
        Commands::Stages => stage_lines(&config),
    }
}

fn render_error(error: &CoreError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(&cli, &SystemClock) {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::debug!(error = ?error, "command failed");
            eprintln!("dashboard-view: {}", render_error(&error));
            ExitCode::from(1)
        }
    }
}
