//! `glog` command surface over a glucose log kept in a sqlite record slot.
//!
//! Embedders can use [`run_cli`] for a fully parsed invocation or
//! [`run_with_tracker`] against any [`Tracker`] they already hold.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use glucose_log_advice::{
    AdviceClient, AdviceState, AdviceTask, HttpAdviceClient, MockAdviceClient,
    DEFAULT_ADVICE_URL, DEFAULT_TIMEOUT_MS,
};
use glucose_log_core::{
    format_glucose, CategoryFilter, ChartOverlay, ChartRenderer, ChartSurface, ChartWindow,
    DateRange, GlucoseStatus, NewRecord, RecordId, RecordSlot, StatusFilter, SummaryStats,
    TableEntry, TablePage, Tracker, TrackerConfig, TrackerError, DEFAULT_SLOT_NAME,
};
use glucose_log_store_sqlite::SqliteRecordSlot;
use serde_json::json;

const CHART_WIDTH: usize = 51;

#[derive(Debug, Parser)]
#[command(name = "glog")]
#[command(about = "Glucose log CLI")]
pub struct Cli {
    #[arg(long, default_value = "./glucose_log.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_SLOT_NAME)]
    slot: String,

    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(flatten)]
    Session(SessionCommand),
    Slots,
}

/// Commands that run against a loaded [`Tracker`] session.
#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    Add(AddArgs),
    Delete(DeleteArgs),
    List(ListArgs),
    Chart(ChartArgs),
    Stats(StatsArgs),
    Advice(AdviceArgs),
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    date: String,
    #[arg(long)]
    time: String,
    #[arg(long, allow_negative_numbers = true)]
    glucose: f64,
    #[arg(long)]
    medication: bool,
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, value_enum, default_value_t = StatusFilterArg::All)]
    filter: StatusFilterArg,
    #[arg(long, default_value = "all")]
    category: String,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ChartArgs {
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AdviceArgs {
    #[arg(long, value_enum, default_value_t = AdviceProviderArg::Http)]
    provider: AdviceProviderArg,
    #[arg(long, default_value = DEFAULT_ADVICE_URL)]
    url: String,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusFilterArg {
    All,
    High,
    Normal,
    Low,
}

impl From<StatusFilterArg> for StatusFilter {
    fn from(value: StatusFilterArg) -> Self {
        match value {
            StatusFilterArg::All => Self::All,
            StatusFilterArg::High => Self::High,
            StatusFilterArg::Normal => Self::Normal,
            StatusFilterArg::Low => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AdviceProviderArg {
    Mock,
    Http,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when configuration loading, slot open/migrate, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(db = %cli.db.display(), slot = %cli.slot, "opening record slot");
    let slot = SqliteRecordSlot::open(&cli.db, &cli.slot)?;
    slot.migrate()?;

    match cli.command {
        Command::Slots => print_slots(&slot),
        Command::Session(command) => {
            let mut tracker = Tracker::open(slot, config)?;
            run_with_tracker(command, &mut tracker)
        }
    }
}

/// Executes one command against an open tracker session.
///
/// # Errors
/// Returns an error when input validation, persistence, or the advice
/// request fails.
pub fn run_with_tracker<S: RecordSlot>(
    command: SessionCommand,
    tracker: &mut Tracker<S>,
) -> Result<()> {
    match command {
        SessionCommand::Add(args) => {
            let record = tracker.add_record(NewRecord {
                date: args.date,
                time: args.time,
                glucose_value: args.glucose,
                medication_taken: args.medication,
                category: args.category,
            })?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        SessionCommand::Delete(args) => {
            let removed = tracker.delete_record(RecordId(args.id))?;
            let payload = json!({
                "removed": removed,
                "remaining": tracker.records().len(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        SessionCommand::List(args) => {
            tracker.set_status_filter(args.filter.into());
            tracker.set_category_filter(CategoryFilter::parse(&args.category));
            tracker.go_to_page(args.page);
            let payload = table_payload(tracker);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_table(&payload);
            }
        }
        SessionCommand::Chart(args) => {
            if args.start.is_some() || args.end.is_some() {
                tracker.apply_chart_range(args.start.as_deref(), args.end.as_deref())?;
            }
            let payload = chart_payload(tracker);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_chart(&payload.window)?;
            }
        }
        SessionCommand::Stats(args) => {
            let payload = summary_payload(&tracker.summary());
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_summary(&payload);
            }
        }
        SessionCommand::Advice(args) => {
            let client = build_advice_client(&args)?;
            let task = AdviceTask::for_records(
                client,
                tracker.records(),
                tracker.config().advice_recent_count,
            );
            match task.wait() {
                AdviceState::Succeeded(text) => println!("{}", strip_emphasis(&text)),
                AdviceState::Failed(message) => return Err(anyhow!(message)),
                AdviceState::Pending => return Err(anyhow!("advice request did not settle")),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    let Some(path) = path else {
        return Ok(TrackerConfig::v1());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(TrackerConfig::from_json(&value)?)
}

fn build_advice_client(args: &AdviceArgs) -> Result<Arc<dyn AdviceClient>> {
    match args.provider {
        AdviceProviderArg::Mock => Ok(Arc::new(MockAdviceClient::new())),
        AdviceProviderArg::Http => Ok(Arc::new(HttpAdviceClient::new(
            &args.url,
            args.timeout_ms,
        )?)),
    }
}

/// Removes markdown emphasis markers from advice text.
#[must_use]
pub fn strip_emphasis(text: &str) -> String {
    text.replace("**", "").replace('*', "")
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct TablePageJsonPayload {
    contract_version: String,
    status_filter: StatusFilter,
    category_filter: String,
    table: TablePage,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ChartWindowJsonPayload {
    contract_version: String,
    range: Option<DateRange>,
    status_text: String,
    window: ChartWindow,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SummaryJsonPayload {
    contract_version: String,
    average_text: String,
    time_in_range_text: String,
    time_above_range_text: String,
    summary: SummaryStats,
}

pub fn table_payload<S: RecordSlot>(tracker: &mut Tracker<S>) -> TablePageJsonPayload {
    TablePageJsonPayload {
        contract_version: "table_page.v1".to_string(),
        status_filter: tracker.status_filter(),
        category_filter: tracker.category_filter().as_str().to_string(),
        table: tracker.table_page(),
    }
}

#[must_use]
pub fn chart_payload<S: RecordSlot>(tracker: &Tracker<S>) -> ChartWindowJsonPayload {
    let window = tracker.chart_window();
    ChartWindowJsonPayload {
        contract_version: "chart_window.v1".to_string(),
        range: tracker.chart_range().cloned(),
        status_text: window.status_text(),
        window,
    }
}

#[must_use]
pub fn summary_payload(summary: &SummaryStats) -> SummaryJsonPayload {
    SummaryJsonPayload {
        contract_version: "summary.v1".to_string(),
        average_text: summary.average_text(),
        time_in_range_text: summary.time_in_range_text(),
        time_above_range_text: summary.time_above_range_text(),
        summary: *summary,
    }
}

fn print_table(payload: &TablePageJsonPayload) {
    let table = &payload.table;
    println!(
        "{}  filter={} category={} records={}",
        table.page_info,
        payload.status_filter.as_str(),
        payload.category_filter,
        table.total_records
    );

    if let Some(message) = &table.empty_message {
        println!("{message}");
        return;
    }

    println!(
        "{:<15} {:<10} {:<5} {:>7} {:<10} {:<12} status",
        "id", "date", "time", "glucose", "medication", "category"
    );
    println!("{}", "-".repeat(80));

    for entry in &table.entries {
        match entry {
            TableEntry::MonthHeader { month } => println!("== {month} =="),
            TableEntry::Row(row) => println!(
                "{:<15} {:<10} {:<5} {:>7} {:<10} {:<12} {}",
                row.record.id,
                row.record.date,
                row.record.time,
                format_glucose(row.record.glucose_value),
                row.medication_label,
                row.category_label,
                row.row_class
            ),
        }
    }

    println!(
        "previous={} next={}",
        if table.previous_enabled { "enabled" } else { "disabled" },
        if table.next_enabled { "enabled" } else { "disabled" }
    );
}

fn print_chart(window: &ChartWindow) -> Result<()> {
    println!("{}", window.status);

    let mut surface = ChartSurface::new(TerminalChart::default());
    if surface.render(window)? {
        for line in surface.renderer().lines() {
            println!("{line}");
        }
    }
    Ok(())
}

fn print_summary(payload: &SummaryJsonPayload) {
    let tier = payload
        .summary
        .metrics()
        .map_or("-", |metrics| metrics.tir_tier.as_str());
    println!("average={}", payload.average_text);
    println!("time_in_range={} tier={tier}", payload.time_in_range_text);
    println!("time_above_range={}", payload.time_above_range_text);
}

fn print_slots(slot: &SqliteRecordSlot) -> Result<()> {
    let slots = slot.list_slots()?;
    println!("{:<24} {:>10} updated_at", "slot", "bytes");
    println!("{}", "-".repeat(64));
    for summary in slots {
        println!(
            "{:<24} {:>10} {}",
            summary.slot_name, summary.payload_bytes, summary.updated_at
        );
    }
    Ok(())
}

/// Plots a window as text rows, one row per point, with the target band
/// drawn as `:` columns on a fixed 50-200 axis.
#[derive(Debug, Default)]
pub struct TerminalChart {
    drawn: usize,
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalChartHandle(usize);

impl TerminalChart {
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl ChartRenderer for TerminalChart {
    type Handle = TerminalChartHandle;

    fn draw(&mut self, window: &ChartWindow) -> Result<Self::Handle, TrackerError> {
        let overlay = window.overlay;
        let band_min = axis_column(overlay.band_min, &overlay);
        let band_max = axis_column(overlay.band_max, &overlay);
        let high_line = axis_column(overlay.high_line, &overlay);

        let mut lines = Vec::with_capacity(window.points.len() + 1);
        lines.push(format!(
            "{:<16} {:>6} {:<width$}{}",
            "",
            "",
            format_glucose(overlay.suggested_min),
            format_glucose(overlay.suggested_max),
            width = CHART_WIDTH - 3
        ));

        for point in &window.points {
            let mut row = vec![' '; CHART_WIDTH];
            row[band_min] = ':';
            row[band_max] = ':';
            row[high_line] = '|';
            row[axis_column(point.value, &overlay)] = match point.status {
                GlucoseStatus::Low => 'v',
                GlucoseStatus::Normal => 'o',
                GlucoseStatus::High => '^',
            };
            lines.push(format!(
                "{:<16} {:>6} {} {}",
                point.label,
                format_glucose(point.value),
                row.into_iter().collect::<String>(),
                point.point_color
            ));
        }

        self.drawn += 1;
        self.lines = lines;
        Ok(TerminalChartHandle(self.drawn))
    }

    fn destroy(&mut self, handle: Self::Handle) {
        if handle.0 == self.drawn {
            self.lines.clear();
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn axis_column(value: f64, overlay: &ChartOverlay) -> usize {
    let span = overlay.suggested_max - overlay.suggested_min;
    let clamped = value.clamp(overlay.suggested_min, overlay.suggested_max);
    let scaled = ((clamped - overlay.suggested_min) / span) * (CHART_WIDTH - 1) as f64;
    (scaled.round() as usize).min(CHART_WIDTH - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glucose_log_core::{MemorySlot, WindowStatus};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_core<T>(result: Result<T, TrackerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_tracker(values: &[(&str, f64)]) -> Tracker<MemorySlot> {
        let mut tracker = must_core(Tracker::open(MemorySlot::default(), TrackerConfig::v1()));
        for (index, (date, value)) in values.iter().enumerate() {
            let _ = must_core(tracker.add_record_at(
                NewRecord {
                    date: (*date).to_string(),
                    time: "08:00".to_string(),
                    glucose_value: *value,
                    medication_taken: index % 2 == 0,
                    category: None,
                },
                i64::try_from(index).unwrap_or(i64::MAX) + 1,
            ));
        }
        tracker
    }

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        }
    }

    #[test]
    fn cli_parses_global_flags_and_list_defaults() {
        let cli = parse(&["glog", "--db", "/tmp/x.sqlite3", "list"]);
        assert_eq!(cli.db, PathBuf::from("/tmp/x.sqlite3"));
        assert_eq!(cli.slot, DEFAULT_SLOT_NAME);
        match cli.command {
            Command::Session(SessionCommand::List(args)) => {
                assert!(matches!(args.filter, StatusFilterArg::All));
                assert_eq!(args.category, "all");
                assert_eq!(args.page, 1);
                assert!(!args.json);
            }
            other => panic!("expected list command, got {other:?}"),
        }
    }

    #[test]
    fn slots_parses_outside_the_session_commands() {
        assert!(matches!(parse(&["glog", "slots"]).command, Command::Slots));
        assert!(matches!(
            parse(&["glog", "stats", "--json"]).command,
            Command::Session(SessionCommand::Stats(StatsArgs { json: true }))
        ));
    }

    #[test]
    fn cli_rejects_unknown_filter() {
        assert!(Cli::try_parse_from(["glog", "list", "--filter", "extreme"]).is_err());
    }

    #[test]
    fn strip_emphasis_removes_markers() {
        assert_eq!(strip_emphasis("1. **Walk** after *meals*"), "1. Walk after meals");
    }

    #[test]
    fn payloads_carry_contract_versions() {
        let mut tracker = fixture_tracker(&[("2024-01-01", 80.0), ("2024-01-02", 150.0)]);

        let table = table_payload(&mut tracker);
        assert_eq!(table.contract_version, "table_page.v1");
        assert_eq!(table.table.header_count(), 1);

        let chart = chart_payload(&tracker);
        assert_eq!(chart.contract_version, "chart_window.v1");
        assert_eq!(chart.status_text, "Showing all 2 records.");

        let summary = summary_payload(&tracker.summary());
        assert_eq!(summary.contract_version, "summary.v1");
        assert_eq!(summary.average_text, "115.0 mg/dL");
        assert_eq!(summary.time_in_range_text, "50%");
    }

    #[test]
    fn chart_command_with_single_bound_is_rejected_without_state_change() {
        let mut tracker = fixture_tracker(&[("2024-01-01", 80.0)]);
        let result = run_with_tracker(
            SessionCommand::Chart(ChartArgs {
                start: Some("2024-01-01".to_string()),
                end: None,
                json: true,
            }),
            &mut tracker,
        );

        assert!(result.is_err());
        assert!(tracker.chart_range().is_none());
    }

    #[test]
    fn advice_command_without_records_reports_no_data() {
        let mut tracker = fixture_tracker(&[]);
        let result = run_with_tracker(
            SessionCommand::Advice(AdviceArgs {
                provider: AdviceProviderArg::Mock,
                url: DEFAULT_ADVICE_URL.to_string(),
                timeout_ms: 1_000,
            }),
            &mut tracker,
        );

        match result {
            Ok(()) => panic!("expected advice failure"),
            Err(err) => assert_eq!(err.to_string(), glucose_log_advice::NO_DATA_MESSAGE),
        }
    }

    #[test]
    fn delete_unknown_id_is_not_an_error() {
        let mut tracker = fixture_tracker(&[("2024-01-01", 80.0)]);
        must(run_with_tracker(
            SessionCommand::Delete(DeleteArgs { id: 424_242 }),
            &mut tracker,
        ));
        assert_eq!(tracker.records().len(), 1);
    }

    #[test]
    fn terminal_chart_plots_points_against_the_band() {
        let tracker = fixture_tracker(&[
            ("2024-01-01", 50.0),
            ("2024-01-02", 105.0),
            ("2024-01-03", 400.0),
        ]);
        let window = tracker.chart_window();
        assert_eq!(window.status, WindowStatus::AllRecords { count: 3 });

        let mut surface = ChartSurface::new(TerminalChart::default());
        assert!(must_core(surface.render(&window)));

        let lines = surface.renderer().lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains(" v"));
        assert!(lines[1].ends_with("low-color"));
        assert!(lines[2].contains('o'));
        assert!(lines[3].ends_with("high-color"));

        let overlay = ChartOverlay::fixed();
        assert_eq!(axis_column(overlay.suggested_min, &overlay), 0);
        assert_eq!(axis_column(overlay.suggested_max, &overlay), CHART_WIDTH - 1);
        assert_eq!(axis_column(1_000.0, &overlay), CHART_WIDTH - 1);

        surface.clear();
        assert!(surface.renderer().lines().is_empty());
    }
}
