#![allow(clippy::missing_errors_doc)]

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, Month, OffsetDateTime, Time};

pub const LOW_THRESHOLD: f64 = 70.0;
pub const HIGH_THRESHOLD: f64 = 140.0;
pub const SUGGESTED_Y_MIN: f64 = 50.0;
pub const SUGGESTED_Y_MAX: f64 = 200.0;
pub const DEFAULT_SLOT_NAME: &str = "glucoseRecords";
pub const UNCATEGORIZED_LABEL: &str = "-";
pub const SUMMARY_PLACEHOLDER: &str = "--";
pub const EMPTY_TABLE_MESSAGE: &str = "No glucose records yet.";
pub const NO_MATCH_MESSAGE: &str = "No records match the current filters.";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrackerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseStatus {
    Low,
    Normal,
    High,
}

impl GlucoseStatus {
    /// Classifies a reading; both thresholds are inclusive to `Normal`.
    #[must_use]
    pub fn classify(value: f64) -> Self {
        if value < LOW_THRESHOLD {
            Self::Low
        } else if value > HIGH_THRESHOLD {
            Self::High
        } else {
            Self::Normal
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn row_class(self) -> &'static str {
        match self {
            Self::Low => "glucose-low",
            Self::Normal => "glucose-normal",
            Self::High => "glucose-high",
        }
    }

    #[must_use]
    pub fn color_token(self) -> &'static str {
        match self {
            Self::Low => "low-color",
            Self::Normal => "normal-color",
            Self::High => "high-color",
        }
    }
}

/// A single logged reading. Records are never edited in place; the store
/// only appends new ones or removes existing ones by id.
///
/// Field names on the wire follow the persisted slot format (`glucose`,
/// `medication`); the longer names are accepted on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "StoredRecord")]
pub struct GlucoseRecord {
    pub id: RecordId,
    pub date: String,
    pub time: String,
    #[serde(rename = "glucose")]
    pub glucose_value: f64,
    #[serde(rename = "medication")]
    pub medication_taken: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

// Slots written by other revisions may carry either spelling, or both.
#[derive(Debug, Deserialize)]
struct StoredRecord {
    id: RecordId,
    date: String,
    time: String,
    glucose: Option<f64>,
    #[serde(rename = "glucoseValue")]
    glucose_value: Option<f64>,
    medication: Option<bool>,
    #[serde(rename = "medicationTaken")]
    medication_taken: Option<bool>,
    #[serde(default)]
    category: Option<String>,
}

impl TryFrom<StoredRecord> for GlucoseRecord {
    type Error = String;

    fn try_from(stored: StoredRecord) -> Result<Self, Self::Error> {
        let glucose_value = stored
            .glucose
            .or(stored.glucose_value)
            .ok_or_else(|| format!("record {} has no glucose value", stored.id))?;

        Ok(Self {
            id: stored.id,
            date: stored.date,
            time: stored.time,
            glucose_value,
            medication_taken: stored.medication.or(stored.medication_taken).unwrap_or(false),
            category: normalize_category(stored.category),
        })
    }
}

fn normalize_category(category: Option<String>) -> Option<String> {
    category
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl GlucoseRecord {
    #[must_use]
    pub fn status(&self) -> GlucoseStatus {
        GlucoseStatus::classify(self.glucose_value)
    }

    #[must_use]
    pub fn month_key(&self) -> &str {
        self.date.get(..7).unwrap_or(&self.date)
    }

    #[must_use]
    pub fn timestamp_label(&self) -> String {
        format!("{} {}", self.date, self.time)
    }

    #[must_use]
    pub fn category_label(&self) -> &str {
        self.category.as_deref().unwrap_or(UNCATEGORIZED_LABEL)
    }
}

#[must_use]
pub fn format_glucose(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRecord {
    pub date: String,
    pub time: String,
    pub glucose_value: f64,
    pub medication_taken: bool,
    pub category: Option<String>,
}

impl NewRecord {
    pub fn validate(&self) -> Result<(), TrackerError> {
        parse_calendar_date(&self.date)?;
        parse_clock_time(&self.time)?;

        if !self.glucose_value.is_finite() {
            return Err(TrackerError::Validation(
                "glucose value MUST be a finite number".to_string(),
            ));
        }

        Ok(())
    }

    fn into_record(self, id: RecordId) -> GlucoseRecord {
        GlucoseRecord {
            id,
            date: self.date,
            time: self.time,
            glucose_value: self.glucose_value,
            medication_taken: self.medication_taken,
            category: normalize_category(self.category),
        }
    }
}

/// Parses a zero-padded `YYYY-MM-DD` date.
pub fn parse_calendar_date(value: &str) -> Result<Date, TrackerError> {
    let invalid = || TrackerError::Validation(format!("date MUST be YYYY-MM-DD, got '{value}'"));

    let bytes = value.as_bytes();
    if !value.is_ascii() || bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return Err(invalid());
    }

    let year: i32 = parse_digits(&value[0..4]).ok_or_else(invalid)?;
    let month: u8 = parse_digits(&value[5..7]).ok_or_else(invalid)?;
    let day: u8 = parse_digits(&value[8..10]).ok_or_else(invalid)?;
    let month = Month::try_from(month).map_err(|_| invalid())?;

    Date::from_calendar_date(year, month, day).map_err(|_| invalid())
}

/// Parses a zero-padded 24-hour `HH:MM` clock time.
pub fn parse_clock_time(value: &str) -> Result<Time, TrackerError> {
    let invalid = || TrackerError::Validation(format!("time MUST be HH:MM, got '{value}'"));

    let bytes = value.as_bytes();
    if !value.is_ascii() || bytes.len() != 5 || bytes[2] != b':' {
        return Err(invalid());
    }

    let hour: u8 = parse_digits(&value[0..2]).ok_or_else(invalid)?;
    let minute: u8 = parse_digits(&value[3..5]).ok_or_else(invalid)?;

    Time::from_hms(hour, minute, 0).map_err(|_| invalid())
}

fn parse_digits<T: std::str::FromStr>(raw: &str) -> Option<T> {
    if raw.bytes().all(|byte| byte.is_ascii_digit()) {
        raw.parse().ok()
    } else {
        None
    }
}

#[must_use]
pub fn now_millis() -> i64 {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    All,
    High,
    Normal,
    Low,
}

impl StatusFilter {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    #[must_use]
    pub fn matches(self, record: &GlucoseRecord) -> bool {
        match self {
            Self::All => true,
            Self::High => record.status() == GlucoseStatus::High,
            Self::Normal => record.status() == GlucoseStatus::Normal,
            Self::Low => record.status() == GlucoseStatus::Low,
        }
    }
}

/// Category selection. Records without a category only ever match `All`.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum CategoryFilter {
    #[default]
    All,
    Named(String),
}

impl CategoryFilter {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "all" {
            Self::All
        } else {
            Self::Named(value.to_string())
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "all",
            Self::Named(name) => name,
        }
    }

    #[must_use]
    pub fn matches(&self, record: &GlucoseRecord) -> bool {
        match self {
            Self::All => true,
            Self::Named(name) => record.category.as_deref() == Some(name.as_str()),
        }
    }
}

/// Inclusive date bounds compared lexicographically on `YYYY-MM-DD`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

impl DateRange {
    pub fn from_bounds(start: Option<&str>, end: Option<&str>) -> Result<Self, TrackerError> {
        let start = start.map(str::trim).filter(|value| !value.is_empty());
        let end = end.map(str::trim).filter(|value| !value.is_empty());

        match (start, end) {
            (Some(start), Some(end)) => Ok(Self {
                start: start.to_string(),
                end: end.to_string(),
            }),
            _ => Err(TrackerError::Validation(
                "please choose both a start date and an end date".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn contains(&self, date: &str) -> bool {
        date >= self.start.as_str() && date <= self.end.as_str()
    }
}

#[must_use]
pub fn filter_by_status(records: &[GlucoseRecord], criterion: StatusFilter) -> Vec<GlucoseRecord> {
    records
        .iter()
        .filter(|record| criterion.matches(record))
        .cloned()
        .collect()
}

#[must_use]
pub fn filter_by_date_range(records: &[GlucoseRecord], range: &DateRange) -> Vec<GlucoseRecord> {
    records
        .iter()
        .filter(|record| range.contains(&record.date))
        .cloned()
        .collect()
}

#[must_use]
pub fn filter_by_category(
    records: &[GlucoseRecord],
    category: &CategoryFilter,
) -> Vec<GlucoseRecord> {
    records
        .iter()
        .filter(|record| category.matches(record))
        .cloned()
        .collect()
}

fn chronological(a: &GlucoseRecord, b: &GlucoseRecord) -> Ordering {
    a.date.cmp(&b.date).then_with(|| a.time.cmp(&b.time))
}

#[must_use]
pub fn sort_descending(records: &[GlucoseRecord]) -> Vec<GlucoseRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| chronological(b, a));
    sorted
}

#[must_use]
pub fn sort_ascending(records: &[GlucoseRecord]) -> Vec<GlucoseRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by(chronological);
    sorted
}

/// Table cursor over a descending view. Pages are 1-indexed; page 0 only
/// appears while the view is empty.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Paginator {
    current_page: usize,
    page_size: usize,
}

impl Paginator {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            current_page: 1,
            page_size: page_size.max(1),
        }
    }

    #[must_use]
    pub fn current_page(&self) -> usize {
        self.current_page
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn total_pages(&self, record_count: usize) -> usize {
        record_count.div_ceil(self.page_size)
    }

    pub fn reset(&mut self) {
        self.current_page = 1;
    }

    /// Moves the cursor; out-of-range pages are clamped on the next `paginate`.
    pub fn go_to(&mut self, page: usize) {
        self.current_page = page;
    }

    pub fn previous(&mut self) -> bool {
        if self.current_page > 1 {
            self.current_page -= 1;
            true
        } else {
            false
        }
    }

    pub fn next(&mut self, total_pages: usize) -> bool {
        if self.current_page < total_pages {
            self.current_page += 1;
            true
        } else {
            false
        }
    }

    pub fn paginate(&mut self, sorted_descending: &[GlucoseRecord]) -> Page {
        let total_records = sorted_descending.len();
        let total_pages = self.total_pages(total_records);

        if total_pages == 0 {
            self.current_page = 0;
        } else if self.current_page > total_pages {
            self.current_page = total_pages;
        } else if self.current_page == 0 {
            self.current_page = 1;
        }

        let records = if self.current_page == 0 {
            Vec::new()
        } else {
            let start = (self.current_page - 1) * self.page_size;
            let end = (start + self.page_size).min(total_records);
            sorted_descending[start..end].to_vec()
        };

        Page {
            records,
            current_page: self.current_page,
            total_pages,
            total_records,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<GlucoseRecord>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_records: usize,
}

impl Page {
    #[must_use]
    pub fn previous_disabled(&self) -> bool {
        self.current_page <= 1
    }

    #[must_use]
    pub fn next_disabled(&self) -> bool {
        self.current_page >= self.total_pages
    }

    #[must_use]
    pub fn page_info(&self) -> String {
        format!("Page {} / {}", self.current_page, self.total_pages.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableRow {
    pub record: GlucoseRecord,
    pub status: GlucoseStatus,
    pub row_class: String,
    pub medication_label: String,
    pub category_label: String,
}

impl TableRow {
    #[must_use]
    pub fn from_record(record: &GlucoseRecord) -> Self {
        let status = record.status();
        Self {
            record: record.clone(),
            status,
            row_class: status.row_class().to_string(),
            medication_label: if record.medication_taken {
                "yes".to_string()
            } else {
                "no".to_string()
            },
            category_label: record.category_label().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableEntry {
    MonthHeader { month: String },
    Row(TableRow),
}

/// Emits the page rows in order with a header before the first row and
/// before every row whose month differs from the previous row's month.
#[must_use]
pub fn group_by_month(page_records: &[GlucoseRecord]) -> Vec<TableEntry> {
    let mut entries = Vec::with_capacity(page_records.len() + 2);
    let mut last_month: Option<&str> = None;

    for record in page_records {
        let month = record.month_key();
        if last_month != Some(month) {
            entries.push(TableEntry::MonthHeader {
                month: month.to_string(),
            });
            last_month = Some(month);
        }
        entries.push(TableEntry::Row(TableRow::from_record(record)));
    }

    entries
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TablePage {
    pub entries: Vec<TableEntry>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_records: usize,
    pub page_info: String,
    pub previous_enabled: bool,
    pub next_enabled: bool,
    pub empty_message: Option<String>,
}

impl TablePage {
    /// `collection_is_empty` picks the empty-state text when the page has no rows.
    #[must_use]
    pub fn from_page(page: &Page, collection_is_empty: bool) -> Self {
        Self {
            entries: group_by_month(&page.records),
            current_page: page.current_page,
            total_pages: page.total_pages,
            total_records: page.total_records,
            page_info: page.page_info(),
            previous_enabled: !page.previous_disabled(),
            next_enabled: !page.next_disabled(),
            empty_message: (page.total_records == 0).then(|| {
                if collection_is_empty {
                    EMPTY_TABLE_MESSAGE.to_string()
                } else {
                    NO_MATCH_MESSAGE.to_string()
                }
            }),
        }
    }

    #[must_use]
    pub fn header_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, TableEntry::MonthHeader { .. }))
            .count()
    }
}

/// Fixed chart overlay: the target band, the high marker line and the
/// suggested y-axis range. These never depend on the data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChartOverlay {
    pub band_min: f64,
    pub band_max: f64,
    pub high_line: f64,
    pub suggested_min: f64,
    pub suggested_max: f64,
}

impl ChartOverlay {
    #[must_use]
    pub const fn fixed() -> Self {
        Self {
            band_min: LOW_THRESHOLD,
            band_max: HIGH_THRESHOLD,
            high_line: HIGH_THRESHOLD,
            suggested_min: SUGGESTED_Y_MIN,
            suggested_max: SUGGESTED_Y_MAX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartPoint {
    pub label: String,
    pub value: f64,
    pub status: GlucoseStatus,
    pub point_color: String,
}

impl ChartPoint {
    #[must_use]
    pub fn from_record(record: &GlucoseRecord) -> Self {
        let status = record.status();
        Self {
            label: record.timestamp_label(),
            value: record.glucose_value,
            status,
            point_color: status.color_token().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowStatus {
    NoRecords,
    AllRecords { count: usize },
    MostRecent { count: usize },
    Selection { start: String, end: String, count: usize },
    NoDataForSelection,
}

impl Display for WindowStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRecords => write!(f, "No glucose records available to chart yet."),
            Self::AllRecords { count } => write!(f, "Showing all {count} records."),
            Self::MostRecent { count } => write!(f, "Showing the most recent {count} records."),
            Self::Selection { start, end, count } => {
                write!(f, "Showing {count} records from {start} to {end}.")
            }
            Self::NoDataForSelection => {
                write!(f, "No records exist for the selected date range.")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartWindow {
    pub points: Vec<ChartPoint>,
    pub status: WindowStatus,
    pub overlay: ChartOverlay,
}

impl ChartWindow {
    fn from_sorted(records: &[GlucoseRecord], status: WindowStatus) -> Self {
        Self {
            points: records.iter().map(ChartPoint::from_record).collect(),
            status,
            overlay: ChartOverlay::fixed(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn status_text(&self) -> String {
        self.status.to_string()
    }
}

/// Chooses what feeds the trend chart: an explicit selection as-is, or the
/// trailing `window_size` records of the whole collection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChartWindowPolicy {
    window_size: usize,
}

impl ChartWindowPolicy {
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
        }
    }

    #[must_use]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    #[must_use]
    pub fn select(
        &self,
        collection: &[GlucoseRecord],
        explicit: Option<&[GlucoseRecord]>,
    ) -> ChartWindow {
        if let Some(selection) = explicit {
            let sorted = sort_ascending(selection);
            let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
                return ChartWindow::from_sorted(&[], WindowStatus::NoDataForSelection);
            };
            let status = WindowStatus::Selection {
                start: first.date.clone(),
                end: last.date.clone(),
                count: sorted.len(),
            };
            return ChartWindow::from_sorted(&sorted, status);
        }

        let sorted = sort_ascending(collection);
        let total = sorted.len();
        let status = if total == 0 {
            WindowStatus::NoRecords
        } else if total <= self.window_size {
            WindowStatus::AllRecords { count: total }
        } else {
            WindowStatus::MostRecent {
                count: self.window_size,
            }
        };

        let tail = &sorted[total.saturating_sub(self.window_size)..];
        ChartWindow::from_sorted(tail, status)
    }
}

/// Draws a prepared window. `destroy` releases whatever `draw` acquired.
pub trait ChartRenderer {
    type Handle;

    fn draw(&mut self, window: &ChartWindow) -> Result<Self::Handle, TrackerError>;

    fn destroy(&mut self, handle: Self::Handle);
}

/// Owns at most one live chart handle. Every `render` releases the previous
/// handle before acquiring a new one; an empty window leaves no live chart.
pub struct ChartSurface<R: ChartRenderer> {
    renderer: R,
    live: Option<R::Handle>,
}

impl<R: ChartRenderer> ChartSurface<R> {
    #[must_use]
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            live: None,
        }
    }

    /// Replaces the live chart with one for `window`. Returns whether a chart
    /// is live afterwards.
    pub fn render(&mut self, window: &ChartWindow) -> Result<bool, TrackerError> {
        self.clear();
        if window.is_empty() {
            return Ok(false);
        }

        let handle = self.renderer.draw(window)?;
        self.live = Some(handle);
        Ok(true)
    }

    pub fn clear(&mut self) {
        if let Some(handle) = self.live.take() {
            self.renderer.destroy(handle);
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    #[must_use]
    pub fn renderer(&self) -> &R {
        &self.renderer
    }
}

impl<R: ChartRenderer> Drop for ChartSurface<R> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TirTier {
    Alert,
    Caution,
    Good,
}

impl TirTier {
    #[must_use]
    pub fn for_percent(time_in_range_pct: u32) -> Self {
        if time_in_range_pct < 50 {
            Self::Alert
        } else if time_in_range_pct < 70 {
            Self::Caution
        } else {
            Self::Good
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Caution => "caution",
            Self::Good => "good",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SummaryMetrics {
    pub count: usize,
    pub average: f64,
    pub time_in_range_pct: u32,
    pub time_above_range_pct: u32,
    pub tir_tier: TirTier,
}

/// Readings below range count toward neither percentage but do count in
/// the denominator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryStats {
    NoData,
    Computed(SummaryMetrics),
}

impl SummaryStats {
    #[must_use]
    pub fn metrics(&self) -> Option<&SummaryMetrics> {
        match self {
            Self::NoData => None,
            Self::Computed(metrics) => Some(metrics),
        }
    }

    #[must_use]
    pub fn average_text(&self) -> String {
        self.metrics().map_or_else(
            || SUMMARY_PLACEHOLDER.to_string(),
            |metrics| format!("{:.1} mg/dL", metrics.average),
        )
    }

    #[must_use]
    pub fn time_in_range_text(&self) -> String {
        self.metrics().map_or_else(
            || SUMMARY_PLACEHOLDER.to_string(),
            |metrics| format!("{}%", metrics.time_in_range_pct),
        )
    }

    #[must_use]
    pub fn time_above_range_text(&self) -> String {
        self.metrics().map_or_else(
            || SUMMARY_PLACEHOLDER.to_string(),
            |metrics| format!("{}%", metrics.time_above_range_pct),
        )
    }
}

#[must_use]
pub fn summarize(view: &[GlucoseRecord]) -> SummaryStats {
    if view.is_empty() {
        return SummaryStats::NoData;
    }

    let mut total = 0.0_f64;
    let mut in_range = 0_usize;
    let mut above_range = 0_usize;

    for record in view {
        total += record.glucose_value;
        match record.status() {
            GlucoseStatus::Normal => in_range += 1,
            GlucoseStatus::High => above_range += 1,
            GlucoseStatus::Low => {}
        }
    }

    let count = view.len();
    let time_in_range_pct = rounded_percent(in_range, count);

    SummaryStats::Computed(SummaryMetrics {
        count,
        average: round_one_decimal(total / count_as_f64(count)),
        time_in_range_pct,
        time_above_range_pct: rounded_percent(above_range, count),
        tir_tier: TirTier::for_percent(time_in_range_pct),
    })
}

#[allow(clippy::cast_precision_loss)]
fn count_as_f64(count: usize) -> f64 {
    count as f64
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn rounded_percent(part: usize, total: usize) -> u32 {
    ((count_as_f64(part) / count_as_f64(total)) * 100.0).round() as u32
}

/// A single named durable slot holding the whole serialized collection.
pub trait RecordSlot {
    /// Reads the slot payload; `None` when the slot was never written.
    fn read(&self) -> Result<Option<String>, TrackerError>;

    fn write(&mut self, payload: &str) -> Result<(), TrackerError>;
}

/// In-process slot, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySlot {
    payload: Option<String>,
    writes: usize,
    fail_writes: bool,
}

impl MemorySlot {
    #[must_use]
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl RecordSlot for MemorySlot {
    fn read(&self) -> Result<Option<String>, TrackerError> {
        Ok(self.payload.clone())
    }

    fn write(&mut self, payload: &str) -> Result<(), TrackerError> {
        if self.fail_writes {
            return Err(TrackerError::Storage("memory slot is read-only".to_string()));
        }
        self.payload = Some(payload.to_string());
        self.writes += 1;
        Ok(())
    }
}

/// Decodes a slot payload, failing open: anything unparsable is an empty
/// collection. Later records reusing an earlier id are dropped.
#[must_use]
pub fn decode_slot_payload(payload: &str) -> Vec<GlucoseRecord> {
    let decoded: Option<Vec<GlucoseRecord>> = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "record slot payload is unparsable; starting empty");
            return Vec::new();
        }
    };

    let mut seen = BTreeSet::new();
    let mut records = Vec::new();
    for record in decoded.unwrap_or_default() {
        if seen.insert(record.id) {
            records.push(record);
        } else {
            tracing::warn!(id = %record.id, "dropping record with duplicate id from slot payload");
        }
    }
    records
}

pub fn encode_slot_payload(records: &[GlucoseRecord]) -> Result<String, TrackerError> {
    serde_json::to_string(records)
        .map_err(|err| TrackerError::Storage(format!("failed to encode record slot: {err}")))
}

/// Canonical append-only collection, synced to its slot after every mutation.
pub struct RecordStore<S: RecordSlot> {
    slot: S,
    records: Vec<GlucoseRecord>,
}

impl<S: RecordSlot> RecordStore<S> {
    /// Loads the slot contents; an absent, unreadable or unparsable slot
    /// yields an empty collection.
    pub fn load(slot: S) -> Self {
        let records = match slot.read() {
            Ok(Some(payload)) => decode_slot_payload(&payload),
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "record slot unreadable; starting empty");
                Vec::new()
            }
        };
        tracing::debug!(count = records.len(), "record store loaded");

        Self { slot, records }
    }

    #[must_use]
    pub fn records(&self) -> &[GlucoseRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&GlucoseRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    #[must_use]
    pub fn slot(&self) -> &S {
        &self.slot
    }

    #[must_use]
    pub fn into_slot(self) -> S {
        self.slot
    }

    /// Id for a record created at `now_ms`, bumped past every live id.
    #[must_use]
    pub fn next_id(&self, now_ms: i64) -> RecordId {
        let floor = self
            .records
            .iter()
            .map(|record| record.id.0)
            .max()
            .map_or(i64::MIN, |max| max.saturating_add(1));
        RecordId(now_ms.max(floor))
    }

    pub fn add(&mut self, input: NewRecord) -> Result<GlucoseRecord, TrackerError> {
        self.add_at(input, now_millis())
    }

    /// Appends a record created at `now_ms`. The collection is unchanged if
    /// the slot write fails.
    pub fn add_at(&mut self, input: NewRecord, now_ms: i64) -> Result<GlucoseRecord, TrackerError> {
        input.validate()?;
        let record = input.into_record(self.next_id(now_ms));
        self.records.push(record.clone());

        if let Err(err) = self.persist() {
            self.records.pop();
            return Err(err);
        }

        tracing::debug!(id = %record.id, date = %record.date, "record added");
        Ok(record)
    }

    /// Removes the record with `id`. Unknown ids are a no-op that does not
    /// touch the slot.
    pub fn remove(&mut self, id: RecordId) -> Result<bool, TrackerError> {
        let Some(index) = self.records.iter().position(|record| record.id == id) else {
            return Ok(false);
        };

        let removed = self.records.remove(index);
        if let Err(err) = self.persist() {
            self.records.insert(index, removed);
            return Err(err);
        }

        tracing::debug!(id = %id, "record removed");
        Ok(true)
    }

    pub fn persist(&mut self) -> Result<(), TrackerError> {
        let payload = encode_slot_payload(&self.records)?;
        self.slot.write(&payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TrackerConfig {
    pub config_version: u32,
    pub page_size: usize,
    pub chart_window: usize,
    pub advice_recent_count: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::v1()
    }
}

impl TrackerConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            page_size: 10,
            chart_window: 15,
            advice_recent_count: 5,
        }
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.config_version == 0 {
            return Err(TrackerError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("page_size", self.page_size),
            ("chart_window", self.chart_window),
            ("advice_recent_count", self.advice_recent_count),
        ] {
            if value == 0 {
                return Err(TrackerError::Configuration(format!("{name} MUST be >= 1")));
            }
        }

        Ok(())
    }

    pub fn from_json(value: &Value) -> Result<Self, TrackerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            TrackerError::Configuration(format!("invalid tracker config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerView {
    pub table: TablePage,
    pub chart: ChartWindow,
    pub summary: SummaryStats,
}

/// One logging session: the record store plus filter, page and chart-range
/// state. Every view is recomputed from the store on request.
pub struct Tracker<S: RecordSlot> {
    store: RecordStore<S>,
    config: TrackerConfig,
    paginator: Paginator,
    window_policy: ChartWindowPolicy,
    status_filter: StatusFilter,
    category_filter: CategoryFilter,
    chart_range: Option<DateRange>,
}

impl<S: RecordSlot> Tracker<S> {
    /// Loads the slot and starts a session on page 1 with no filters.
    pub fn open(slot: S, config: TrackerConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        Ok(Self {
            store: RecordStore::load(slot),
            paginator: Paginator::new(config.page_size),
            window_policy: ChartWindowPolicy::new(config.chart_window),
            config,
            status_filter: StatusFilter::All,
            category_filter: CategoryFilter::All,
            chart_range: None,
        })
    }

    #[must_use]
    pub fn store(&self) -> &RecordStore<S> {
        &self.store
    }

    #[must_use]
    pub fn records(&self) -> &[GlucoseRecord] {
        self.store.records()
    }

    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    #[must_use]
    pub fn status_filter(&self) -> StatusFilter {
        self.status_filter
    }

    #[must_use]
    pub fn category_filter(&self) -> &CategoryFilter {
        &self.category_filter
    }

    #[must_use]
    pub fn chart_range(&self) -> Option<&DateRange> {
        self.chart_range.as_ref()
    }

    #[must_use]
    pub fn current_page(&self) -> usize {
        self.paginator.current_page()
    }

    /// Appends a record and returns the table to page 1.
    pub fn add_record(&mut self, input: NewRecord) -> Result<GlucoseRecord, TrackerError> {
        self.add_record_at(input, now_millis())
    }

    pub fn add_record_at(
        &mut self,
        input: NewRecord,
        now_ms: i64,
    ) -> Result<GlucoseRecord, TrackerError> {
        let record = self.store.add_at(input, now_ms)?;
        self.paginator.reset();
        Ok(record)
    }

    /// Removes a record. The page cursor is kept and only clamped on the
    /// next table render.
    pub fn delete_record(&mut self, id: RecordId) -> Result<bool, TrackerError> {
        self.store.remove(id)
    }

    pub fn set_status_filter(&mut self, filter: StatusFilter) {
        self.status_filter = filter;
        self.paginator.reset();
    }

    pub fn set_category_filter(&mut self, filter: CategoryFilter) {
        self.category_filter = filter;
        self.paginator.reset();
    }

    pub fn go_to_page(&mut self, page: usize) {
        self.paginator.go_to(page);
    }

    pub fn previous_page(&mut self) -> bool {
        self.paginator.previous()
    }

    pub fn next_page(&mut self) -> bool {
        let total_pages = self.paginator.total_pages(self.filtered_view().len());
        self.paginator.next(total_pages)
    }

    /// Restricts the chart to an inclusive date range. A missing bound is
    /// rejected without touching the session.
    pub fn apply_chart_range(
        &mut self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<ChartWindow, TrackerError> {
        let range = DateRange::from_bounds(start, end)?;
        self.chart_range = Some(range);
        Ok(self.chart_window())
    }

    pub fn reset_chart_range(&mut self) -> ChartWindow {
        self.chart_range = None;
        self.chart_window()
    }

    #[must_use]
    pub fn filtered_view(&self) -> Vec<GlucoseRecord> {
        let by_status = filter_by_status(self.store.records(), self.status_filter);
        let by_category = filter_by_category(&by_status, &self.category_filter);
        sort_descending(&by_category)
    }

    pub fn table_page(&mut self) -> TablePage {
        let view = self.filtered_view();
        let page = self.paginator.paginate(&view);
        TablePage::from_page(&page, self.store.is_empty())
    }

    #[must_use]
    pub fn chart_window(&self) -> ChartWindow {
        match &self.chart_range {
            Some(range) => {
                let selection = filter_by_date_range(self.store.records(), range);
                self.window_policy
                    .select(self.store.records(), Some(selection.as_slice()))
            }
            None => self.window_policy.select(self.store.records(), None),
        }
    }

    #[must_use]
    pub fn summary(&self) -> SummaryStats {
        summarize(self.store.records())
    }

    pub fn render(&mut self) -> TrackerView {
        TrackerView {
            table: self.table_page(),
            chart: self.chart_window(),
            summary: self.summary(),
        }
    }

    #[must_use]
    pub fn advice_prompt(&self) -> Option<String> {
        build_advice_prompt(self.store.records(), self.config.advice_recent_count)
    }

    #[must_use]
    pub fn into_store(self) -> RecordStore<S> {
        self.store
    }
}

#[must_use]
pub fn recent_records(records: &[GlucoseRecord], count: usize) -> &[GlucoseRecord] {
    &records[records.len().saturating_sub(count)..]
}

/// Renders the most recent records into the advice request template.
/// Returns `None` when there is nothing to analyze.
#[must_use]
pub fn build_advice_prompt(records: &[GlucoseRecord], count: usize) -> Option<String> {
    let recent = recent_records(records, count);
    if recent.is_empty() {
        return None;
    }

    let lines = recent
        .iter()
        .map(|record| {
            format!(
                "Date {} time {} glucose {} mg/dL, medication taken: {}",
                record.date,
                record.time,
                format_glucose(record.glucose_value),
                if record.medication_taken { "yes" } else { "no" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    Some(format!(
        "You are a health-care assistant. Based on the glucose readings below, give simple, \
         non-diagnostic lifestyle suggestions in a gentle tone for a general reader:\n\n\
         {lines}\n\n\
         Please analyze in particular:\n\
         1. The relationship and trend between glucose values and medication (for example, \
         whether readings settle after medication is taken).\n\
         2. Lifestyle suggestions for any high or low readings.\n\n\
         Limit the advice to a list of 3 points, each no longer than two sentences."
    ))
}
