//! Process-wide logger with an optional (chain, network) scope per record.
//!
//! Records go to stderr as text or JSON lines. Tests can additionally keep
//! the most recent records in memory and inspect them per scope.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let level = match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        };
        Some(level)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn load() -> Self {
        if FORMAT.load(Ordering::Relaxed) == Format::Json as u8 {
            Format::Json
        } else {
            Format::Text
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static STDERR: AtomicBool = AtomicBool::new(true);
static CAPTURE: OnceLock<Mutex<Capture>> = OnceLock::new();

/// A record kept in memory by [`enable_capture`].
#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub chain: Option<String>,
    pub msg: String,
}

/// Ring of recent records; capacity 0 means capture is off.
struct Capture {
    capacity: usize,
    records: VecDeque<CapturedLog>,
}

impl Capture {
    fn push(&mut self, record: CapturedLog) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }
}

fn with_capture<T>(f: impl FnOnce(&mut Capture) -> T) -> Option<T> {
    let capture = CAPTURE.get()?;
    let mut guard = capture.lock().ok()?;
    Some(f(&mut guard))
}

pub fn init(config: LogConfig) {
    MAX_LEVEL.store(config.level as u8, Ordering::Relaxed);
    FORMAT.store(config.format as u8, Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

/// Keeps the last `capacity` records in memory. Enabling again keeps what was captured.
pub fn enable_capture(capacity: usize) {
    let capture = CAPTURE.get_or_init(|| {
        Mutex::new(Capture {
            capacity: 0,
            records: VecDeque::new(),
        })
    });
    if let Ok(mut guard) = capture.lock() {
        guard.capacity = capacity;
        while guard.records.len() > capacity {
            guard.records.pop_front();
        }
    }
}

pub fn disable_capture() {
    with_capture(|capture| capture.capacity = 0);
}

pub fn clear_captured_logs() {
    with_capture(|capture| capture.records.clear());
}

pub fn set_stderr_enabled(enabled: bool) {
    STDERR.store(enabled, Ordering::Relaxed);
}

/// Up to `limit` of the newest captured records, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    with_capture(|capture| {
        let skip = capture.records.len().saturating_sub(limit);
        capture.records.iter().skip(skip).cloned().collect()
    })
    .unwrap_or_default()
}

/// Captured records for one (chain, network) scope, oldest first.
pub fn captured_for_chain(chain: &str) -> Vec<CapturedLog> {
    with_capture(|capture| {
        capture
            .records
            .iter()
            .filter(|record| record.chain.as_deref() == Some(chain))
            .cloned()
            .collect()
    })
    .unwrap_or_default()
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

struct Record<'a> {
    at: Duration,
    level: Level,
    target: &'static str,
    chain: Option<String>,
    file: &'static str,
    line: u32,
    msg: &'a str,
}

impl Record<'_> {
    fn ts_ms(&self) -> u64 {
        u64::try_from(self.at.as_millis()).unwrap_or(u64::MAX)
    }

    fn write_text(&self, out: &mut impl Write, timestamps: bool) -> io::Result<()> {
        if timestamps {
            let ts = Timestamp {
                unix_seconds: self.at.as_secs(),
                millis: self.at.subsec_millis(),
            };
            write!(out, "{ts} ")?;
        }
        write!(out, "{} {}", self.level.as_str(), self.target)?;
        if let Some(chain) = &self.chain {
            write!(out, " [{chain}]")?;
        }
        writeln!(out, ": {}", self.msg)
    }

    fn write_json(&self, out: &mut impl Write) -> io::Result<()> {
        let line = json!({
            "ts_ms": self.ts_ms(),
            "level": self.level.as_str(),
            "target": self.target,
            "chain": self.chain,
            "file": self.file,
            "line": self.line,
            "msg": self.msg,
        });
        writeln!(out, "{line}")
    }
}

/// Writes one record. `chain` is the (chain, network) scope of the emitting worker, if any.
pub fn log(
    level: Level,
    target: &'static str,
    chain: Option<&dyn fmt::Display>,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }
    let msg = args.to_string();
    let record = Record {
        at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
        level,
        target,
        chain: chain.map(ToString::to_string),
        file,
        line,
        msg: &msg,
    };

    if STDERR.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        // Nowhere to report a failed stderr write.
        let _ = match Format::load() {
            Format::Text => record.write_text(&mut out, TIMESTAMPS.load(Ordering::Relaxed)),
            Format::Json => record.write_json(&mut out),
        };
    }

    with_capture(|capture| {
        capture.push(CapturedLog {
            ts_ms: record.ts_ms(),
            level,
            target,
            chain: record.chain.clone(),
            msg: msg.clone(),
        })
    });
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, chain: $scope:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log(
                $level,
                module_path!(),
                Some(&$scope as &dyn ::std::fmt::Display),
                file!(),
                line!(),
                format_args!($($arg)*),
            );
        }
    }};
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), None, file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// RFC 3339 UTC rendering without a date-time dependency.
struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = (self.unix_seconds / 86_400) as i64;
        let second_of_day = self.unix_seconds % 86_400;
        let (year, month, day) = date_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            second_of_day / 3600,
            second_of_day / 60 % 60,
            second_of_day % 60,
            self.millis
        )
    }
}

/// Proleptic Gregorian date for a day count since 1970-01-01 (Hinnant's algorithm).
fn date_from_days(days: i64) -> (i64, u32, u32) {
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era = (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * month_index + 2) / 5 + 1) as u32;
    let month = (if month_index < 10 { month_index + 3 } else { month_index - 9 }) as u32;
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_and_formats_parse_case_insensitively() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse(" WARNING "), Some(Level::Warn));
        assert_eq!(Level::parse("trace"), Some(Level::Trace));
        assert_eq!(Level::parse("verbose"), None);
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("yaml"), None);
        assert!(Level::Error < Level::Debug);
    }

    #[test]
    fn scoped_records_are_captured_with_chain() {
        set_stderr_enabled(false);
        enable_capture(64);
        log_warn!(chain: "LOGTEST:regtest", "fork tie at height {}", 7);
        log_warn!("unscoped");
        let scoped = captured_for_chain("LOGTEST:regtest");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].level, Level::Warn);
        assert_eq!(scoped[0].msg, "fork tie at height 7");
    }

    #[test]
    fn text_and_json_renderings_carry_the_scope() {
        let record = Record {
            at: Duration::from_millis(86_400_000 + 1_500),
            level: Level::Info,
            target: "chainidx::sync",
            chain: Some("BTC:mainnet".to_string()),
            file: "sync.rs",
            line: 12,
            msg: "caught up",
        };
        let mut text = Vec::new();
        record.write_text(&mut text, true).expect("text");
        assert_eq!(
            String::from_utf8(text).expect("utf8"),
            "1970-01-02T00:00:01.500Z INFO chainidx::sync [BTC:mainnet]: caught up\n"
        );

        let mut line = Vec::new();
        record.write_json(&mut line).expect("json");
        let value: serde_json::Value = serde_json::from_slice(&line).expect("parse");
        assert_eq!(value["chain"], "BTC:mainnet");
        assert_eq!(value["ts_ms"], 86_401_500u64);
    }

    #[test]
    fn dates_cover_leap_years() {
        assert_eq!(date_from_days(0), (1970, 1, 1));
        assert_eq!(date_from_days(365), (1971, 1, 1));
        assert_eq!(date_from_days(11_016), (2000, 2, 29));
        assert_eq!(date_from_days(-1), (1969, 12, 31));
    }
}
