/// Helper utilities for the controller: naming rules, formatting, unit state

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::utils::{ARCHIVE_EXTENSION, ARCHIVE_TIMESTAMP_FORMAT, SAFETY_COPY_INFIX};

fn safety_copy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<stem>.+)_backup_(?P<ts>\d+)$").unwrap())
}

/// Name of the safety copy taken from `volume` at `unix_time`
pub fn safety_copy_name(volume: &str, unix_time: i64) -> String {
    format!("{}{}{}", volume, SAFETY_COPY_INFIX, unix_time)
}

/// Split a safety copy name into its origin volume and unix time
pub fn parse_safety_copy(name: &str) -> Option<(String, i64)> {
    let caps = safety_copy_regex().captures(name)?;
    let ts = caps["ts"].parse::<i64>().ok()?;
    Some((caps["stem"].to_string(), ts))
}

pub fn is_safety_copy(name: &str) -> bool {
    parse_safety_copy(name).is_some()
}

/// Full volume name for a short name: `{project}_{short}`
pub fn volume_name(project: &str, short_name: &str) -> String {
    format!("{}_{}", project, short_name)
}

/// Short name of a stack volume, if it belongs to `project`
pub fn volume_short_name<'a>(project: &str, volume: &'a str) -> Option<&'a str> {
    volume
        .strip_prefix(project)
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|short| !short.is_empty())
}

/// Archive stem: `{name}_{YYYY-MM-DD_HH-MM-SS}`
pub fn archive_stem<Tz: TimeZone>(name: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}_{}", name, at.format(ARCHIVE_TIMESTAMP_FORMAT))
}

/// Date-time embedded in an archive file name, if it carries one
pub fn archive_timestamp(file_name: &str) -> Option<NaiveDateTime> {
    let mut parts = strip_archive_extension(file_name).rsplitn(3, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    // A name must precede the date-time
    parts.next()?;
    NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), ARCHIVE_TIMESTAMP_FORMAT).ok()
}

/// Archive file name for a stem
pub fn archive_file_name(stem: &str) -> String {
    format!("{}.{}", stem, ARCHIVE_EXTENSION)
}

/// Strip `.tar.gz`, `.tgz`, `.tar` from an archive file name
pub fn strip_archive_extension(file_name: &str) -> &str {
    [".tar.gz", ".tgz", ".tar"]
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .unwrap_or(file_name)
}

/// Project identifiers follow the compose naming rules
pub fn is_valid_project_id(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Snapshot names end up in file names
pub fn is_valid_archive_name(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format an elapsed duration for the stage timeline
pub fn format_elapsed(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

/// Format timestamp to human-readable string
pub fn format_timestamp(timestamp: i64) -> String {
    match DateTime::from_timestamp(timestamp, 0) {
        Some(dt) => {
            let local: DateTime<Local> = dt.into();
            local.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        None => format!("@{}", timestamp),
    }
}

/// Simplified container state, as reported by the runtime's `State` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Running,
    Created,
    Exited,
    Paused,
    Restarting,
    Dead,
    Unknown,
}

impl From<&str> for UnitState {
    fn from(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "running" => UnitState::Running,
            "created" => UnitState::Created,
            "exited" => UnitState::Exited,
            "paused" => UnitState::Paused,
            "restarting" => UnitState::Restarting,
            "dead" | "removing" => UnitState::Dead,
            _ => UnitState::Unknown,
        }
    }
}

impl UnitState {
    /// Paused and restarting units still hold their processes
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            UnitState::Running | UnitState::Paused | UnitState::Restarting
        )
    }

    /// Leftovers the zombie cleanup pass removes
    pub fn is_zombie(&self) -> bool {
        matches!(self, UnitState::Created | UnitState::Exited | UnitState::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Running => "running",
            UnitState::Created => "created",
            UnitState::Exited => "exited",
            UnitState::Paused => "paused",
            UnitState::Restarting => "restarting",
            UnitState::Dead => "dead",
            UnitState::Unknown => "unknown",
        }
    }
}
