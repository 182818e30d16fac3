use std::collections::HashMap;

use ansi_term::Colour;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use chrono_english::parse_date_string;
use clap::{Parser, ValueEnum};
use now::DateTimeNow;

use crate::{
    daemon::{
        storage::{AggregationStore, Scope},
        DATABASE_FILE,
    },
    utils::percentage::{seconds_percentage, Percentage},
};

use super::create_application_default_path;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl std::fmt::Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportScope {
    Minute,
    Hour,
    Day,
}

impl From<ReportScope> for Scope {
    fn from(value: ReportScope) -> Self {
        match value {
            ReportScope::Minute => Scope::Minute,
            ReportScope::Hour => Scope::Hour,
            ReportScope::Day => Scope::Day,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportKind {
    /// Typing/reading slices, keyed by program and title.
    Activity,
    /// Time a program held the focus.
    Foreground,
    /// Time a previously-focused program kept running unfocused.
    Background,
}

#[derive(Debug, Parser)]
pub struct ReportCommand {
    #[arg(
        long = "start",
        short,
        help = "Start of the range. Examples are \"yesterday\", \"1 hour ago\", \"15/03/2025\". Defaults to the beginning of today"
    )]
    start_date: Option<String>,
    #[arg(long = "end", short, help = "End of the range. Defaults to now")]
    end_date: Option<String>,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
    #[arg(long, value_enum, default_value_t = ReportScope::Minute, help = "Aggregation resolution to read from")]
    scope: ReportScope,
    #[arg(long, value_enum, default_value_t = ReportKind::Foreground)]
    kind: ReportKind,
    #[arg(short = 'p', long = "percentage", help = "Filter programs to have at least specified percentage", default_value_t = Percentage::new_opt(1.).unwrap())]
    min_percentage: Percentage,
}

/// Prints per-program totals for the requested range, largest first.
pub async fn process_report_command(
    ReportCommand {
        start_date,
        end_date,
        date_style,
        scope,
        kind,
        min_percentage,
    }: ReportCommand,
) -> Result<()> {
    let (start, end) = parse_range(start_date, end_date, date_style)?;

    let store =
        AggregationStore::new(create_application_default_path()?.join(DATABASE_FILE))?;

    let scope = Scope::from(scope);
    let start_ms = start.timestamp_millis();
    let end_ms = end.timestamp_millis();

    let mut totals: HashMap<String, i64> = HashMap::new();
    match kind {
        ReportKind::Activity => {
            for row in store.activity_records_since(scope, start_ms).await? {
                if row.timestamp <= end_ms {
                    *totals.entry(format!("{} [{}]", row.program, row.event)).or_default() +=
                        row.seconds;
                }
            }
        }
        ReportKind::Foreground => {
            for row in store.foreground_records_since(scope, start_ms).await? {
                if row.timestamp <= end_ms {
                    *totals.entry(row.program).or_default() += row.seconds;
                }
            }
        }
        ReportKind::Background => {
            for row in store.background_records_since(scope, start_ms).await? {
                if row.timestamp <= end_ms {
                    *totals.entry(row.program).or_default() += row.seconds;
                }
            }
        }
    }

    let whole: i64 = totals.values().sum();
    if whole == 0 {
        println!("No records between {start} and {end}");
        return Ok(());
    }

    let mut entries: Vec<(String, i64)> = totals.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    for (program, seconds) in entries {
        let percentage = seconds_percentage(seconds, whole);
        if percentage < min_percentage {
            continue;
        }
        let share = format!("{:>3}%", *percentage as i32);
        let colored_share = if *percentage >= 25. {
            Colour::Green.paint(share)
        } else {
            Colour::Yellow.dimmed().paint(share)
        };
        println!(
            "{}\t{}\t{}",
            colored_share,
            format_duration(seconds),
            program
        );
    }
    Ok(())
}

fn parse_range(
    start_date: Option<String>,
    end_date: Option<String>,
    date_style: DateStyle,
) -> Result<(DateTime<Local>, DateTime<Local>)> {
    let now = Local::now();
    let dialect: chrono_english::Dialect = date_style.into();

    let start = match start_date.map(|s| parse_date_string(&s, now, dialect)) {
        Some(Ok(v)) => v.with_timezone(&Local),
        Some(Err(e)) => return Err(anyhow!("Failed to parse start date {e}")),
        None => now.beginning_of_day(),
    };
    let end = match end_date.map(|s| parse_date_string(&s, now, dialect)) {
        Some(Ok(v)) => v.with_timezone(&Local),
        Some(Err(e)) => return Err(anyhow!("Failed to parse end date {e}")),
        None => now,
    };
    if end < start {
        return Err(anyhow!("End of the range is before its start"));
    }
    Ok((start, end))
}

fn format_duration(seconds: i64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let rest = seconds % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{rest}s")
    } else if minutes > 0 {
        format!("{minutes}m{rest}s")
    } else {
        format!("{rest}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_compactly() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m5s");
        assert_eq!(format_duration(3725), "1h2m5s");
    }

    #[test]
    fn range_defaults_cover_today() {
        let (start, end) = parse_range(None, None, DateStyle::Uk).unwrap();
        assert!(start <= end);
        assert_eq!(start, start.beginning_of_day());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let result = parse_range(
            Some("today".to_string()),
            Some("yesterday".to_string()),
            DateStyle::Uk,
        );
        assert!(result.is_err());
    }
}
