//! Trading-window gate: weekday + wall-clock ranges evaluated in a
//! configured timezone.
//!
//! Spec format: comma-separated entries `Days HH:MM-HH:MM` where `Days` is a
//! single weekday (`Sat`) or an inclusive range (`Mon-Fri`, wrapping ranges
//! like `Fri-Mon` allowed). An empty spec means always open.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
struct WindowEntry {
    days: [bool; 7],
    start: NaiveTime,
    end: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct TradingWindows {
    entries: Vec<WindowEntry>,
    tz: Tz,
}

fn parse_weekday(s: &str) -> Result<Weekday> {
    match s.to_lowercase().as_str() {
        "mon" => Ok(Weekday::Mon),
        "tue" => Ok(Weekday::Tue),
        "wed" => Ok(Weekday::Wed),
        "thu" => Ok(Weekday::Thu),
        "fri" => Ok(Weekday::Fri),
        "sat" => Ok(Weekday::Sat),
        "sun" => Ok(Weekday::Sun),
        other => Err(anyhow!("Unknown weekday: {}", other)),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("Invalid time: {}", s))
}

impl TradingWindows {
    pub fn parse(spec: &str, tz: Tz) -> Result<Self> {
        let mut entries = Vec::new();
        for raw in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (days_part, time_part) = raw
                .split_once(' ')
                .ok_or_else(|| anyhow!("Window entry '{}' missing time range", raw))?;

            let mut days = [false; 7];
            if let Some((from, to)) = days_part.split_once('-') {
                let from = parse_weekday(from)?.num_days_from_monday() as usize;
                let to = parse_weekday(to)?.num_days_from_monday() as usize;
                let mut day = from;
                loop {
                    days[day] = true;
                    if day == to {
                        break;
                    }
                    day = (day + 1) % 7;
                }
            } else {
                days[parse_weekday(days_part)?.num_days_from_monday() as usize] = true;
            }

            let (start_raw, end_raw) = time_part
                .split_once('-')
                .ok_or_else(|| anyhow!("Window entry '{}' missing '-' in time range", raw))?;
            let start = parse_time(start_raw.trim())?;
            let end = parse_time(end_raw.trim())?;
            if end <= start {
                bail!("Window entry '{}' has end before start", raw);
            }
            entries.push(WindowEntry { days, start, end });
        }
        Ok(Self { entries, tz })
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let local = now.with_timezone(&self.tz);
        let day = local.weekday().num_days_from_monday() as usize;
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
            .unwrap_or(NaiveTime::MIN);
        self.entries
            .iter()
            .any(|entry| entry.days[day] && time >= entry.start && time <= entry.end)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}
