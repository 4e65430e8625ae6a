use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::hours::{format_date, format_duration};
use crate::model::{ServiceHours, UserProfile};

/// One line of the service-hour report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub name: String,
    pub grade: String,
    /// `HH:MM:SS`; hours keep counting past 24.
    pub service_hours: String,
    /// `M/D/YYYY`
    pub start_date: String,
    pub end_date: String,
}

impl ReportRow {
    pub fn new(profile: &UserProfile, hours: &ServiceHours) -> Self {
        Self {
            name: profile.name.clone(),
            grade: profile.grade.clone().unwrap_or_default(),
            service_hours: format_duration(hours.seconds_tutored),
            start_date: format_date(hours.start_date),
            end_date: format_date(hours.end_date),
        }
    }
}

/// Destination for report rows.
pub trait ReportSink {
    fn write_row(&mut self, row: &ReportRow) -> io::Result<()>;

    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn write_rows(&mut self, rows: &[ReportRow]) -> io::Result<()> {
        for row in rows {
            self.write_row(row)?;
        }
        self.finish()
    }
}

/// One JSON object per line.
pub struct JsonLinesSink<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    fn write_row(&mut self, row: &ReportRow) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, row)?;
        self.out.write_all(b"\n")
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
