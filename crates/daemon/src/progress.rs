//! Encoder output parsing.
//!
//! HandBrake reports progress as lines like
//! `Encoding: task 1 of 1, 86.50 % (41.2 fps, avg 40.8 fps, ETA 00h12m34s)`,
//! often separated by carriage returns, and prints a completion marker when
//! the encode finishes. [`ProgressTracker`] turns raw output chunks into job
//! progress and status.

use crate::jobs::{status, Job};
use regex::Regex;
use std::sync::LazyLock;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d+) %").expect("valid regex"));

static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ETA (\d{2})h(\d{2})m(\d{2})s").expect("valid regex"));

/// Remaining time reported by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eta {
    pub hours: String,
    pub minutes: String,
    pub seconds: String,
}

/// A percentage report pulled out of one output segment.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentReport {
    /// The percentage as printed, e.g. `86.50`.
    pub text: String,
    pub value: f64,
    pub eta: Option<Eta>,
}

impl PercentReport {
    /// Status line for this report.
    pub fn status(&self) -> String {
        match &self.eta {
            Some(eta) => format!(
                "{}% complete, Time remaining {}:{}:{}.",
                self.text, eta.hours, eta.minutes, eta.seconds
            ),
            None => format!("{}% complete.", self.text),
        }
    }
}

/// Find the most recent percentage report in an output chunk.
///
/// The chunk is split on line breaks and carriage returns; the last segment
/// carrying a percentage wins, and its ETA is read from the same segment.
pub fn parse_percent(chunk: &str) -> Option<PercentReport> {
    chunk
        .split(['\r', '\n'])
        .filter_map(|segment| {
            let caps = PERCENT_RE.captures(segment)?;
            let text = caps.get(1)?.as_str().to_string();
            let value = text.parse::<f64>().ok()?;
            let eta = ETA_RE.captures(segment).map(|c| Eta {
                hours: c[1].to_string(),
                minutes: c[2].to_string(),
                seconds: c[3].to_string(),
            });
            Some(PercentReport { text, value, eta })
        })
        .last()
}

/// Parser states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// No percentage seen yet.
    Searching,
    /// At least one percentage seen.
    PercentFound,
    /// Completion marker seen.
    Done,
}

/// Changes to apply to the active job after one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: Option<f64>,
    pub status: String,
    pub complete: bool,
}

impl ProgressUpdate {
    pub fn apply(&self, job: &mut Job) {
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        job.status = self.status.clone();
        if self.complete {
            job.complete = true;
        }
    }
}

/// Per-process state machine over encoder output.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    state: ParserState,
    completion_marker: Regex,
}

impl ProgressTracker {
    pub fn new(completion_marker: Regex) -> Self {
        Self {
            state: ParserState::Searching,
            completion_marker,
        }
    }

    /// Build a tracker from the configured marker pattern.
    pub fn from_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(Regex::new(pattern)?))
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Start over for a new process.
    pub fn reset(&mut self) {
        self.state = ParserState::Searching;
    }

    /// Feed one output chunk.
    pub fn observe(&mut self, chunk: &str) -> ProgressUpdate {
        let report = parse_percent(chunk);
        let marker = self.completion_marker.is_match(chunk);

        if marker {
            self.state = ParserState::Done;
        } else if report.is_some() && self.state == ParserState::Searching {
            self.state = ParserState::PercentFound;
        }

        let status = match (&report, self.state) {
            (Some(report), _) => report.status(),
            (None, ParserState::Done) => status::COMPLETED.to_string(),
            (None, _) => status::STARTING.to_string(),
        };

        ProgressUpdate {
            progress: report.map(|r| r.value),
            status,
            complete: self.state == ParserState::Done,
        }
    }
}
