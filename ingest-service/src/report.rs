use series_client::domain::{AnomalyKind, AnomalyRecord};
use time::{Duration, PrimitiveDateTime};

/// Run report, threaded explicitly through the stages that contribute
/// to it and assembled by the runner. Warnings and errors mark the
/// report so the caller can decide whether a notification is due.
#[derive(Debug, Clone)]
pub struct Report {
    started_at: PrimitiveDateTime,
    lines: Vec<String>,
    error: bool,
}

impl Report {
    pub fn new(started_at: PrimitiveDateTime) -> Self {
        Self { started_at, lines: Vec::new(), error: false }
    }

    pub fn info(&mut self, msg: impl Into<String>) {
        self.lines.push(format!("Info: {}", msg.into()));
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.lines.push(format!("Warning: {}", msg.into()));
        self.error = true;
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.lines.push(format!("Error: {}", msg.into()));
        self.error = true;
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Fold another stage's report into this one, in order.
    pub fn merge(&mut self, other: Report) {
        self.lines.extend(other.lines);
        self.error |= other.error;
    }

    /// Add detector findings, coalescing the meters that share one
    /// bucket and kind onto a single line. Findings arrive pre-grouped
    /// by bucket, so one forward pass suffices.
    pub fn findings(&mut self, findings: &[AnomalyRecord]) {
        let mut i = 0;
        while i < findings.len() {
            let first = &findings[i];
            let mut meters: Vec<&str> = Vec::new();
            let mut j = i;
            while j < findings.len()
                && findings[j].bucket_start == first.bucket_start
                && findings[j].kind == first.kind
            {
                if let Some(entity) = findings[j].entity.as_deref() {
                    meters.push(entity);
                }
                j += 1;
            }

            let ending = first.bucket_start + Duration::minutes(30);
            let line = if meters.is_empty() {
                format!("Warning: {}", first.context)
            } else {
                let what = match first.kind {
                    AnomalyKind::Missing => "missing power data for",
                    AnomalyKind::UnexpectedZero => "no power output from",
                };
                format!(
                    "Warning: period ending {:02}:{:02} on {}: {what} {} ({})",
                    ending.hour(),
                    ending.minute(),
                    first.date,
                    meters.join(", "),
                    first.context
                )
            };
            self.lines.push(line);
            self.error = true;
            i = j;
        }
    }

    /// The full report text: a titled header with the run start time,
    /// then every collected line.
    pub fn render(&self, title: &str) -> String {
        let mut out = format!(
            "{title}\nRun started {} {:02}:{:02} (UTC)\n\n",
            self.started_at.date(),
            self.started_at.hour(),
            self.started_at.minute()
        );
        if self.lines.is_empty() {
            out.push_str("No findings.\n");
        } else {
            for line in &self.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}
