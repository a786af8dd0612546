//! Line classification, run merging and the bounded log view.
//!
//! Each delivered batch goes through [`LogPipeline::apply`]: a new session
//! clears the view and counters, the traffic window decides whether the
//! batch is rendered or replaced by a rate advisory, rendered lines are
//! classified and merged into runs, and the history cap is enforced.

use std::collections::VecDeque;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tail::LogBatch;
use crate::traffic::{TrafficVerdict, TrafficWindow};

/// Style tag of a rendered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineClass {
    Error,
    Warning,
    Startup,
    Info,
    /// Supervisor-generated text such as placeholders and advisories.
    Notice,
}

impl std::fmt::Display for LineClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Startup => "startup",
            Self::Info => "info",
            Self::Notice => "notice",
        };
        f.write_str(name)
    }
}

/// Ordered pattern matching: error, then warning, then startup.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    error: Option<Regex>,
    warning: Option<Regex>,
    startup: Option<Regex>,
}

impl Classifier {
    /// `None` patterns never match.
    #[must_use]
    pub fn new(error: Option<Regex>, warning: Option<Regex>, startup: Option<Regex>) -> Self {
        Self {
            error,
            warning,
            startup,
        }
    }

    #[must_use]
    pub fn classify(&self, line: &str) -> LineClass {
        let hit = |re: &Option<Regex>| re.as_ref().is_some_and(|re| re.is_match(line));
        if hit(&self.error) {
            LineClass::Error
        } else if hit(&self.warning) {
            LineClass::Warning
        } else if hit(&self.startup) {
            LineClass::Startup
        } else {
            LineClass::Info
        }
    }
}

/// Consecutive lines sharing one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRun {
    pub class: LineClass,
    pub lines: Vec<String>,
}

impl LogRun {
    #[must_use]
    pub fn new(class: LineClass, lines: Vec<String>) -> Self {
        Self { class, lines }
    }

    #[must_use]
    pub fn single(class: LineClass, line: impl Into<String>) -> Self {
        Self::new(class, vec![line.into()])
    }
}

/// Append `line` to `runs`, extending the last run when the class matches.
pub fn push_merged(runs: &mut Vec<LogRun>, class: LineClass, line: String) {
    match runs.last_mut() {
        Some(run) if run.class == class => run.lines.push(line),
        _ => runs.push(LogRun::single(class, line)),
    }
}

/// Per-slot counters since the last new session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningCounters {
    pub error_count: u64,
    pub warn_count: u64,
    pub startup_count: u64,
    /// Text of the first error since the last reset.
    pub first_error: Option<String>,
}

impl RunningCounters {
    pub fn observe(&mut self, class: LineClass, line: &str) {
        match class {
            LineClass::Error => {
                self.error_count += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(line.to_string());
                }
            }
            LineClass::Warning => self.warn_count += 1,
            LineClass::Startup => self.startup_count += 1,
            LineClass::Info | LineClass::Notice => {}
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Bounded history of rendered runs, with a pause toggle.
///
/// While rendering is paused, runs are still stored and also collected in a
/// backlog that [`set_rendering`](Self::set_rendering) hands back in one
/// piece when rendering resumes.
#[derive(Debug)]
pub struct LogView {
    /// Maximum lines kept. Zero keeps everything.
    cap: usize,
    runs: VecDeque<LogRun>,
    line_count: usize,
    rendering: bool,
    backlog: Vec<LogRun>,
    advisory: Option<String>,
    placeholder: Option<String>,
}

impl LogView {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            runs: VecDeque::new(),
            line_count: 0,
            rendering: true,
            backlog: Vec::new(),
            advisory: None,
            placeholder: None,
        }
    }

    /// Store `runs`. Returns what should be rendered now, which is nothing
    /// while paused.
    pub fn push(&mut self, runs: Vec<LogRun>) -> Vec<LogRun> {
        if runs.is_empty() {
            return Vec::new();
        }
        self.placeholder = None;
        self.advisory = None;
        for run in &runs {
            self.line_count += run.lines.len();
            match self.runs.back_mut() {
                Some(last) if last.class == run.class => last.lines.extend(run.lines.iter().cloned()),
                _ => self.runs.push_back(run.clone()),
            }
        }
        self.enforce_cap();

        if self.rendering {
            runs
        } else {
            for run in runs {
                match self.backlog.last_mut() {
                    Some(last) if last.class == run.class => last.lines.extend(run.lines),
                    _ => self.backlog.push(run),
                }
            }
            trim_front(&mut self.backlog, self.cap);
            Vec::new()
        }
    }

    fn enforce_cap(&mut self) {
        if self.cap == 0 {
            return;
        }
        while self.line_count > self.cap {
            let Some(front) = self.runs.front_mut() else {
                break;
            };
            let excess = self.line_count - self.cap;
            if front.lines.len() <= excess {
                self.line_count -= front.lines.len();
                self.runs.pop_front();
            } else {
                front.lines.drain(..excess);
                self.line_count -= excess;
            }
        }
    }

    /// Pause or resume rendering. Resuming returns the backlog.
    pub fn set_rendering(&mut self, enabled: bool) -> Vec<LogRun> {
        self.rendering = enabled;
        if enabled {
            std::mem::take(&mut self.backlog)
        } else {
            Vec::new()
        }
    }

    #[must_use]
    pub const fn is_rendering(&self) -> bool {
        self.rendering
    }

    /// Replace any previous advisory.
    pub fn set_advisory(&mut self, text: String) {
        self.advisory = Some(text);
    }

    #[must_use]
    pub fn advisory(&self) -> Option<&str> {
        self.advisory.as_deref()
    }

    /// Shown until real lines arrive.
    pub fn set_placeholder(&mut self, text: Option<String>) {
        self.placeholder = text;
    }

    #[must_use]
    pub fn placeholder(&self) -> Option<&str> {
        self.placeholder.as_deref()
    }

    pub fn clear(&mut self) {
        self.runs.clear();
        self.backlog.clear();
        self.line_count = 0;
        self.advisory = None;
        self.placeholder = None;
    }

    #[must_use]
    pub fn runs(&self) -> Vec<LogRun> {
        self.runs.iter().cloned().collect()
    }

    /// Visible lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> + '_ {
        self.runs
            .iter()
            .flat_map(|run| run.lines.iter().map(String::as_str))
    }

    #[must_use]
    pub const fn line_count(&self) -> usize {
        self.line_count
    }
}

/// Drop lines from the front until at most `cap` remain.
fn trim_front(runs: &mut Vec<LogRun>, cap: usize) {
    if cap == 0 {
        return;
    }
    let mut total: usize = runs.iter().map(|r| r.lines.len()).sum();
    while total > cap && !runs.is_empty() {
        let excess = total - cap;
        if runs[0].lines.len() <= excess {
            total -= runs.remove(0).lines.len();
        } else {
            runs[0].lines.drain(..excess);
            total -= excess;
        }
    }
}

/// What one batch changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchEffects {
    /// The view and counters were reset first.
    pub cleared: bool,
    /// Runs to render now.
    pub runs: Vec<LogRun>,
    /// Set when the batch was suppressed, with the measured rate.
    pub advisory_rate: Option<f64>,
    pub counters_changed: bool,
}

/// Classifier, traffic window, counters and view of one slot.
#[derive(Debug)]
pub struct LogPipeline {
    classifier: Classifier,
    traffic: TrafficWindow,
    counters: RunningCounters,
    view: LogView,
    total_lines: u64,
    suppressed_lines: u64,
}

impl LogPipeline {
    #[must_use]
    pub fn new(classifier: Classifier, update_limit: u64, history_cap: usize) -> Self {
        Self {
            classifier,
            traffic: TrafficWindow::new(update_limit),
            counters: RunningCounters::default(),
            view: LogView::new(history_cap),
            total_lines: 0,
            suppressed_lines: 0,
        }
    }

    pub fn apply(&mut self, batch: LogBatch) -> BatchEffects {
        if batch.is_new_session {
            self.traffic.clear();
        }
        let verdict = self.traffic.record(batch.lines.len(), batch.total_chars);
        self.apply_with_verdict(batch, verdict)
    }

    /// [`apply`](Self::apply) with an externally measured verdict.
    pub fn apply_with_verdict(&mut self, batch: LogBatch, verdict: TrafficVerdict) -> BatchEffects {
        let mut effects = BatchEffects::default();
        if batch.is_new_session {
            // Traffic for this batch is already measured.
            self.view.clear();
            self.counters.reset();
            effects.cleared = true;
            effects.counters_changed = true;
        }
        self.total_lines += batch.lines.len() as u64;

        if verdict.suppressed {
            self.suppressed_lines += batch.lines.len() as u64;
            self.view.set_advisory(advisory_text(verdict.rate));
            effects.advisory_rate = Some(verdict.rate);
            return effects;
        }

        let mut runs = Vec::new();
        for line in batch.lines {
            let class = self.classifier.classify(&line);
            if class != LineClass::Info {
                effects.counters_changed = true;
            }
            self.counters.observe(class, &line);
            push_merged(&mut runs, class, line);
        }
        effects.runs = self.view.push(runs);
        effects
    }

    /// Clear view and counters, as on a new session.
    pub fn reset(&mut self) {
        self.view.clear();
        self.counters.reset();
        self.traffic.clear();
    }

    #[must_use]
    pub fn counters(&self) -> &RunningCounters {
        &self.counters
    }

    #[must_use]
    pub fn view(&self) -> &LogView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut LogView {
        &mut self.view
    }

    #[must_use]
    pub const fn total_lines(&self) -> u64 {
        self.total_lines
    }

    #[must_use]
    pub const fn suppressed_lines(&self) -> u64 {
        self.suppressed_lines
    }

    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.view.advisory().is_some()
    }
}

/// Advisory shown instead of lines while the rate is over the limit.
#[must_use]
pub fn advisory_text(rate: f64) -> String {
    format!("Too many log messages ({rate:.0} chars/s), display paused")
}
