//! Job breakpoints. A breakpoint attaches to one operator's principal,
//! which slices it into per-worker local breakpoints; workers watch their
//! in-order tuple stream and report a trigger, the principal pauses the
//! topology, collects every slice, and either reports the breakpoint as
//! satisfied or re-arms it across the workers that are still live.

use log::debug;
use parse_display::Display;

use crate::exchange::GrainId;
use crate::tuple::Tuple;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("bp{0}")]
pub struct BreakpointId(pub u32);

/// What a job-level breakpoint watches for.
#[derive(Debug, Clone)]
pub enum BreakpointSpec {
    /// Trip once the operator has processed `target` tuples in total.
    Count { target: u64 },
    /// Trip on the first tuple whose field rendering contains the keyword.
    Conditional { field: usize, keyword: String },
}

/// One worker's slice of a breakpoint. Count targets are divided across
/// workers; conditional watches are replicated.
#[derive(Debug, Clone)]
pub struct LocalBreakpoint {
    pub id: BreakpointId,
    kind: LocalKind,
    tripped: bool,
}

#[derive(Debug, Clone)]
enum LocalKind {
    Count { seen: u64, target: u64 },
    Conditional { field: usize, keyword: String, matches: u64, last: Option<String> },
}

impl LocalBreakpoint {
    fn count(id: BreakpointId, target: u64) -> Self {
        LocalBreakpoint {
            id,
            kind: LocalKind::Count { seen: 0, target },
            tripped: false,
        }
    }

    fn conditional(id: BreakpointId, field: usize, keyword: String) -> Self {
        LocalBreakpoint {
            id,
            kind: LocalKind::Conditional {
                field,
                keyword,
                matches: 0,
                last: None,
            },
            tripped: false,
        }
    }

    /// Feeds one in-order tuple. True exactly once, on the turn the slice
    /// trips; counting continues afterwards so progress stays accurate.
    pub fn observe(&mut self, tuple: &Tuple) -> bool {
        let hit = match &mut self.kind {
            LocalKind::Count { seen, target } => {
                *seen += 1;
                *seen >= *target
            }
            LocalKind::Conditional {
                field,
                keyword,
                matches,
                last,
            } => {
                let found = tuple
                    .field(*field)
                    .map(|value| value.to_string().contains(keyword.as_str()))
                    .unwrap_or(false);
                if found {
                    *matches += 1;
                    *last = Some(tuple.to_line());
                }
                found
            }
        };
        if hit && !self.tripped {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn report(&self, grain: GrainId) -> LocalReport {
        let (progress, detail) = match &self.kind {
            LocalKind::Count { seen, .. } => (*seen, None),
            LocalKind::Conditional { matches, last, .. } => (*matches, last.clone()),
        };
        LocalReport {
            id: self.id,
            grain,
            progress,
            detail,
            tripped: self.tripped,
        }
    }
}

/// Snapshot a worker hands back when its slice is collected.
#[derive(Debug, Clone)]
pub struct LocalReport {
    pub id: BreakpointId,
    pub grain: GrainId,
    pub progress: u64,
    pub detail: Option<String>,
    pub tripped: bool,
}

/// Outcome of folding one collection round into a breakpoint.
#[derive(Debug, PartialEq, Eq)]
pub enum BreakpointVerdict {
    /// Report upward and remove.
    Satisfied(String),
    /// Not done yet; re-partition across the remaining live workers.
    Rearm,
}

/// Principal-side view of one breakpoint. Progress accumulates across
/// collection rounds, since collecting a slice consumes it.
pub struct Breakpoint {
    pub id: BreakpointId,
    spec: BreakpointSpec,
    progress: u64,
    matched: Option<String>,
}

impl Breakpoint {
    pub fn new(id: BreakpointId, spec: BreakpointSpec) -> Self {
        Breakpoint {
            id,
            spec,
            progress: 0,
            matched: None,
        }
    }

    /// Slices the remaining work across the given live workers. Count
    /// targets split evenly with the remainder on the first worker;
    /// conditional watches go to everyone unchanged.
    pub fn partition(&self, workers: &[GrainId]) -> Vec<(GrainId, LocalBreakpoint)> {
        if workers.is_empty() {
            return Vec::new();
        }
        match &self.spec {
            BreakpointSpec::Count { target } => {
                let remaining = target.saturating_sub(self.progress).max(1);
                let share = remaining / workers.len() as u64;
                let extra = remaining % workers.len() as u64;
                workers
                    .iter()
                    .enumerate()
                    .map(|(i, grain)| {
                        let slice = share + if i == 0 { extra } else { 0 };
                        (*grain, LocalBreakpoint::count(self.id, slice.max(1)))
                    })
                    .collect()
            }
            BreakpointSpec::Conditional { field, keyword } => workers
                .iter()
                .map(|grain| (*grain, LocalBreakpoint::conditional(self.id, *field, keyword.clone())))
                .collect(),
        }
    }

    /// Folds one round of collected slices in and decides what happens to
    /// the breakpoint next.
    pub fn absorb(&mut self, reports: &[LocalReport]) -> BreakpointVerdict {
        for report in reports {
            debug!("{} collected from {}: progress {}", self.id, report.grain, report.progress);
            self.progress += report.progress;
            if report.detail.is_some() {
                self.matched = report.detail.clone();
            }
        }
        match &self.spec {
            BreakpointSpec::Count { target } => {
                if self.progress >= *target {
                    BreakpointVerdict::Satisfied(format!(
                        "{}: processed {} tuples (target {target})",
                        self.id, self.progress
                    ))
                } else {
                    BreakpointVerdict::Rearm
                }
            }
            BreakpointSpec::Conditional { field, keyword } => {
                if let Some(line) = &self.matched {
                    BreakpointVerdict::Satisfied(format!(
                        "{}: field {field} matched \"{keyword}\" in tuple [{line}] after {} hits",
                        self.id, self.progress
                    ))
                } else {
                    BreakpointVerdict::Rearm
                }
            }
        }
    }
}
