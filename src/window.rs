use chrono::NaiveTime;

use crate::clock::format_hhmm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    TooEarly,
    Open,
    Closed,
}

/// One of today's periods for the class/section being marked.
#[derive(Debug, Clone)]
pub struct WindowCandidate {
    pub assignment_id: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct WindowDecision {
    pub state: WindowState,
    pub target: WindowCandidate,
}

impl WindowDecision {
    pub fn window_label(&self) -> String {
        format!(
            "{}-{}",
            format_hhmm(self.target.start),
            format_hhmm(self.target.end)
        )
    }
}

/// Pick the authoritative period for "now" and decide whether marking is
/// permitted. A teacher can have several periods for the same class/section
/// on one day; the earliest one whose end has not yet passed wins. When all
/// have passed we still report against the first chronologically, so the
/// rejection names a concrete window.
///
/// Both boundaries are inclusive: marking at exactly start or end is Open.
/// Returns None when the candidate list is empty (caller decides what "not
/// assigned today" means).
pub fn resolve_window(now: NaiveTime, candidates: &[WindowCandidate]) -> Option<WindowDecision> {
    if candidates.is_empty() {
        return None;
    }
    let mut sorted: Vec<&WindowCandidate> = candidates.iter().collect();
    sorted.sort_by_key(|c| (c.start, c.end));

    let target = sorted
        .iter()
        .find(|c| now <= c.end)
        .copied()
        .unwrap_or(sorted[0]);

    let state = if now < target.start {
        WindowState::TooEarly
    } else if now > target.end {
        WindowState::Closed
    } else {
        WindowState::Open
    };

    Some(WindowDecision {
        state,
        target: target.clone(),
    })
}
