//! Phase detection from issue comments.

use drover_tracker::models::IssueComment;

use crate::model::Phase;

/// Marker embedded in the plan comment. An HTML comment, so the tracker UI
/// does not render it.
pub const PLAN_MARKER: &str = "<!-- AGENT_PLAN -->";

/// Decide which phase a task is in: once any comment carries the plan
/// marker, planning is done and the task moves to implementation.
pub fn detect_phase(comments: &[IssueComment]) -> Phase {
    if comments.iter().any(|c| c.comment_html.contains(PLAN_MARKER)) {
        Phase::Implementation
    } else {
        Phase::Planning
    }
}

/// Extract the plan body from the marker comment, if one exists.
pub fn find_plan(comments: &[IssueComment]) -> Option<&str> {
    comments
        .iter()
        .find(|c| c.comment_html.contains(PLAN_MARKER))
        .map(|c| c.comment_html.as_str())
}
