//! Consolidated status message posted at the end of a run.

use std::fmt::Write as _;

use crate::work_item::{AgentContext, AgentStatus};

/// Render the run summary posted to issues, reviews and tickets.
pub fn status_message(ctx: &AgentContext) -> String {
    let mut out = String::new();
    let headline = match ctx.status {
        AgentStatus::Succeeded => "deployed to production",
        AgentStatus::NeedsReview => "needs review",
        AgentStatus::Failed => "failed",
        AgentStatus::Pending | AgentStatus::Running => "in progress",
    };
    let _ = writeln!(
        out,
        "Dockhand run {} for {}: {}",
        ctx.run_id, ctx.work_item.reference, headline
    );

    if let Some(review) = &ctx.artifacts.review {
        let _ = writeln!(out, "- review: {}!{}", review.repo, review.number);
    }
    if let Some(artifact) = &ctx.artifacts.published {
        let _ = writeln!(out, "- image: {} ({})", artifact.image, artifact.digest);
    }
    for (environment, deployment) in &ctx.artifacts.deployments {
        let _ = writeln!(out, "- {}: {}", environment, deployment.status);
    }
    if let Some(scan) = &ctx.artifacts.scan {
        let _ = writeln!(
            out,
            "- scan: critical={} high={} medium={} low={}",
            scan.critical, scan.high, scan.medium, scan.low
        );
    }
    for note in &ctx.review_notes {
        let _ = writeln!(out, "- note: {note}");
    }
    if let Some(error) = &ctx.error {
        let _ = writeln!(out, "- error: {error}");
    }
    out
}
