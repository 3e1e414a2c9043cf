use super::{Rule, RuleContext};
use crate::types::{Category, Finding, PipelineStatus, Severity};

/// Projects the current pipeline state into a finding. Only a successful
/// run against the current head counts as a pass.
pub struct PipelineStatusRule;

impl Rule for PipelineStatusRule {
    fn name(&self) -> &'static str {
        "pipeline-status"
    }

    fn applies_to(&self, cx: &RuleContext<'_>) -> bool {
        cx.snapshot.open()
    }

    fn evaluate(&self, cx: &RuleContext<'_>, _prior: &[Finding]) -> Vec<Finding> {
        let snapshot = cx.snapshot;
        let finding = match &snapshot.pipeline {
            None => Finding::new(
                Severity::Info,
                Category::Pipeline,
                "pipeline",
                "No pipeline has run for this MR yet.",
            ),
            Some(p) => match p.status {
                PipelineStatus::Failed => Finding::new(
                    Severity::Block,
                    Category::Pipeline,
                    "pipeline",
                    format!("Pipeline #{} failed.", p.id),
                ),
                PipelineStatus::Canceled => Finding::new(
                    Severity::Warn,
                    Category::Pipeline,
                    "pipeline",
                    format!("Pipeline #{} was canceled.", p.id),
                ),
                PipelineStatus::Running => Finding::new(
                    Severity::Info,
                    Category::Pipeline,
                    "pipeline",
                    format!("Pipeline #{} is running.", p.id),
                ),
                PipelineStatus::ManualPending => {
                    if snapshot.pending_manual_jobs.is_empty() {
                        // Nothing left that anyone could start.
                        Finding::new(
                            Severity::Pass,
                            Category::Pipeline,
                            "pipeline",
                            format!("Pipeline #{} has no startable manual jobs left.", p.id),
                        )
                    } else {
                        Finding::new(
                            Severity::Info,
                            Category::Pipeline,
                            "pipeline",
                            format!(
                                "Pipeline #{} is waiting for manual jobs: {}.",
                                p.id,
                                snapshot.pending_manual_jobs.join(", ")
                            ),
                        )
                    }
                }
                PipelineStatus::Success => {
                    if p.sha == snapshot.head_sha {
                        Finding::new(
                            Severity::Pass,
                            Category::Pipeline,
                            "pipeline",
                            format!("Pipeline #{} succeeded for the current head.", p.id),
                        )
                    } else {
                        Finding::new(
                            Severity::Info,
                            Category::Pipeline,
                            "pipeline",
                            format!(
                                "Pipeline #{} succeeded, but for {} rather than the current \
                                 head.",
                                p.id, p.sha
                            ),
                        )
                    }
                }
            },
        };
        vec![finding]
    }
}
