//! Merge-eligibility scoring.
//!
//! Each criterion contributes its full weight or nothing. Blockers are hard
//! failures that veto the merge whatever the score. An ineligible result is
//! a normal value, never an error.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::watch::RunSnapshot;

const DEFAULT_THRESHOLD: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mergeability {
    Mergeable,
    Conflicting,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub name: String,
    pub state: CheckState,
}

/// Pull-request facts as reported by the hosting system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMetadata {
    pub number: u64,
    pub title: String,
    pub state: PrState,
    pub mergeable: Mergeability,
    pub status_checks: Vec<StatusCheck>,
    pub review_decision: Option<ReviewDecision>,
    pub head_ref: String,
    pub base_ref: String,
}

/// Hosting-system boundary for pull-request metadata.
#[async_trait]
pub trait PullRequestSource: Send + Sync {
    async fn pull_request(&self, number: u64) -> Result<Option<PrMetadata>>;

    /// The open pull request whose head is `branch`, if any.
    async fn pull_request_for_branch(&self, branch: &str) -> Result<Option<PrMetadata>>;
}

/// Outcome of looking up the pull request for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestInfo {
    /// The change was pushed without a pull request.
    Missing,
    Found(PrMetadata),
    /// The host could not be asked; the message says why.
    Unavailable(String),
}

impl PullRequestInfo {
    pub fn number(&self) -> Option<u64> {
        match self {
            PullRequestInfo::Found(pr) => Some(pr.number),
            _ => None,
        }
    }
}

/// Satisfied positive criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    CiPassed,
    Mergeable,
    ChecksGreen,
    ReviewsApproved,
    ReviewsNotRequired,
    DirectPush,
}

/// Unmet hard requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Blocker {
    CiNotPassed,
    PrNotOpen,
    MergeConflicts,
    MergeabilityUnknown,
    ChecksFailing,
    ChecksPending,
    ReviewsNotApproved,
    NoPullRequest,
    PrLookupFailed,
}

impl Blocker {
    pub fn as_str(self) -> &'static str {
        match self {
            Blocker::CiNotPassed => "ci_not_passed",
            Blocker::PrNotOpen => "pr_not_open",
            Blocker::MergeConflicts => "merge_conflicts",
            Blocker::MergeabilityUnknown => "mergeability_unknown",
            Blocker::ChecksFailing => "checks_failing",
            Blocker::ChecksPending => "checks_pending",
            Blocker::ReviewsNotApproved => "reviews_not_approved",
            Blocker::NoPullRequest => "no_pull_request",
            Blocker::PrLookupFailed => "pr_lookup_failed",
        }
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EligibilityWeights {
    pub ci_passed: u8,
    pub mergeable: u8,
    pub checks_green: u8,
    pub reviews: u8,
    pub direct_push: u8,
}

impl Default for EligibilityWeights {
    fn default() -> Self {
        Self {
            ci_passed: 40,
            mergeable: 20,
            checks_green: 25,
            reviews: 15,
            direct_push: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityOptions {
    pub threshold: u8,
    pub require_reviews: bool,
    /// Branch on which a push without a pull request is acceptable.
    pub default_branch: String,
    pub weights: EligibilityWeights,
}

impl Default for EligibilityOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            require_reviews: true,
            default_branch: "main".to_string(),
            weights: EligibilityWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityResult {
    pub score: u8,
    pub threshold: u8,
    pub reasons: BTreeSet<Reason>,
    pub blockers: BTreeSet<Blocker>,
    pub eligible: bool,
}

impl EligibilityResult {
    fn decide(score: u32, threshold: u8, reasons: BTreeSet<Reason>, blockers: BTreeSet<Blocker>) -> Self {
        let score = u8::try_from(score.min(100)).unwrap_or(100);
        Self {
            score,
            threshold,
            eligible: score >= threshold && blockers.is_empty(),
            reasons,
            blockers,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EligibilityEvaluator {
    options: EligibilityOptions,
}

/// Accumulates the score, reasons and blockers for one evaluation.
#[derive(Default)]
struct Tally {
    score: u32,
    reasons: BTreeSet<Reason>,
    blockers: BTreeSet<Blocker>,
}

impl Tally {
    fn award(&mut self, weight: u8, reason: Reason) {
        self.score += u32::from(weight);
        self.reasons.insert(reason);
    }

    fn block(&mut self, blocker: Blocker) {
        self.blockers.insert(blocker);
    }
}

impl EligibilityEvaluator {
    pub fn new(options: EligibilityOptions) -> Self {
        Self { options }
    }

    pub fn evaluate(&self, run: &RunSnapshot, pr: &PullRequestInfo) -> EligibilityResult {
        let weights = &self.options.weights;
        let mut tally = Tally::default();

        if run.is_success() {
            tally.award(weights.ci_passed, Reason::CiPassed);
        } else {
            tally.block(Blocker::CiNotPassed);
        }

        match pr {
            PullRequestInfo::Found(pr) => self.score_pull_request(pr, &mut tally),
            PullRequestInfo::Missing => self.score_direct_push(run, &mut tally),
            PullRequestInfo::Unavailable(_) => tally.block(Blocker::PrLookupFailed),
        }

        EligibilityResult::decide(tally.score, self.options.threshold, tally.reasons, tally.blockers)
    }

    fn score_pull_request(&self, pr: &PrMetadata, tally: &mut Tally) {
        let weights = &self.options.weights;

        if pr.state != PrState::Open {
            tally.block(Blocker::PrNotOpen);
        }

        match pr.mergeable {
            Mergeability::Mergeable => tally.award(weights.mergeable, Reason::Mergeable),
            Mergeability::Conflicting => tally.block(Blocker::MergeConflicts),
            Mergeability::Unknown => tally.block(Blocker::MergeabilityUnknown),
        }

        if pr.status_checks.iter().any(|c| c.state == CheckState::Failed) {
            tally.block(Blocker::ChecksFailing);
        } else if pr.status_checks.iter().any(|c| c.state == CheckState::Pending) {
            tally.block(Blocker::ChecksPending);
        } else {
            tally.award(weights.checks_green, Reason::ChecksGreen);
        }

        if self.options.require_reviews {
            if pr.review_decision == Some(ReviewDecision::Approved) {
                tally.award(weights.reviews, Reason::ReviewsApproved);
            } else {
                tally.block(Blocker::ReviewsNotApproved);
            }
        } else {
            tally.award(weights.reviews, Reason::ReviewsNotRequired);
        }
    }

    fn score_direct_push(&self, run: &RunSnapshot, tally: &mut Tally) {
        let weights = &self.options.weights;

        if !self.options.require_reviews {
            tally.award(weights.reviews, Reason::ReviewsNotRequired);
        }

        if run.branch == self.options.default_branch {
            tally.award(weights.direct_push, Reason::DirectPush);
        } else {
            tally.block(Blocker::NoPullRequest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{Conclusion, RunState};

    fn run(branch: &str, conclusion: Conclusion) -> RunSnapshot {
        RunSnapshot::new("42", "CI", branch, RunState::Completed(conclusion))
    }

    fn green_pr() -> PrMetadata {
        PrMetadata {
            number: 7,
            title: "Add widget".to_string(),
            state: PrState::Open,
            mergeable: Mergeability::Mergeable,
            status_checks: vec![
                StatusCheck {
                    name: "build".to_string(),
                    state: CheckState::Passed,
                },
                StatusCheck {
                    name: "lint".to_string(),
                    state: CheckState::Passed,
                },
            ],
            review_decision: Some(ReviewDecision::Approved),
            head_ref: "feature/widget".to_string(),
            base_ref: "main".to_string(),
        }
    }

    #[test]
    fn test_all_criteria_met_scores_full() {
        let evaluator = EligibilityEvaluator::default();
        let result = evaluator.evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(green_pr()),
        );

        assert_eq!(result.score, 100);
        assert!(result.eligible);
        assert!(result.blockers.is_empty());
        assert!(result.reasons.contains(&Reason::ReviewsApproved));
    }

    #[test]
    fn test_ci_failure_blocks_regardless_of_score() {
        let options = EligibilityOptions {
            threshold: 10,
            ..EligibilityOptions::default()
        };
        let result = EligibilityEvaluator::new(options).evaluate(
            &run("feature/widget", Conclusion::Failure),
            &PullRequestInfo::Found(green_pr()),
        );

        assert_eq!(result.score, 60);
        assert!(result.blockers.contains(&Blocker::CiNotPassed));
        assert!(!result.eligible);
    }

    #[test]
    fn test_blocker_dominates_high_score() {
        let weights = EligibilityWeights {
            mergeable: 35,
            checks_green: 35,
            reviews: 25,
            ..EligibilityWeights::default()
        };
        let options = EligibilityOptions {
            weights,
            ..EligibilityOptions::default()
        };
        let result = EligibilityEvaluator::new(options).evaluate(
            &run("feature/widget", Conclusion::Failure),
            &PullRequestInfo::Found(green_pr()),
        );

        assert_eq!(result.score, 95);
        assert!(!result.eligible);
    }

    #[test]
    fn test_direct_push_alone_is_below_threshold() {
        let result = EligibilityEvaluator::default()
            .evaluate(&run("main", Conclusion::Success), &PullRequestInfo::Missing);

        assert_eq!(result.score, 50);
        assert!(result.blockers.is_empty());
        assert!(!result.eligible);
        assert!(result.reasons.contains(&Reason::DirectPush));
    }

    #[test]
    fn test_direct_push_without_review_requirement() {
        let options = EligibilityOptions {
            require_reviews: false,
            ..EligibilityOptions::default()
        };
        let result = EligibilityEvaluator::new(options)
            .evaluate(&run("main", Conclusion::Success), &PullRequestInfo::Missing);

        assert_eq!(result.score, 65);
        assert!(result.reasons.contains(&Reason::ReviewsNotRequired));
    }

    #[test]
    fn test_push_to_other_branch_without_pr_is_blocked() {
        let result = EligibilityEvaluator::default()
            .evaluate(&run("feature/x", Conclusion::Success), &PullRequestInfo::Missing);

        assert!(result.blockers.contains(&Blocker::NoPullRequest));
        assert!(!result.eligible);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let at_threshold = EligibilityOptions {
            require_reviews: false,
            weights: EligibilityWeights {
                direct_push: 25,
                ..EligibilityWeights::default()
            },
            ..EligibilityOptions::default()
        };
        let result = EligibilityEvaluator::new(at_threshold.clone())
            .evaluate(&run("main", Conclusion::Success), &PullRequestInfo::Missing);
        assert_eq!(result.score, 80);
        assert!(result.eligible);

        let below = EligibilityOptions {
            weights: EligibilityWeights {
                direct_push: 24,
                ..EligibilityWeights::default()
            },
            ..at_threshold
        };
        let result = EligibilityEvaluator::new(below)
            .evaluate(&run("main", Conclusion::Success), &PullRequestInfo::Missing);
        assert_eq!(result.score, 79);
        assert!(!result.eligible);
    }

    #[test]
    fn test_conflicts_block() {
        let mut pr = green_pr();
        pr.mergeable = Mergeability::Conflicting;
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert_eq!(result.score, 80);
        assert!(result.blockers.contains(&Blocker::MergeConflicts));
        assert!(!result.eligible);
    }

    #[test]
    fn test_unknown_mergeability_blocks() {
        let mut pr = green_pr();
        pr.mergeable = Mergeability::Unknown;
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert!(result.blockers.contains(&Blocker::MergeabilityUnknown));
    }

    #[test]
    fn test_failing_check_blocks() {
        let mut pr = green_pr();
        pr.status_checks[1].state = CheckState::Failed;
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert_eq!(result.score, 75);
        assert!(result.blockers.contains(&Blocker::ChecksFailing));
        assert!(!result.reasons.contains(&Reason::ChecksGreen));
    }

    #[test]
    fn test_pending_check_blocks() {
        let mut pr = green_pr();
        pr.status_checks[0].state = CheckState::Pending;
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert!(result.blockers.contains(&Blocker::ChecksPending));
    }

    #[test]
    fn test_no_checks_counts_as_green() {
        let mut pr = green_pr();
        pr.status_checks.clear();
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert!(result.reasons.contains(&Reason::ChecksGreen));
        assert!(result.eligible);
    }

    #[test]
    fn test_missing_approval_blocks_when_reviews_required() {
        let mut pr = green_pr();
        pr.review_decision = Some(ReviewDecision::ReviewRequired);
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert_eq!(result.score, 85);
        assert!(result.blockers.contains(&Blocker::ReviewsNotApproved));
        assert!(!result.eligible);
    }

    #[test]
    fn test_reviews_not_required_awards_weight() {
        let mut pr = green_pr();
        pr.review_decision = None;
        let options = EligibilityOptions {
            require_reviews: false,
            ..EligibilityOptions::default()
        };
        let result = EligibilityEvaluator::new(options).evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert_eq!(result.score, 100);
        assert!(result.reasons.contains(&Reason::ReviewsNotRequired));
        assert!(result.eligible);
    }

    #[test]
    fn test_closed_pr_blocks() {
        let mut pr = green_pr();
        pr.state = PrState::Merged;
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(pr),
        );

        assert!(result.blockers.contains(&Blocker::PrNotOpen));
        assert!(!result.eligible);
    }

    #[test]
    fn test_lookup_failure_blocks() {
        let result = EligibilityEvaluator::default().evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Unavailable("timeout".into()),
        );

        assert_eq!(result.score, 40);
        assert!(result.blockers.contains(&Blocker::PrLookupFailed));
    }

    #[test]
    fn test_score_is_capped_at_100() {
        let options = EligibilityOptions {
            weights: EligibilityWeights {
                ci_passed: 90,
                mergeable: 90,
                ..EligibilityWeights::default()
            },
            ..EligibilityOptions::default()
        };
        let result = EligibilityEvaluator::new(options).evaluate(
            &run("feature/widget", Conclusion::Success),
            &PullRequestInfo::Found(green_pr()),
        );

        assert_eq!(result.score, 100);
    }

    #[test]
    fn test_result_serializes_tags_snake_case() {
        let result = EligibilityEvaluator::default()
            .evaluate(&run("feature/x", Conclusion::Failure), &PullRequestInfo::Missing);
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["eligible"], false);
        let blockers: Vec<&str> = json["blockers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b.as_str().unwrap())
            .collect();
        assert_eq!(blockers, vec!["ci_not_passed", "no_pull_request"]);
    }
}
