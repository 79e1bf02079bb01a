//! Decision logic for the story-mention state machine.
//!
//! The evaluator worker owns all I/O; this module only decides what a pending mention
//! should become given the clock, the manual early-delete flag and, once the story window
//! has closed, the outcome of a verification probe.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::retry::RetryPolicy;
use crate::types::{MentionState, SocialMention, UnknownVariant};

/// How expired mentions are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationMode {
    /// Probe the provider for the story object before completing.
    #[default]
    GraphProbe,
    /// Treat the 24h boundary itself as proof of natural expiry.
    TrustExpiry,
}

impl VerificationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GraphProbe => "graph",
            Self::TrustExpiry => "trust_expiry",
        }
    }
}

impl FromStr for VerificationMode {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "graph" => Ok(Self::GraphProbe),
            "trust_expiry" => Ok(Self::TrustExpiry),
            other => Err(UnknownVariant::new("verification_mode", other)),
        }
    }
}

/// Next step for a mention in `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The author reported the story as deleted early.
    FlagEarlyDelete,
    /// Story window still open; record the check and leave the mention pending.
    Observe,
    /// Expired, but the previous verification failed too recently to retry.
    Defer,
    /// Expired; probe the provider and pass the outcome to [`resolve_verification`].
    Verify,
    /// Expired and accepted without a probe.
    Complete,
    /// Verification budget already spent.
    ExpireUnknown,
}

/// Outcome of one verification probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The provider no longer serves the story.
    Gone,
    /// The story object still resolves past its window.
    StillLive,
    /// The probe could not run or returned an unusable answer.
    Unavailable,
}

impl VerificationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gone => "gone",
            Self::StillLive => "still_live",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Storage-level write derived from a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: MentionState,
    pub to: MentionState,
    pub increment_checks: bool,
}

impl Transition {
    fn from_new(to: MentionState, increment_checks: bool) -> Self {
        Self {
            from: MentionState::New,
            to,
            increment_checks,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

/// Decides what to do with a pending mention. Terminal mentions return `None`.
pub fn plan(
    mention: &SocialMention,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
    mode: VerificationMode,
) -> Option<Decision> {
    if mention.state.is_terminal() {
        return None;
    }
    if mention.is_reported_deleted() {
        return Some(Decision::FlagEarlyDelete);
    }
    if policy.is_exhausted(mention.checks_count) {
        return Some(Decision::ExpireUnknown);
    }
    if !mention.is_expired(now) {
        return Some(Decision::Observe);
    }
    // Without a resolvable story object a probe can only ever report "still live".
    if mode == VerificationMode::TrustExpiry || !mention.story_verifiable {
        return Some(Decision::Complete);
    }
    if mention.checks_count > 0
        && !policy.is_due(mention.last_check_at, mention.checks_count, now)
    {
        return Some(Decision::Defer);
    }
    Some(Decision::Verify)
}

/// Maps a decision that needs no probe to its transition.
pub fn transition_for(decision: Decision) -> Option<Transition> {
    match decision {
        Decision::FlagEarlyDelete => Some(Transition::from_new(
            MentionState::FlaggedEarlyDelete,
            false,
        )),
        Decision::Observe => Some(Transition::from_new(MentionState::New, false)),
        Decision::Complete => Some(Transition::from_new(MentionState::Completed, false)),
        Decision::ExpireUnknown => {
            Some(Transition::from_new(MentionState::ExpiredUnknown, false))
        }
        Decision::Defer | Decision::Verify => None,
    }
}

/// Resolves a verification attempt against the retry budget.
///
/// A failed attempt consumes one check; the attempt that reaches the budget forces
/// `expired_unknown` so that a capped mention never stays pending.
pub fn resolve_verification(
    mention: &SocialMention,
    outcome: VerificationOutcome,
    policy: &RetryPolicy,
) -> Transition {
    match outcome {
        VerificationOutcome::Gone => Transition::from_new(MentionState::Completed, true),
        VerificationOutcome::StillLive | VerificationOutcome::Unavailable => {
            let attempts = mention.checks_count.saturating_add(1);
            if policy.is_exhausted(attempts) {
                Transition::from_new(MentionState::ExpiredUnknown, true)
            } else {
                Transition::from_new(MentionState::New, true)
            }
        }
    }
}
