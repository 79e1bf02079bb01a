use std::{sync::Arc, time::Duration, time::Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use storypulse_core::lifecycle::{
    self, Decision, Transition, VerificationMode, VerificationOutcome,
};
use storypulse_core::notify;
use storypulse_core::retry::RetryPolicy;
use storypulse_core::types::SocialMention;
use storypulse_instagram::{GraphClient, StoryStatus};
use storypulse_storage::{Database, MentionStoreError};

use crate::notifications::Notifier;
use crate::router::Clock;
use crate::tokens::TokenManager;

const BATCH_LIMIT: u32 = 500;

/// Background worker driving pending mentions toward a terminal state.
#[derive(Clone)]
pub struct LifecycleEvaluator {
    storage: Database,
    graph: GraphClient,
    tokens: TokenManager,
    notifier: Notifier,
    policy: RetryPolicy,
    mode: VerificationMode,
    clock: Clock,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    pub processed: u64,
    pub notifications_sent: u64,
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error(transparent)]
    Store(#[from] MentionStoreError),
}

impl LifecycleEvaluator {
    pub fn new(
        storage: Database,
        graph: GraphClient,
        tokens: TokenManager,
        notifier: Notifier,
        policy: RetryPolicy,
        mode: VerificationMode,
    ) -> Self {
        Self {
            storage,
            graph,
            tokens,
            notifier,
            policy,
            mode,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.tokens = self.tokens.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn with_mode(mut self, mode: VerificationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(every).await;
        })
    }

    async fn run_loop(self, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once(None).await {
                error!(stage = "evaluator", error = %err, "evaluator run failed");
            }
        }
    }

    /// Evaluates every pending mention, optionally scoped to one organization.
    ///
    /// A failure on one mention is logged and does not stop the pass.
    pub async fn run_once(
        &self,
        organization_id: Option<&str>,
    ) -> Result<EvaluationReport, EvaluatorError> {
        let start = Instant::now();
        let now = (self.clock)();
        let pending = self
            .storage
            .mentions()
            .list_pending(organization_id, BATCH_LIMIT)
            .await?;

        let mut report = EvaluationReport::default();
        for mention in &pending {
            match self.evaluate(mention, now).await {
                Ok(notified) => {
                    report.processed += 1;
                    if notified {
                        report.notifications_sent += 1;
                    }
                }
                Err(err) => {
                    error!(
                        stage = "evaluator",
                        mention_id = %mention.id,
                        organization_id = %mention.organization_id,
                        error = %err,
                        "mention evaluation failed"
                    );
                }
            }
        }

        histogram!("evaluator_run_seconds").record(start.elapsed().as_secs_f64());
        info!(
            stage = "evaluator",
            scope = organization_id.unwrap_or("all"),
            pending = pending.len(),
            processed = report.processed,
            notifications_sent = report.notifications_sent,
            "evaluator pass completed"
        );
        Ok(report)
    }

    /// Returns whether a notification was emitted.
    async fn evaluate(
        &self,
        mention: &SocialMention,
        now: DateTime<Utc>,
    ) -> Result<bool, EvaluatorError> {
        let Some(decision) = lifecycle::plan(mention, now, &self.policy, self.mode) else {
            return Ok(false);
        };

        let transition = match decision {
            Decision::Defer => {
                debug!(stage = "evaluator", mention_id = %mention.id, "verification backing off");
                return Ok(false);
            }
            Decision::Verify => {
                let outcome = self.verify(mention).await;
                counter!("evaluator_verification_total", "outcome" => outcome.as_str())
                    .increment(1);
                lifecycle::resolve_verification(mention, outcome, &self.policy)
            }
            other => match lifecycle::transition_for(other) {
                Some(transition) => transition,
                None => return Ok(false),
            },
        };

        self.apply(mention, transition, now).await
    }

    /// Writes `transition` decided from the `mention` snapshot. A terminal state commits
    /// together with its notification; if either write fails neither lands.
    ///
    /// A lost race (`updated = false`) is a no-op. Returns whether a notification was stored.
    pub async fn apply(
        &self,
        mention: &SocialMention,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<bool, EvaluatorError> {
        let notification = if transition.is_terminal() {
            notify::for_mention_transition(mention, transition.to)
        } else {
            None
        };
        let outcome = self
            .storage
            .mentions()
            .transition_with_notification(
                mention,
                transition.to,
                transition.increment_checks,
                now,
                notification.as_ref(),
            )
            .await?;
        if !outcome.updated {
            debug!(
                stage = "evaluator",
                mention_id = %mention.id,
                to = transition.to.as_str(),
                "mention already moved by another writer"
            );
            return Ok(false);
        }
        if !transition.is_terminal() {
            return Ok(false);
        }

        counter!("evaluator_transitions_total", "to" => transition.to.as_str()).increment(1);
        info!(
            stage = "evaluator",
            mention_id = %mention.id,
            organization_id = %mention.organization_id,
            to = transition.to.as_str(),
            "mention reached terminal state"
        );

        if let Some(notification) = &notification {
            self.notifier.record(notification, outcome.notified);
        }
        Ok(outcome.notified)
    }

    async fn verify(&self, mention: &SocialMention) -> VerificationOutcome {
        let token = match self.tokens.access_token_for(&mention.organization_id).await {
            Ok(token) => token,
            Err(err) => {
                warn!(
                    stage = "evaluator",
                    mention_id = %mention.id,
                    organization_id = %mention.organization_id,
                    error = %err,
                    "no usable token for verification"
                );
                return VerificationOutcome::Unavailable;
            }
        };

        match self
            .graph
            .story_status(&token, &mention.instagram_story_id)
            .await
        {
            Ok(StoryStatus::Gone) => VerificationOutcome::Gone,
            Ok(StoryStatus::Live) => VerificationOutcome::StillLive,
            Err(err) => {
                warn!(
                    stage = "evaluator",
                    mention_id = %mention.id,
                    error = %err,
                    "story verification failed"
                );
                VerificationOutcome::Unavailable
            }
        }
    }
}
