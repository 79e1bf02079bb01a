use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use storypulse_core::types::{
    mention_expires_at, MentionEvent, MentionState, NewNotification, SocialMention,
    UnknownVariant, MAX_MENTION_CHECKS,
};

use crate::notifications::{insert_notification, NotificationStoreError};
use crate::{sqlite_code, to_rfc3339, SQLITE_CONSTRAINT_FOREIGNKEY};

const MENTION_COLUMNS: &str = "id, organization_id, instagram_story_id, instagram_user_id, \
     instagram_username, mention_type, content, raw_data, story_verifiable, mentioned_at, expires_at, state, \
     checks_count, last_check_at, reported_deleted_at, matched_ambassador_id, created_at";

/// Persistence boundary for story mentions.
///
/// Writes are guarded in SQL, so concurrent webhook deliveries and overlapping evaluator runs
/// rely on SQLite's atomicity rather than any in-process lock.
#[derive(Clone)]
pub struct MentionRepository {
    pool: SqlitePool,
}

impl MentionRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts the mention unless `(organization_id, external_id)` already exists.
    ///
    /// Returns the stored row and whether this call created it.
    pub async fn insert_if_absent(
        &self,
        organization_id: &str,
        event: &MentionEvent,
        received_at: DateTime<Utc>,
    ) -> Result<(SocialMention, bool), MentionStoreError> {
        let id = Uuid::new_v4().to_string();
        let raw_data = serde_json::to_string(&event.raw).map_err(MentionStoreError::Encode)?;
        let now = to_rfc3339(received_at);

        let result = sqlx::query(
            "INSERT INTO social_mentions \
             (id, organization_id, instagram_story_id, instagram_user_id, instagram_username, \
              mention_type, content, raw_data, story_verifiable, mentioned_at, expires_at, state, \
              checks_count, matched_ambassador_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'new', 0, \
              (SELECT a.id FROM ambassadors AS a \
                WHERE a.organization_id = ? \
                  AND (a.instagram_user_id = ? \
                       OR (? IS NOT NULL AND a.instagram_username = ? COLLATE NOCASE)) \
                ORDER BY CASE WHEN a.instagram_user_id = ? THEN 0 ELSE 1 END \
                LIMIT 1), \
              ?, ?) \
             ON CONFLICT (organization_id, instagram_story_id) DO NOTHING",
        )
        .bind(&id)
        .bind(organization_id)
        .bind(&event.external_id)
        .bind(&event.sender_id)
        .bind(&event.sender_username)
        .bind(event.mention_type.as_str())
        .bind(&event.content)
        .bind(&raw_data)
        .bind(event.story_verifiable)
        .bind(to_rfc3339(event.mentioned_at))
        .bind(to_rfc3339(mention_expires_at(event.mentioned_at)))
        .bind(organization_id)
        .bind(&event.sender_id)
        .bind(&event.sender_username)
        .bind(&event.sender_username)
        .bind(&event.sender_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        let created = match result {
            Ok(done) => done.rows_affected() == 1,
            Err(err) => {
                if sqlite_code(&err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY) {
                    return Err(MentionStoreError::MissingOrganization);
                }
                return Err(MentionStoreError::Database(err));
            }
        };

        let mention = self
            .fetch_by_story(organization_id, &event.external_id)
            .await?
            .ok_or(MentionStoreError::NotFound)?;
        Ok((mention, created))
    }

    /// Moves a mention from `from` to `to` only if it is still in `from`.
    ///
    /// Returns `false` when another writer got there first, or when recording one more check
    /// would leave a pending mention at the check budget; callers treat both as a no-op.
    pub async fn conditional_transition(
        &self,
        id: &str,
        from: MentionState,
        to: MentionState,
        increment_checks: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<bool, MentionStoreError> {
        if !from.can_transition_to(to) {
            return Err(MentionStoreError::InvalidTransition { from, to });
        }
        let updated = update_state(
            &self.pool,
            StateUpdate {
                id,
                from,
                observed_checks: None,
                to,
                increment_checks,
                checked_at,
            },
        )
        .await?;
        Ok(updated)
    }

    /// Applies a transition decided from the `mention` snapshot together with its notification.
    ///
    /// The update only lands while the row still has the snapshot's state and `checks_count`.
    /// Both writes share one transaction: a failed notification insert leaves the mention
    /// untouched so the next evaluator run decides again.
    pub async fn transition_with_notification(
        &self,
        mention: &SocialMention,
        to: MentionState,
        increment_checks: bool,
        checked_at: DateTime<Utc>,
        notification: Option<&NewNotification>,
    ) -> Result<TransitionOutcome, MentionStoreError> {
        let from = mention.state;
        if !from.can_transition_to(to) {
            return Err(MentionStoreError::InvalidTransition { from, to });
        }

        let mut tx = self.pool.begin().await?;
        let updated = update_state(
            &mut *tx,
            StateUpdate {
                id: &mention.id,
                from,
                observed_checks: Some(mention.checks_count),
                to,
                increment_checks,
                checked_at,
            },
        )
        .await?;
        if !updated {
            tx.rollback().await?;
            return Ok(TransitionOutcome::default());
        }

        let notified = match notification {
            Some(notification) => insert_notification(&mut *tx, notification, checked_at).await?,
            None => false,
        };
        tx.commit().await?;

        Ok(TransitionOutcome {
            updated: true,
            notified,
        })
    }

    /// Lists mentions still in `new`, oldest expiry first, optionally scoped to one organization.
    pub async fn list_pending(
        &self,
        organization_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SocialMention>, MentionStoreError> {
        let sql = format!(
            "SELECT {MENTION_COLUMNS} FROM social_mentions \
             WHERE state = 'new' AND (? IS NULL OR organization_id = ?) \
             ORDER BY expires_at ASC, id ASC \
             LIMIT ?"
        );
        let rows = sqlx::query_as::<_, MentionRow>(&sql)
            .bind(organization_id)
            .bind(organization_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SocialMention::try_from).collect()
    }

    pub async fn fetch(&self, id: &str) -> Result<Option<SocialMention>, MentionStoreError> {
        let sql = format!("SELECT {MENTION_COLUMNS} FROM social_mentions WHERE id = ?");
        let row = sqlx::query_as::<_, MentionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SocialMention::try_from).transpose()
    }

    pub async fn fetch_by_story(
        &self,
        organization_id: &str,
        story_id: &str,
    ) -> Result<Option<SocialMention>, MentionStoreError> {
        let sql = format!(
            "SELECT {MENTION_COLUMNS} FROM social_mentions \
             WHERE organization_id = ? AND instagram_story_id = ?"
        );
        let row = sqlx::query_as::<_, MentionRow>(&sql)
            .bind(organization_id)
            .bind(story_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SocialMention::try_from).transpose()
    }

    /// Records the manual early-delete signal. The first report wins; repeats keep its timestamp.
    ///
    /// Returns `None` when the mention does not belong to `organization_id`.
    pub async fn record_early_delete_report(
        &self,
        organization_id: &str,
        id: &str,
        reported_at: DateTime<Utc>,
    ) -> Result<Option<SocialMention>, MentionStoreError> {
        let reported_at = to_rfc3339(reported_at);
        let done = sqlx::query(
            "UPDATE social_mentions \
             SET reported_deleted_at = COALESCE(reported_deleted_at, ?), updated_at = ? \
             WHERE id = ? AND organization_id = ?",
        )
        .bind(&reported_at)
        .bind(&reported_at)
        .bind(id)
        .bind(organization_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch(id).await
    }
}

/// Result of [`MentionRepository::transition_with_notification`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub updated: bool,
    /// A new notification row was written; a dedup hit reports `false`.
    pub notified: bool,
}

struct StateUpdate<'a> {
    id: &'a str,
    from: MentionState,
    observed_checks: Option<u32>,
    to: MentionState,
    increment_checks: bool,
    checked_at: DateTime<Utc>,
}

async fn update_state<'e, E>(executor: E, update: StateUpdate<'_>) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let checked_at = to_rfc3339(update.checked_at);
    let increment = i64::from(update.increment_checks);
    let observed = update.observed_checks.map(i64::from);
    let done = sqlx::query(
        "UPDATE social_mentions \
         SET state = ?, \
             checks_count = MIN(checks_count + ?, ?), \
             last_check_at = ?, \
             updated_at = ? \
         WHERE id = ? AND state = ? \
           AND (? IS NULL OR checks_count = ?) \
           AND (? <> 'new' OR checks_count + ? < ?)",
    )
    .bind(update.to.as_str())
    .bind(increment)
    .bind(i64::from(MAX_MENTION_CHECKS))
    .bind(&checked_at)
    .bind(&checked_at)
    .bind(update.id)
    .bind(update.from.as_str())
    .bind(observed)
    .bind(observed)
    .bind(update.to.as_str())
    .bind(increment)
    .bind(i64::from(MAX_MENTION_CHECKS))
    .execute(executor)
    .await?;
    Ok(done.rows_affected() == 1)
}

#[derive(Debug, sqlx::FromRow)]
struct MentionRow {
    id: String,
    organization_id: String,
    instagram_story_id: String,
    instagram_user_id: String,
    instagram_username: Option<String>,
    mention_type: String,
    content: Option<String>,
    raw_data: String,
    story_verifiable: bool,
    mentioned_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: String,
    checks_count: i64,
    last_check_at: Option<DateTime<Utc>>,
    reported_deleted_at: Option<DateTime<Utc>>,
    matched_ambassador_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MentionRow> for SocialMention {
    type Error = MentionStoreError;

    fn try_from(row: MentionRow) -> Result<Self, Self::Error> {
        Ok(SocialMention {
            id: row.id,
            organization_id: row.organization_id,
            instagram_story_id: row.instagram_story_id,
            instagram_user_id: row.instagram_user_id,
            instagram_username: row.instagram_username,
            mention_type: row.mention_type.parse()?,
            content: row.content,
            raw_data: row.raw_data,
            story_verifiable: row.story_verifiable,
            mentioned_at: row.mentioned_at,
            expires_at: row.expires_at,
            state: row.state.parse()?,
            checks_count: u32::try_from(row.checks_count).unwrap_or_default(),
            last_check_at: row.last_check_at,
            reported_deleted_at: row.reported_deleted_at,
            matched_ambassador_id: row.matched_ambassador_id,
            created_at: row.created_at,
        })
    }
}

/// Errors raised by the Mention Store.
#[derive(Debug, Error)]
pub enum MentionStoreError {
    #[error("organization does not exist")]
    MissingOrganization,
    #[error("mention row vanished after insert")]
    NotFound,
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: MentionState, to: MentionState },
    #[error("stored mention is corrupt: {0}")]
    Corrupt(#[from] UnknownVariant),
    #[error("failed to encode raw payload: {0}")]
    Encode(serde_json::Error),
    #[error("notification write failed: {0}")]
    Notification(#[from] NotificationStoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_ambassador, setup_db};
    use crate::Database;
    use chrono::Duration;
    use serde_json::json;
    use storypulse_core::notify::for_mention_transition;
    use storypulse_core::types::MentionType;

    fn event(story_id: &str, mentioned_at: DateTime<Utc>) -> MentionEvent {
        MentionEvent {
            external_id: story_id.to_string(),
            sender_id: "ig-user-1".to_string(),
            sender_username: Some("Promoter".to_string()),
            mention_type: MentionType::StoryReferral,
            content: Some("see you there".to_string()),
            mentioned_at,
            story_verifiable: true,
            raw: json!({"sender": {"id": "ig-user-1"}}),
        }
    }

    #[tokio::test]
    async fn insert_if_absent_is_idempotent() {
        let db = setup_db().await;
        let repo = db.mentions();
        let mentioned_at = Utc::now() - Duration::hours(1);

        let (first, created) = repo
            .insert_if_absent("org-1", &event("story-1", mentioned_at), Utc::now())
            .await
            .expect("insert");
        assert!(created);
        assert_eq!(first.state, MentionState::New);
        assert_eq!(first.checks_count, 0);
        assert_eq!(first.expires_at - first.mentioned_at, Duration::hours(24));

        let (second, created) = repo
            .insert_if_absent("org-1", &event("story-1", mentioned_at), Utc::now())
            .await
            .expect("duplicate insert");
        assert!(!created);
        assert_eq!(second.id, first.id);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM social_mentions")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn insert_errors_when_organization_missing() {
        let db = setup_db().await;
        let err = db
            .mentions()
            .insert_if_absent("missing", &event("story-1", Utc::now()), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, MentionStoreError::MissingOrganization));
    }

    #[tokio::test]
    async fn insert_matches_ambassador_by_user_then_username() {
        let db = setup_db().await;
        seed_ambassador(&db, "amb-name", None, Some("promoter")).await;

        let (by_name, _) = db
            .mentions()
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");
        assert_eq!(by_name.matched_ambassador_id.as_deref(), Some("amb-name"));

        seed_ambassador(&db, "amb-id", Some("ig-user-1"), None).await;
        let (by_id, _) = db
            .mentions()
            .insert_if_absent("org-1", &event("story-2", Utc::now()), Utc::now())
            .await
            .expect("insert");
        assert_eq!(by_id.matched_ambassador_id.as_deref(), Some("amb-id"));

        let mut unknown = event("story-3", Utc::now());
        unknown.sender_id = "stranger".to_string();
        unknown.sender_username = None;
        let (lead, _) = db
            .mentions()
            .insert_if_absent("org-1", &unknown, Utc::now())
            .await
            .expect("insert");
        assert!(lead.matched_ambassador_id.is_none());
    }

    #[tokio::test]
    async fn conditional_transition_respects_current_state() {
        let db = setup_db().await;
        let repo = db.mentions();
        let (mention, _) = repo
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");

        let updated = repo
            .conditional_transition(
                &mention.id,
                MentionState::New,
                MentionState::Completed,
                false,
                Utc::now(),
            )
            .await
            .expect("transition");
        assert!(updated);

        let again = repo
            .conditional_transition(
                &mention.id,
                MentionState::New,
                MentionState::ExpiredUnknown,
                true,
                Utc::now(),
            )
            .await
            .expect("second transition");
        assert!(!again);

        let stored = repo.fetch(&mention.id).await.expect("fetch").expect("row");
        assert_eq!(stored.state, MentionState::Completed);
        assert_eq!(stored.checks_count, 0);
    }

    #[tokio::test]
    async fn terminal_transitions_are_rejected_before_touching_storage() {
        let db = setup_db().await;
        let err = db
            .mentions()
            .conditional_transition(
                "any",
                MentionState::Completed,
                MentionState::New,
                false,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MentionStoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn schema_refuses_to_rewrite_expiry_or_terminal_state() {
        let db = setup_db().await;
        let repo = db.mentions();
        let (mention, _) = repo
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");

        let expiry = sqlx::query("UPDATE social_mentions SET expires_at = '2030-01-01T00:00:00.000Z' WHERE id = ?")
            .bind(&mention.id)
            .execute(db.pool())
            .await;
        assert!(expiry.is_err());

        repo.conditional_transition(
            &mention.id,
            MentionState::New,
            MentionState::FlaggedEarlyDelete,
            false,
            Utc::now(),
        )
        .await
        .expect("transition");

        let reopen = sqlx::query("UPDATE social_mentions SET state = 'new' WHERE id = ?")
            .bind(&mention.id)
            .execute(db.pool())
            .await;
        assert!(reopen.is_err());
    }

    #[tokio::test]
    async fn list_pending_is_scoped_and_ordered() {
        let db = setup_db().await;
        crate::test_support::seed_organization(&db, "org-2", "owner-2", None).await;
        let repo = db.mentions();
        let now = Utc::now();
        repo.insert_if_absent("org-1", &event("late", now - Duration::hours(1)), now)
            .await
            .expect("insert");
        repo.insert_if_absent("org-1", &event("early", now - Duration::hours(5)), now)
            .await
            .expect("insert");
        repo.insert_if_absent("org-2", &event("other", now), now)
            .await
            .expect("insert");

        let scoped = repo.list_pending(Some("org-1"), 10).await.expect("list");
        let ids: Vec<_> = scoped.iter().map(|m| m.instagram_story_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);

        let all = repo.list_pending(None, 10).await.expect("list all");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn early_delete_report_is_scoped_to_organization() {
        let db = setup_db().await;
        let repo = db.mentions();
        let (mention, _) = repo
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");

        let foreign = repo
            .record_early_delete_report("org-2", &mention.id, Utc::now())
            .await
            .expect("report");
        assert!(foreign.is_none());

        let first_at = Utc::now();
        let reported = repo
            .record_early_delete_report("org-1", &mention.id, first_at)
            .await
            .expect("report")
            .expect("row");
        assert!(reported.is_reported_deleted());

        let repeat = repo
            .record_early_delete_report("org-1", &mention.id, first_at + Duration::hours(1))
            .await
            .expect("report")
            .expect("row");
        assert_eq!(repeat.reported_deleted_at, reported.reported_deleted_at);
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_create_one_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("dup.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        crate::test_support::seed_organization(&db, "org-1", "owner-1", None).await;

        let mentioned_at = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = db.mentions();
            let event = event("story-race", mentioned_at);
            handles.push(tokio::spawn(async move {
                repo.insert_if_absent("org-1", &event, Utc::now()).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            let (_, was_created) = handle.await.expect("join").expect("insert");
            if was_created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn overlapping_transitions_apply_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("race.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        crate::test_support::seed_organization(&db, "org-1", "owner-1", None).await;

        let (mention, _) = db
            .mentions()
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");

        let mut handles = Vec::new();
        for target in [
            MentionState::Completed,
            MentionState::ExpiredUnknown,
            MentionState::FlaggedEarlyDelete,
            MentionState::Completed,
        ] {
            let repo = db.mentions();
            let id = mention.id.clone();
            handles.push(tokio::spawn(async move {
                repo.conditional_transition(&id, MentionState::New, target, false, Utc::now())
                    .await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.expect("join").expect("transition") {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    async fn notification_count(db: &Database) -> i64 {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications")
            .fetch_one(db.pool())
            .await
            .expect("count");
        count.0
    }

    #[tokio::test]
    async fn failed_notification_rolls_back_the_transition() {
        let db = setup_db().await;
        let repo = db.mentions();
        let (mention, _) = repo
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");
        let notification = for_mention_transition(&mention, MentionState::ExpiredUnknown)
            .expect("expired_unknown notifies");

        sqlx::query(
            "CREATE TRIGGER reject_notifications BEFORE INSERT ON notifications \
             BEGIN SELECT RAISE(ABORT, 'notifications unavailable'); END",
        )
        .execute(db.pool())
        .await
        .expect("trigger");

        let err = repo
            .transition_with_notification(
                &mention,
                MentionState::ExpiredUnknown,
                true,
                Utc::now(),
                Some(&notification),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MentionStoreError::Notification(_)));

        let stored = repo.fetch(&mention.id).await.expect("fetch").expect("row");
        assert_eq!(stored.state, MentionState::New);
        assert_eq!(stored.checks_count, 0);
        assert!(stored.last_check_at.is_none());
        assert_eq!(notification_count(&db).await, 0);

        sqlx::query("DROP TRIGGER reject_notifications")
            .execute(db.pool())
            .await
            .expect("drop trigger");

        let outcome = repo
            .transition_with_notification(
                &stored,
                MentionState::ExpiredUnknown,
                true,
                Utc::now(),
                Some(&notification),
            )
            .await
            .expect("retry");
        assert_eq!(
            outcome,
            TransitionOutcome {
                updated: true,
                notified: true
            }
        );
        let stored = repo.fetch(&mention.id).await.expect("fetch").expect("row");
        assert_eq!(stored.state, MentionState::ExpiredUnknown);
        assert_eq!(notification_count(&db).await, 1);
    }

    #[tokio::test]
    async fn stale_snapshot_is_a_no_op() {
        let db = setup_db().await;
        let repo = db.mentions();
        let (snapshot, _) = repo
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");

        let first = repo
            .transition_with_notification(&snapshot, MentionState::New, true, Utc::now(), None)
            .await
            .expect("first check");
        assert!(first.updated);

        let stale = repo
            .transition_with_notification(&snapshot, MentionState::New, true, Utc::now(), None)
            .await
            .expect("stale check");
        assert_eq!(stale, TransitionOutcome::default());

        let stored = repo.fetch(&snapshot.id).await.expect("fetch").expect("row");
        assert_eq!(stored.checks_count, 1);
    }

    #[tokio::test]
    async fn check_budget_is_never_exceeded_by_a_pending_write() {
        let db = setup_db().await;
        let repo = db.mentions();
        let (mention, _) = repo
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");
        for _ in 0..2 {
            assert!(repo
                .conditional_transition(&mention.id, MentionState::New, MentionState::New, true, Utc::now())
                .await
                .expect("check"));
        }

        let over_budget = repo
            .conditional_transition(&mention.id, MentionState::New, MentionState::New, true, Utc::now())
            .await
            .expect("no constraint error");
        assert!(!over_budget);

        let stored = repo.fetch(&mention.id).await.expect("fetch").expect("row");
        assert_eq!(stored.state, MentionState::New);
        assert_eq!(stored.checks_count, 2);
    }

    #[tokio::test]
    async fn overlapping_verifications_record_one_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("checks.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        crate::test_support::seed_organization(&db, "org-1", "owner-1", None).await;

        let (mention, _) = db
            .mentions()
            .insert_if_absent("org-1", &event("story-1", Utc::now()), Utc::now())
            .await
            .expect("insert");
        assert!(db
            .mentions()
            .conditional_transition(&mention.id, MentionState::New, MentionState::New, true, Utc::now())
            .await
            .expect("first check"));
        let snapshot = db.mentions().fetch(&mention.id).await.expect("fetch").expect("row");
        assert_eq!(snapshot.checks_count, 1);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let repo = db.mentions();
            let snapshot = snapshot.clone();
            handles.push(tokio::spawn(async move {
                repo.transition_with_notification(&snapshot, MentionState::New, true, Utc::now(), None)
                    .await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.expect("join").expect("transition").updated {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let stored = db.mentions().fetch(&mention.id).await.expect("fetch").expect("row");
        assert_eq!(stored.state, MentionState::New);
        assert_eq!(stored.checks_count, 2);
    }
}
