use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;

use certwatch_core::{
    parse_interval_days,
    policy::SendHistory,
    types::{
        CertificateDefinition, CertificateIssuance, Company, Course, DateSource, GroupMode,
        NotificationKind, RecipientMode, UserProfile,
    },
    DateFormat,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (and creates when missing) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for certificate definitions.
    pub fn definitions(&self) -> DefinitionRepository {
        DefinitionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for certificate issuances and sweep candidates.
    pub fn issuances(&self) -> IssuanceRepository {
        IssuanceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the notification de-duplication log.
    pub fn notification_log(&self) -> NotificationLogRepository {
        NotificationLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for users, courses, companies and course roles.
    pub fn directory(&self) -> DirectoryRepository {
        DirectoryRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for certificate definitions.
#[derive(Clone)]
pub struct DefinitionRepository {
    pool: SqlitePool,
}

impl DefinitionRepository {
    pub async fn fetch(&self, id: i64) -> Result<Option<CertificateDefinition>, StorageError> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            "SELECT id, course_id, name, expiry_enabled, valid_interval, extend_to_month_end, \
                    reminder_recipients, reminder_lead_days, expiry_recipients, date_source, \
                    date_format, print_code, notify_managers_on_issue, notify_others, group_mode \
               FROM certificate_definitions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DefinitionRow::into_domain))
    }

    /// Inserts or replaces the editable fields of a definition.
    pub async fn upsert(
        &self,
        definition: &CertificateDefinition,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let valid_interval = definition
            .valid_interval_days
            .map(|days| days.to_string())
            .unwrap_or_default();

        sqlx::query(
            "INSERT INTO certificate_definitions \
             (id, course_id, name, expiry_enabled, valid_interval, extend_to_month_end, \
              reminder_recipients, reminder_lead_days, expiry_recipients, date_source, \
              date_format, print_code, notify_managers_on_issue, notify_others, group_mode, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               course_id = excluded.course_id, \
               name = excluded.name, \
               expiry_enabled = excluded.expiry_enabled, \
               valid_interval = excluded.valid_interval, \
               extend_to_month_end = excluded.extend_to_month_end, \
               reminder_recipients = excluded.reminder_recipients, \
               reminder_lead_days = excluded.reminder_lead_days, \
               expiry_recipients = excluded.expiry_recipients, \
               date_source = excluded.date_source, \
               date_format = excluded.date_format, \
               print_code = excluded.print_code, \
               notify_managers_on_issue = excluded.notify_managers_on_issue, \
               notify_others = excluded.notify_others, \
               group_mode = excluded.group_mode, \
               updated_at = excluded.updated_at",
        )
        .bind(definition.id)
        .bind(definition.course_id)
        .bind(&definition.name)
        .bind(definition.expiry_enabled)
        .bind(valid_interval)
        .bind(definition.extend_to_month_end)
        .bind(definition.reminder_recipients.code())
        .bind(definition.reminder_lead_days)
        .bind(definition.expiry_recipients.code())
        .bind(definition.date_source.as_str())
        .bind(i64::from(definition.date_format))
        .bind(definition.print_code)
        .bind(definition.notify_managers_on_issue)
        .bind(&definition.notify_others)
        .bind(definition.group_mode.as_str())
        .bind(to_rfc3339(updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DefinitionRow {
    id: i64,
    course_id: i64,
    name: String,
    expiry_enabled: bool,
    valid_interval: String,
    extend_to_month_end: bool,
    reminder_recipients: i64,
    reminder_lead_days: i64,
    expiry_recipients: i64,
    date_source: String,
    date_format: i64,
    print_code: bool,
    notify_managers_on_issue: bool,
    notify_others: String,
    group_mode: String,
}

impl DefinitionRow {
    fn into_domain(self) -> CertificateDefinition {
        CertificateDefinition {
            id: self.id,
            course_id: self.course_id,
            name: self.name,
            expiry_enabled: self.expiry_enabled,
            valid_interval_days: parse_interval_days(&self.valid_interval),
            extend_to_month_end: self.extend_to_month_end,
            reminder_recipients: RecipientMode::from_code(self.reminder_recipients),
            reminder_lead_days: self.reminder_lead_days,
            expiry_recipients: RecipientMode::from_code(self.expiry_recipients),
            date_source: DateSource::parse(&self.date_source),
            date_format: DateFormat::from(self.date_format),
            print_code: self.print_code,
            notify_managers_on_issue: self.notify_managers_on_issue,
            notify_others: self.notify_others,
            group_mode: GroupMode::parse(&self.group_mode),
        }
    }
}

/// Repository for certificate issuances.
#[derive(Clone)]
pub struct IssuanceRepository {
    pool: SqlitePool,
}

impl IssuanceRepository {
    /// Loads the issuance for a (definition, user) pair.
    pub async fn find(
        &self,
        definition_id: i64,
        user_id: i64,
    ) -> Result<Option<CertificateIssuance>, StorageError> {
        let row = sqlx::query_as::<_, IssuanceRow>(
            "SELECT id, definition_id, user_id, code, issued_at, expires_at \
               FROM certificate_issuances WHERE definition_id = ? AND user_id = ?",
        )
        .bind(definition_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(IssuanceRow::into_domain))
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<CertificateIssuance>, StorageError> {
        let row = sqlx::query_as::<_, IssuanceRow>(
            "SELECT id, definition_id, user_id, code, issued_at, expires_at \
               FROM certificate_issuances WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(IssuanceRow::into_domain))
    }

    pub async fn find_by_code(
        &self,
        code: &str,
    ) -> Result<Option<CertificateIssuance>, StorageError> {
        let row = sqlx::query_as::<_, IssuanceRow>(
            "SELECT id, definition_id, user_id, code, issued_at, expires_at \
               FROM certificate_issuances WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(IssuanceRow::into_domain))
    }

    pub async fn code_exists(&self, code: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM certificate_issuances WHERE code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.get("total");
        Ok(total > 0)
    }

    /// Inserts an issuance unless one already exists for the (definition, user) pair.
    pub async fn insert_if_absent(
        &self,
        record: &NewIssuance<'_>,
    ) -> Result<IssuanceInsertOutcome, StorageError> {
        let result = sqlx::query(
            "INSERT INTO certificate_issuances (definition_id, user_id, code, issued_at, expires_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(definition_id, user_id) DO NOTHING",
        )
        .bind(record.definition_id)
        .bind(record.user_id)
        .bind(record.code)
        .bind(to_rfc3339(record.issued_at))
        .bind(record.expires_at.map(to_rfc3339))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(IssuanceInsertOutcome::Existing),
            Ok(done) => Ok(IssuanceInsertOutcome::Inserted(done.last_insert_rowid())),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("2067") => {
                Ok(IssuanceInsertOutcome::CodeConflict)
            }
            Err(err) => Err(StorageError::Database(err)),
        }
    }

    pub async fn update_expiry(
        &self,
        id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE certificate_issuances SET expires_at = ? WHERE id = ?")
            .bind(expires_at.map(to_rfc3339))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lists issuances whose run threshold has been crossed at `now`.
    ///
    /// Only learners that are active, have completed the course and belong
    /// to a company qualify. The policy re-checks the threshold.
    pub async fn list_candidates(
        &self,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<SweepCandidate>, StorageError> {
        let threshold_filter = match kind {
            NotificationKind::Reminder => {
                "ct.reminder_recipients IN (1, 2, 3) \
                 AND julianday(ci.expires_at) - ct.reminder_lead_days > julianday('1970-01-01') \
                 AND julianday(ci.expires_at) - ct.reminder_lead_days < julianday(?)"
            }
            NotificationKind::Expiry => {
                "ct.expiry_recipients IN (1, 2, 3) \
                 AND julianday(ci.expires_at) > julianday('1970-01-01') \
                 AND julianday(ci.expires_at) < julianday(?)"
            }
        };

        let sql = format!(
            r#"
SELECT ci.id AS issuance_id,
       ci.definition_id,
       ct.course_id,
       ci.user_id,
       MIN(cu.company_id) AS company_id
  FROM certificate_issuances AS ci
  JOIN certificate_definitions AS ct
    ON ct.id = ci.definition_id
   AND ct.expiry_enabled = 1
  JOIN users AS u
    ON u.id = ci.user_id
   AND u.deleted = 0
   AND u.suspended = 0
  JOIN company_users AS cu
    ON cu.user_id = ci.user_id
 WHERE ci.expires_at IS NOT NULL
   AND {threshold_filter}
   AND EXISTS (
        SELECT 1 FROM course_completions AS cc
         WHERE cc.user_id = ci.user_id
           AND cc.course_id = ct.course_id)
 GROUP BY ci.id, ci.definition_id, ct.course_id, ci.user_id
 ORDER BY ci.id ASC
            "#
        );

        let rows = sqlx::query_as::<_, SweepCandidate>(&sql)
            .bind(to_rfc3339(now))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}

/// Payload required to insert an issuance.
pub struct NewIssuance<'a> {
    pub definition_id: i64,
    pub user_id: i64,
    pub code: &'a str,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of attempting to insert an issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceInsertOutcome {
    Inserted(i64),
    /// Another issuance already exists for the (definition, user) pair.
    Existing,
    /// The verification code is already taken.
    CodeConflict,
}

#[derive(Debug, sqlx::FromRow)]
struct IssuanceRow {
    id: i64,
    definition_id: i64,
    user_id: i64,
    code: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl IssuanceRow {
    fn into_domain(self) -> CertificateIssuance {
        CertificateIssuance {
            id: self.id,
            definition_id: self.definition_id,
            user_id: self.user_id,
            code: self.code,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }
}

/// Issuance selected by a sweep query; entities are reloaded before use.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SweepCandidate {
    pub issuance_id: i64,
    pub definition_id: i64,
    pub course_id: i64,
    pub user_id: i64,
    pub company_id: i64,
}

/// Repository for the notification log.
#[derive(Clone)]
pub struct NotificationLogRepository {
    pool: SqlitePool,
}

impl NotificationLogRepository {
    /// Loads last-sent timestamps for every template of a (user, course) pair.
    pub async fn history(&self, user_id: i64, course_id: i64) -> Result<SendHistory, StorageError> {
        let rows = sqlx::query_as::<_, (String, DateTime<Utc>)>(
            "SELECT template_name, last_sent_at FROM notification_log \
              WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = SendHistory::new();
        for (template, sent_at) in rows {
            history.record(template, sent_at);
        }
        Ok(history)
    }

    /// Records a confirmed send, replacing any previous timestamp.
    pub async fn record_sent(
        &self,
        user_id: i64,
        course_id: i64,
        template_name: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO notification_log (user_id, course_id, template_name, last_sent_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id, course_id, template_name) DO UPDATE \
             SET last_sent_at = excluded.last_sent_at",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(template_name)
        .bind(to_rfc3339(sent_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Read access to users, courses, companies and course roles.
#[derive(Clone)]
pub struct DirectoryRepository {
    pool: SqlitePool,
}

impl DirectoryRepository {
    /// Loads a user that is neither deleted nor suspended.
    pub async fn active_user(&self, id: i64) -> Result<Option<UserProfile>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, first_name, last_name FROM users \
              WHERE id = ? AND deleted = 0 AND suspended = 0",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserRow::into_domain))
    }

    pub async fn course(&self, id: i64) -> Result<Option<Course>, StorageError> {
        let row = sqlx::query_as::<_, (i64, String)>("SELECT id, full_name FROM courses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, full_name)| Course { id, full_name }))
    }

    pub async fn company(&self, id: i64) -> Result<Option<Company>, StorageError> {
        let row = sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM companies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, name)| Company { id, name }))
    }

    pub async fn is_company_member(
        &self,
        user_id: i64,
        company_id: i64,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM company_users WHERE user_id = ? AND company_id = ?",
        )
        .bind(user_id)
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        Ok(total > 0)
    }

    /// Completion time of the most recent completion record for a course.
    pub async fn latest_completion(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "SELECT completed_at FROM course_completions \
              WHERE user_id = ? AND course_id = ? \
              ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(completed_at,)| completed_at))
    }

    /// Active users holding the manager role on a course.
    pub async fn course_managers(&self, course_id: i64) -> Result<Vec<UserProfile>, StorageError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT u.id, u.username, u.email, u.first_name, u.last_name \
               FROM course_managers AS cm \
               JOIN users AS u \
                 ON u.id = cm.user_id \
                AND u.deleted = 0 \
                AND u.suspended = 0 \
              WHERE cm.course_id = ? \
              ORDER BY u.id ASC",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UserRow::into_domain).collect())
    }

    pub async fn is_course_manager(&self, user_id: i64, course_id: i64) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM course_managers WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        Ok(total > 0)
    }

    /// Group ids the user belongs to within a course.
    pub async fn course_groups_of(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<Vec<i64>, StorageError> {
        let rows = sqlx::query_as::<_, (i64,)>(
            "SELECT gm.group_id FROM group_members AS gm \
               JOIN course_groups AS g ON g.id = gm.group_id \
              WHERE g.course_id = ? AND gm.user_id = ? \
              ORDER BY gm.group_id ASC",
        )
        .bind(course_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Whether the capability is granted site-wide or on the course.
    pub async fn has_capability(
        &self,
        user_id: i64,
        course_id: i64,
        capability: &str,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM capability_grants \
              WHERE user_id = ? AND capability = ? \
                AND (course_id IS NULL OR course_id = ?)",
        )
        .bind(user_id)
        .bind(capability)
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        Ok(total > 0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    first_name: String,
    last_name: String,
}

impl UserRow {
    fn into_domain(self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
        }
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        for statement in [
            "INSERT INTO users (id, username, email, first_name, last_name) VALUES \
             (1, 'learner', 'learner@example.com', 'Lea', 'Rner'), \
             (2, 'manager', 'manager@example.com', 'Man', 'Ager'), \
             (3, 'gone', 'gone@example.com', 'Gone', 'User')",
            "UPDATE users SET deleted = 1 WHERE id = 3",
            "INSERT INTO courses (id, full_name) VALUES (10, 'Working at height')",
            "INSERT INTO companies (id, name) VALUES (100, 'Acme'), (200, 'Globex')",
            "INSERT INTO departments (id, company_id, name) VALUES (1000, 100, 'Top'), (2000, 200, 'Top')",
            "INSERT INTO company_users (user_id, company_id, department_id) VALUES \
             (1, 200, 2000), (1, 100, 1000), (3, 100, 1000)",
            "INSERT INTO course_completions (user_id, course_id, completed_at) VALUES \
             (1, 10, '2023-01-10T00:00:00.000Z'), (1, 10, '2023-05-10T00:00:00.000Z'), \
             (3, 10, '2023-05-10T00:00:00.000Z')",
            "INSERT INTO course_managers (course_id, user_id) VALUES (10, 2), (10, 3)",
        ] {
            sqlx::query(statement)
                .execute(db.pool())
                .await
                .expect("seed");
        }
        db
    }

    fn definition() -> CertificateDefinition {
        CertificateDefinition {
            id: 50,
            course_id: 10,
            name: "Harness".into(),
            expiry_enabled: true,
            valid_interval_days: Some(365),
            extend_to_month_end: false,
            reminder_recipients: RecipientMode::Both,
            reminder_lead_days: 7,
            expiry_recipients: RecipientMode::Learner,
            date_source: DateSource::Completion,
            date_format: DateFormat::MonthOrdinalYear,
            print_code: true,
            notify_managers_on_issue: true,
            notify_others: "hr@example.com".into(),
            group_mode: GroupMode::Separate,
        }
    }

    async fn issue(db: &Database, user_id: i64, code: &str, expires_at: Option<DateTime<Utc>>) {
        let outcome = db
            .issuances()
            .insert_if_absent(&NewIssuance {
                definition_id: 50,
                user_id,
                code,
                issued_at: at("2023-06-01T00:00:00Z"),
                expires_at,
            })
            .await
            .expect("insert issuance");
        assert!(matches!(outcome, IssuanceInsertOutcome::Inserted(_)));
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        db.run_migrations().await.expect("migrations");

        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 13, "expected all tables to be created");
    }

    #[tokio::test]
    async fn definition_round_trips_through_upsert() {
        let db = setup_db().await;
        let repo = db.definitions();
        let mut def = definition();
        repo.upsert(&def, at("2024-01-01T00:00:00Z"))
            .await
            .expect("insert");
        assert_eq!(repo.fetch(50).await.expect("fetch"), Some(def.clone()));

        def.reminder_lead_days = 30;
        def.valid_interval_days = Some(730);
        repo.upsert(&def, at("2024-02-01T00:00:00Z"))
            .await
            .expect("update");
        let stored = repo.fetch(50).await.expect("fetch").expect("exists");
        assert_eq!(stored.reminder_lead_days, 30);
        assert_eq!(stored.valid_interval_days, Some(730));
        assert!(repo.fetch(51).await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn malformed_interval_decodes_as_missing() {
        let db = setup_db().await;
        db.definitions()
            .upsert(&definition(), Utc::now())
            .await
            .expect("insert");
        sqlx::query("UPDATE certificate_definitions SET valid_interval = 'a year' WHERE id = 50")
            .execute(db.pool())
            .await
            .expect("corrupt interval");

        let stored = db.definitions().fetch(50).await.expect("fetch").expect("exists");
        assert_eq!(stored.valid_interval_days, None);
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_definition_and_user() {
        let db = setup_db().await;
        db.definitions()
            .upsert(&definition(), Utc::now())
            .await
            .expect("definition");
        issue(&db, 1, "CODE000001", None).await;

        let repo = db.issuances();
        let again = repo
            .insert_if_absent(&NewIssuance {
                definition_id: 50,
                user_id: 1,
                code: "CODE000002",
                issued_at: Utc::now(),
                expires_at: None,
            })
            .await
            .expect("second insert");
        assert_eq!(again, IssuanceInsertOutcome::Existing);

        let conflict = repo
            .insert_if_absent(&NewIssuance {
                definition_id: 50,
                user_id: 2,
                code: "CODE000001",
                issued_at: Utc::now(),
                expires_at: None,
            })
            .await
            .expect("conflicting code");
        assert_eq!(conflict, IssuanceInsertOutcome::CodeConflict);

        let stored = repo.find(50, 1).await.expect("find").expect("exists");
        assert_eq!(stored.code, "CODE000001");
        assert!(repo.code_exists("CODE000001").await.expect("exists"));
        assert!(!repo.code_exists("CODE000002").await.expect("exists"));
        assert_eq!(
            repo.find_by_code("CODE000001").await.expect("by code"),
            Some(stored)
        );
    }

    #[tokio::test]
    async fn update_expiry_persists_value() {
        let db = setup_db().await;
        db.definitions()
            .upsert(&definition(), Utc::now())
            .await
            .expect("definition");
        issue(&db, 1, "CODE000001", None).await;
        let repo = db.issuances();
        let stored = repo.find(50, 1).await.expect("find").expect("exists");

        let expiry = at("2024-06-01T00:00:00Z");
        repo.update_expiry(stored.id, Some(expiry))
            .await
            .expect("update");
        let reloaded = repo.find_by_id(stored.id).await.expect("find").expect("exists");
        assert_eq!(reloaded.expires_at, Some(expiry));
    }

    #[tokio::test]
    async fn candidates_respect_thresholds_and_membership() {
        let db = setup_db().await;
        db.definitions()
            .upsert(&definition(), Utc::now())
            .await
            .expect("definition");
        let expiry = at("2024-06-01T00:00:00Z");
        issue(&db, 1, "CODE000001", Some(expiry)).await;
        // Deleted learner never qualifies.
        issue(&db, 3, "CODE000003", Some(expiry)).await;
        // Manager has an issuance but no completion and no company.
        issue(&db, 2, "CODE000002", Some(expiry)).await;

        let repo = db.issuances();
        let early = repo
            .list_candidates(NotificationKind::Reminder, expiry - ChronoDuration::days(10))
            .await
            .expect("candidates");
        assert!(early.is_empty());

        let due = repo
            .list_candidates(NotificationKind::Reminder, expiry - ChronoDuration::days(5))
            .await
            .expect("candidates");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].user_id, 1);
        assert_eq!(due[0].course_id, 10);
        assert_eq!(due[0].company_id, 100);

        let not_expired = repo
            .list_candidates(NotificationKind::Expiry, expiry - ChronoDuration::days(5))
            .await
            .expect("candidates");
        assert!(not_expired.is_empty());

        let expired = repo
            .list_candidates(NotificationKind::Expiry, expiry + ChronoDuration::hours(1))
            .await
            .expect("candidates");
        assert_eq!(expired.len(), 1);
    }

    #[tokio::test]
    async fn disabled_recipients_exclude_candidates() {
        let db = setup_db().await;
        let mut def = definition();
        def.expiry_recipients = RecipientMode::None;
        db.definitions().upsert(&def, Utc::now()).await.expect("definition");
        let expiry = at("2024-06-01T00:00:00Z");
        issue(&db, 1, "CODE000001", Some(expiry)).await;

        let expired = db
            .issuances()
            .list_candidates(NotificationKind::Expiry, expiry + ChronoDuration::days(1))
            .await
            .expect("candidates");
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn notification_log_upserts_per_key() {
        let db = setup_db().await;
        let log = db.notification_log();
        let first = at("2024-01-01T00:00:00Z");
        let second = at("2024-02-01T00:00:00Z");

        log.record_sent(1, 10, "cert_expiry_warn_user", first)
            .await
            .expect("record");
        log.record_sent(1, 10, "cert_expiry_warn_user", second)
            .await
            .expect("record again");
        log.record_sent(1, 10, "cert_expire_user", first)
            .await
            .expect("record other template");

        let history = log.history(1, 10).await.expect("history");
        assert_eq!(history.last_sent("cert_expiry_warn_user"), Some(second));
        assert_eq!(history.last_sent("cert_expire_user"), Some(first));
        assert_eq!(log.history(2, 10).await.expect("history"), SendHistory::new());

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notification_log")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(rows.0, 2);
    }

    #[tokio::test]
    async fn directory_lookups() {
        let db = setup_db().await;
        let directory = db.directory();

        let learner = directory.active_user(1).await.expect("user").expect("exists");
        assert_eq!(learner.full_name(), "Lea Rner");
        assert!(directory.active_user(3).await.expect("user").is_none());

        let managers = directory.course_managers(10).await.expect("managers");
        assert_eq!(managers.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
        assert!(directory.is_course_manager(2, 10).await.expect("manager"));
        assert!(!directory.is_course_manager(1, 10).await.expect("manager"));

        assert_eq!(
            directory.latest_completion(1, 10).await.expect("completion"),
            Some(at("2023-05-10T00:00:00Z"))
        );
        assert_eq!(directory.latest_completion(2, 10).await.expect("completion"), None);
        assert!(directory.is_company_member(1, 100).await.expect("member"));
        assert!(directory.is_company_member(1, 200).await.expect("member"));
        assert!(!directory.is_company_member(3, 200).await.expect("member"));
        assert!(!directory.is_company_member(2, 100).await.expect("member"));
        assert_eq!(
            directory.company(200).await.expect("company").map(|c| c.name),
            Some("Globex".to_string())
        );
        assert_eq!(
            directory.course(10).await.expect("course").map(|c| c.full_name),
            Some("Working at height".to_string())
        );
    }

    #[tokio::test]
    async fn capabilities_and_groups() {
        let db = setup_db().await;
        for statement in [
            "INSERT INTO courses (id, full_name) VALUES (99, 'Other course')",
            "INSERT INTO course_groups (id, course_id, name) VALUES (7, 10, 'North'), (8, 10, 'South')",
            "INSERT INTO group_members (group_id, user_id) VALUES (8, 1), (7, 1), (7, 2)",
            "INSERT INTO capability_grants (user_id, course_id, capability) VALUES \
             (2, NULL, 'certificate:manage'), (1, 99, 'certificate:manage')",
        ] {
            sqlx::query(statement)
                .execute(db.pool())
                .await
                .expect("seed");
        }
        let directory = db.directory();
        assert_eq!(directory.course_groups_of(1, 10).await.expect("groups"), vec![7, 8]);
        assert!(directory.course_groups_of(3, 10).await.expect("groups").is_empty());
        assert!(directory
            .has_capability(2, 10, "certificate:manage")
            .await
            .expect("capability"));
        assert!(!directory
            .has_capability(1, 10, "certificate:manage")
            .await
            .expect("capability"));
    }

    #[tokio::test]
    async fn file_database_survives_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("certwatch.db").display());

        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db.notification_log()
            .record_sent(1, 10, "cert_expire_user", at("2024-01-01T00:00:00Z"))
            .await
            .expect("record");
        db.pool().close().await;

        let reopened = Database::connect(&url).await.expect("reconnect");
        reopened.run_migrations().await.expect("migrations are idempotent");
        let history = reopened.notification_log().history(1, 10).await.expect("history");
        assert_eq!(
            history.last_sent("cert_expire_user"),
            Some(at("2024-01-01T00:00:00Z"))
        );
    }
}
