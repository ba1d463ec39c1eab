use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use certwatch_core::types::OperationContext;
use certwatch_storage::{Database, StorageError};

/// Capability that lets a user manage certificates of a course.
pub const MANAGE_CAPABILITY: &str = "certificate:manage";

/// State-changing operations that need an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Obtain (view or issue) the certificate of `user_id` in a course.
    ObtainCertificate { course_id: i64, user_id: i64 },
    ManageDefinition { course_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl Decision {
    fn allow(reason: &'static str) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        ctx: &OperationContext,
        action: Action,
    ) -> Result<Decision, AuthzError>;
}

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("authorization lookup failed: {0}")]
    Storage(#[from] StorageError),
}

/// Decisions from course roles, capability grants and completions.
#[derive(Clone)]
pub struct SqliteAuthorizer {
    database: Database,
}

impl SqliteAuthorizer {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    async fn is_course_admin(&self, actor_id: i64, course_id: i64) -> Result<bool, AuthzError> {
        let directory = self.database.directory();
        if directory.is_course_manager(actor_id, course_id).await? {
            return Ok(true);
        }
        Ok(directory
            .has_capability(actor_id, course_id, MANAGE_CAPABILITY)
            .await?)
    }
}

#[async_trait]
impl Authorizer for SqliteAuthorizer {
    async fn authorize(
        &self,
        ctx: &OperationContext,
        action: Action,
    ) -> Result<Decision, AuthzError> {
        let directory = self.database.directory();
        if directory.active_user(ctx.actor_id).await?.is_none() {
            return Ok(Decision::deny("inactive_actor"));
        }

        match action {
            Action::ManageDefinition { course_id } => {
                if self.is_course_admin(ctx.actor_id, course_id).await? {
                    Ok(Decision::allow("course_manager"))
                } else {
                    Ok(Decision::deny("missing_manage_capability"))
                }
            }
            Action::ObtainCertificate { course_id, user_id } => {
                if ctx.actor_id != user_id {
                    if !self.is_course_admin(ctx.actor_id, course_id).await? {
                        return Ok(Decision::deny("not_own_certificate"));
                    }
                    // Acting for someone else stays inside the selected company.
                    if let Some(company_id) = ctx.company_id {
                        if !directory.is_company_member(ctx.actor_id, company_id).await?
                            || !directory.is_company_member(user_id, company_id).await?
                        {
                            return Ok(Decision::deny("outside_company"));
                        }
                    }
                    return Ok(Decision::allow("course_manager"));
                }

                if directory.latest_completion(user_id, course_id).await?.is_some() {
                    Ok(Decision::allow("course_completed"))
                } else {
                    Ok(Decision::deny("course_not_completed"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::test_support::{add_learner, execute_all, setup_db};

    fn ctx(actor_id: i64) -> OperationContext {
        OperationContext::new(actor_id, Some(100), Utc::now())
    }

    #[tokio::test]
    async fn learner_with_completion_obtains_own_certificate() {
        let db = setup_db().await;
        let authz = SqliteAuthorizer::new(db);

        let decision = authz
            .authorize(&ctx(1), Action::ObtainCertificate { course_id: 10, user_id: 1 })
            .await
            .expect("decision");
        assert!(decision.allowed);
        assert_eq!(decision.reason, "course_completed");
    }

    #[tokio::test]
    async fn learner_cannot_obtain_someone_elses_certificate() {
        let db = setup_db().await;
        add_learner(&db, 3, "other@example.com").await;
        let authz = SqliteAuthorizer::new(db);

        let decision = authz
            .authorize(&ctx(3), Action::ObtainCertificate { course_id: 10, user_id: 1 })
            .await
            .expect("decision");
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn managers_act_for_learners_of_the_selected_company_only() {
        let db = setup_db().await;
        execute_all(
            &db,
            &[
                "INSERT INTO companies (id, name) VALUES (200, 'Globex')",
                "INSERT INTO departments (id, company_id, name) VALUES (2000, 200, 'Ops')",
                "INSERT INTO users (id, username, email) VALUES (6, 'outsider', 'outsider@example.com')",
                "INSERT INTO company_users (user_id, company_id, department_id) VALUES (6, 200, 2000)",
            ],
        )
        .await;
        let authz = SqliteAuthorizer::new(db);

        let same_company = authz
            .authorize(&ctx(2), Action::ObtainCertificate { course_id: 10, user_id: 1 })
            .await
            .expect("decision");
        assert!(same_company.allowed);

        let other_company = authz
            .authorize(&ctx(2), Action::ObtainCertificate { course_id: 10, user_id: 6 })
            .await
            .expect("decision");
        assert!(!other_company.allowed);
        assert_eq!(other_company.reason, "outside_company");

        let foreign_context = OperationContext::new(2, Some(200), Utc::now());
        let decision = authz
            .authorize(&foreign_context, Action::ObtainCertificate { course_id: 10, user_id: 1 })
            .await
            .expect("decision");
        assert_eq!(decision.reason, "outside_company");

        let no_context = OperationContext::new(2, None, Utc::now());
        let decision = authz
            .authorize(&no_context, Action::ObtainCertificate { course_id: 10, user_id: 6 })
            .await
            .expect("decision");
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn learner_without_completion_is_denied() {
        let db = setup_db().await;
        execute_all(
            &db,
            &["INSERT INTO users (id, username, email) VALUES (4, 'fresh', 'fresh@example.com')"],
        )
        .await;
        let authz = SqliteAuthorizer::new(db);

        let decision = authz
            .authorize(&ctx(4), Action::ObtainCertificate { course_id: 10, user_id: 4 })
            .await
            .expect("decision");
        assert_eq!(decision.reason, "course_not_completed");
    }

    #[tokio::test]
    async fn managers_and_capability_holders_manage_definitions() {
        let db = setup_db().await;
        execute_all(
            &db,
            &[
                "INSERT INTO users (id, username, email) VALUES (5, 'admin', 'admin@example.com')",
                "INSERT INTO capability_grants (user_id, course_id, capability) VALUES (5, NULL, 'certificate:manage')",
            ],
        )
        .await;
        let authz = SqliteAuthorizer::new(db);
        let action = Action::ManageDefinition { course_id: 10 };

        assert!(authz.authorize(&ctx(2), action).await.expect("manager").allowed);
        assert!(authz.authorize(&ctx(5), action).await.expect("admin").allowed);
        assert!(!authz.authorize(&ctx(1), action).await.expect("learner").allowed);
        assert_eq!(
            authz.authorize(&ctx(99), action).await.expect("unknown").reason,
            "inactive_actor"
        );
    }
}
