use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use certwatch_core::{
    types::{
        CertificateDefinition, CertificateIssuance, DateSource, OperationContext, UserProfile,
        AWARD_MANAGER_TEMPLATE, AWARD_OTHER_TEMPLATE,
    },
    ExpiryCalculator,
};
use certwatch_storage::{Database, IssuanceInsertOutcome, NewIssuance, StorageError};

use crate::authz::{Action, Authorizer, AuthzError};
use crate::delivery::TemplateDelivery;
use crate::directory::ManagerDirectory;

pub const CODE_LENGTH: usize = 10;
const MAX_CODE_ATTEMPTS: usize = 16;

/// Issues certificates, keeps their expiry current and verifies codes.
#[derive(Clone)]
pub struct IssuanceService {
    database: Database,
    authorizer: Arc<dyn Authorizer>,
    delivery: Arc<dyn TemplateDelivery>,
    managers: Arc<dyn ManagerDirectory>,
    calculator: ExpiryCalculator,
}

impl IssuanceService {
    pub fn new(
        database: Database,
        authorizer: Arc<dyn Authorizer>,
        delivery: Arc<dyn TemplateDelivery>,
        managers: Arc<dyn ManagerDirectory>,
        calculator: ExpiryCalculator,
    ) -> Self {
        Self {
            database,
            authorizer,
            delivery,
            managers,
            calculator,
        }
    }

    /// Returns the user's certificate, creating it on first request.
    ///
    /// Repeated calls return the same issuance and verification code.
    pub async fn issue(
        &self,
        ctx: &OperationContext,
        definition_id: i64,
        user_id: i64,
    ) -> Result<IssuanceView, IssuanceError> {
        let definition = self
            .database
            .definitions()
            .fetch(definition_id)
            .await?
            .ok_or(IssuanceError::NotFound("definition"))?;

        let decision = self
            .authorizer
            .authorize(
                ctx,
                Action::ObtainCertificate {
                    course_id: definition.course_id,
                    user_id,
                },
            )
            .await?;
        if !decision.allowed {
            return Err(IssuanceError::Forbidden(decision.reason));
        }

        let directory = self.database.directory();
        let learner = directory
            .active_user(user_id)
            .await?
            .ok_or(IssuanceError::NotFound("user"))?;
        let course = directory
            .course(definition.course_id)
            .await?
            .ok_or(IssuanceError::NotFound("course"))?;

        let issuances = self.database.issuances();
        let (issuance, created) = match issuances.find(definition.id, user_id).await? {
            Some(existing) => (self.refresh_expiry(&definition, existing, ctx.now).await?, false),
            None => (self.create(&definition, user_id, ctx.now).await?, true),
        };

        if created {
            counter!("certificates_issued_total").increment(1);
            info!(
                stage = "issuance",
                definition_id = definition.id,
                user_id,
                issuance_id = issuance.id,
                "certificate issued"
            );
            self.send_award_notices(&definition, &issuance, &learner, &course.full_name)
                .await;
        }

        Ok(IssuanceView::new(
            &definition,
            &issuance,
            &learner,
            &course.full_name,
            self.calculator,
            ctx.now,
            created,
        ))
    }

    /// Looks up a certificate by verification code.
    pub async fn verify(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<VerificationView, IssuanceError> {
        let issuance = self
            .database
            .issuances()
            .find_by_code(code.trim())
            .await?
            .ok_or(IssuanceError::NotFound("certificate"))?;
        let definition = self
            .database
            .definitions()
            .fetch(issuance.definition_id)
            .await?
            .ok_or(IssuanceError::NotFound("definition"))?;

        let holder = self
            .database
            .directory()
            .active_user(issuance.user_id)
            .await?
            .map(|user| user.full_name());

        let tz = self.calculator.timezone();
        let format = definition.date_format;
        Ok(VerificationView {
            code: issuance.code.clone(),
            certificate_name: definition.name,
            holder,
            issued_at: issuance.issued_at,
            expires_at: issuance.expires_at,
            issued_on: format.render(issuance.issued_at, tz),
            expires_on: issuance.expires_at.map(|value| format.render(value, tz)),
            status: if issuance.is_expired(now) {
                VerificationStatus::Expired
            } else {
                VerificationStatus::Valid
            },
        })
    }

    /// Persists an administrator edit of a definition.
    pub async fn update_definition(
        &self,
        ctx: &OperationContext,
        definition: CertificateDefinition,
    ) -> Result<CertificateDefinition, IssuanceError> {
        validate_definition(&definition)?;

        let mut courses = vec![definition.course_id];
        if let Some(existing) = self.database.definitions().fetch(definition.id).await? {
            if existing.course_id != definition.course_id {
                courses.push(existing.course_id);
            }
        }
        for course_id in courses {
            let decision = self
                .authorizer
                .authorize(ctx, Action::ManageDefinition { course_id })
                .await?;
            if !decision.allowed {
                return Err(IssuanceError::Forbidden(decision.reason));
            }
        }

        if self
            .database
            .directory()
            .course(definition.course_id)
            .await?
            .is_none()
        {
            return Err(IssuanceError::NotFound("course"));
        }

        self.database
            .definitions()
            .upsert(&definition, ctx.now)
            .await?;
        info!(
            stage = "issuance",
            definition_id = definition.id,
            actor_id = ctx.actor_id,
            "certificate definition updated"
        );
        Ok(definition)
    }

    async fn create(
        &self,
        definition: &CertificateDefinition,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<CertificateIssuance, IssuanceError> {
        let base = self.expiry_base(definition, user_id, now).await?;
        let expires_at = self.expiry_for(definition, base, now);
        let issuances = self.database.issuances();

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code();
            if issuances.code_exists(&code).await? {
                continue;
            }

            let outcome = issuances
                .insert_if_absent(&NewIssuance {
                    definition_id: definition.id,
                    user_id,
                    code: &code,
                    issued_at: now,
                    expires_at,
                })
                .await?;
            match outcome {
                IssuanceInsertOutcome::CodeConflict => continue,
                IssuanceInsertOutcome::Inserted(_) | IssuanceInsertOutcome::Existing => {
                    return issuances
                        .find(definition.id, user_id)
                        .await?
                        .ok_or(IssuanceError::NotFound("certificate"));
                }
            }
        }

        Err(IssuanceError::CodeExhausted)
    }

    /// Recomputes the stored expiry until it has been reached.
    async fn refresh_expiry(
        &self,
        definition: &CertificateDefinition,
        issuance: CertificateIssuance,
        now: DateTime<Utc>,
    ) -> Result<CertificateIssuance, IssuanceError> {
        if !definition.expiry_enabled {
            return Ok(issuance);
        }
        if matches!(issuance.expires_at, Some(expiry) if expiry <= now) {
            return Ok(issuance);
        }

        let base = self
            .expiry_base(definition, issuance.user_id, issuance.issued_at)
            .await?;
        let expires_at = self.expiry_for(definition, base, issuance.issued_at);
        if expires_at == issuance.expires_at {
            return Ok(issuance);
        }

        self.database
            .issuances()
            .update_expiry(issuance.id, expires_at)
            .await?;
        Ok(CertificateIssuance {
            expires_at,
            ..issuance
        })
    }

    async fn expiry_base(
        &self,
        definition: &CertificateDefinition,
        user_id: i64,
        issued_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, IssuanceError> {
        match definition.date_source {
            DateSource::Issue => Ok(issued_at),
            DateSource::Completion => Ok(self
                .database
                .directory()
                .latest_completion(user_id, definition.course_id)
                .await?
                .unwrap_or(issued_at)),
        }
    }

    /// Expiry stored for an issuance; absent unless strictly after issue time.
    fn expiry_for(
        &self,
        definition: &CertificateDefinition,
        base: DateTime<Utc>,
        issued_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !definition.expiry_enabled {
            return None;
        }
        let expiry = self.calculator.compute_optional(
            base,
            definition.valid_interval_days,
            definition.extend_to_month_end,
        );
        (expiry > issued_at).then_some(expiry)
    }

    async fn send_award_notices(
        &self,
        definition: &CertificateDefinition,
        issuance: &CertificateIssuance,
        learner: &UserProfile,
        course_name: &str,
    ) {
        let context = award_context(definition, issuance, learner, course_name, self.calculator);

        if definition.notify_managers_on_issue {
            match self
                .managers
                .managers_for(definition.course_id, learner.id, definition.group_mode)
                .await
            {
                Ok(managers) => {
                    for manager in managers {
                        let mut context = context.clone();
                        context["recipient"] = manager.summary();
                        self.send_notice(AWARD_MANAGER_TEMPLATE, &manager.email, context)
                            .await;
                    }
                }
                Err(err) => warn!(
                    stage = "issuance",
                    definition_id = definition.id,
                    error = %err,
                    "failed to resolve managers for award notice"
                ),
            }
        }

        for address in definition.other_recipients() {
            let mut context = context.clone();
            context["recipient"] = json!({ "email": address });
            self.send_notice(AWARD_OTHER_TEMPLATE, &address, context)
                .await;
        }
    }

    async fn send_notice(&self, template: &'static str, to: &str, context: Value) {
        if let Err(err) = self.delivery.send(template, to, context).await {
            counter!("delivery_failures_total", "template" => template).increment(1);
            warn!(stage = "issuance", template, error = %err, "award notice delivery failed");
        }
    }
}

fn award_context(
    definition: &CertificateDefinition,
    issuance: &CertificateIssuance,
    learner: &UserProfile,
    course_name: &str,
    calculator: ExpiryCalculator,
) -> Value {
    let tz = calculator.timezone();
    json!({
        "user": learner.summary(),
        "course": { "id": definition.course_id, "full_name": course_name },
        "certificate": {
            "name": definition.name,
            "code": issuance.code,
            "issued_at": issuance.issued_at,
            "expires_at": issuance.expires_at,
            "issued_on": definition.date_format.render(issuance.issued_at, tz),
        },
    })
}

fn generate_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CODE_LENGTH)
        .map(char::from)
        .collect()
}

fn validate_definition(definition: &CertificateDefinition) -> Result<(), IssuanceError> {
    if definition.name.trim().is_empty() {
        return Err(IssuanceError::Invalid("name must not be empty".into()));
    }
    if definition.reminder_lead_days < 0 {
        return Err(IssuanceError::Invalid(
            "reminder_lead_days must not be negative".into(),
        ));
    }
    if definition.expiry_enabled {
        match definition.valid_interval_days {
            Some(days) if days > 0 => {}
            _ => {
                return Err(IssuanceError::Invalid(
                    "valid_interval_days must be a positive number of days".into(),
                ))
            }
        }
    }
    Ok(())
}

/// Certificate as presented to its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuanceView {
    pub issuance_id: i64,
    pub definition_id: i64,
    pub user_id: i64,
    pub certificate_name: String,
    pub course_name: String,
    pub holder: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_on: String,
    pub expires_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub expired: bool,
    pub created: bool,
}

impl IssuanceView {
    fn new(
        definition: &CertificateDefinition,
        issuance: &CertificateIssuance,
        learner: &UserProfile,
        course_name: &str,
        calculator: ExpiryCalculator,
        now: DateTime<Utc>,
        created: bool,
    ) -> Self {
        let tz = calculator.timezone();
        let format = definition.date_format;
        Self {
            issuance_id: issuance.id,
            definition_id: definition.id,
            user_id: issuance.user_id,
            certificate_name: definition.name.clone(),
            course_name: course_name.to_string(),
            holder: learner.full_name(),
            issued_at: issuance.issued_at,
            expires_at: issuance.expires_at,
            issued_on: format.render(issuance.issued_at, tz),
            expires_on: issuance.expires_at.map(|value| format.render(value, tz)),
            code: definition.print_code.then(|| issuance.code.clone()),
            expired: issuance.is_expired(now),
            created,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Valid,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationView {
    pub code: String,
    pub certificate_name: String,
    pub holder: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_on: String,
    pub expires_on: Option<String>,
    pub status: VerificationStatus,
}

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("operation not permitted: {0}")]
    Forbidden(&'static str),
    #[error("invalid definition: {0}")]
    Invalid(String),
    #[error("could not allocate a unique verification code")]
    CodeExhausted,
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
