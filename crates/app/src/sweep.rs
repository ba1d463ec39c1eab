use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use certwatch_core::{
    policy::{Audience, NotificationPolicy, PlannedDelivery, PolicyAction},
    types::{
        CertificateDefinition, CertificateIssuance, Company, Course, NotificationKind, UserProfile,
    },
    DateFormat,
};
use certwatch_storage::{Database, StorageError, SweepCandidate};

use crate::delivery::TemplateDelivery;
use crate::directory::ManagerDirectory;

/// Reminder and expiry notification runs.
///
/// A run walks every candidate serially: policy check, delivery, then a log
/// write for each acknowledged template. Nothing is cached between runs, so
/// an interrupted run is simply re-evaluated next time.
#[derive(Clone)]
pub struct NotificationSweep {
    database: Database,
    delivery: Arc<dyn TemplateDelivery>,
    managers: Arc<dyn ManagerDirectory>,
    policy: NotificationPolicy,
    timezone: Tz,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl NotificationSweep {
    pub fn new(
        database: Database,
        delivery: Arc<dyn TemplateDelivery>,
        managers: Arc<dyn ManagerDirectory>,
        policy: NotificationPolicy,
        timezone: Tz,
    ) -> Self {
        Self {
            database,
            delivery,
            managers,
            policy,
            timezone,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run_reminder_sweep(&self) -> Result<SweepSummary, SweepError> {
        self.run(NotificationKind::Reminder, (self.clock)()).await
    }

    pub async fn run_expiry_sweep(&self) -> Result<SweepSummary, SweepError> {
        self.run(NotificationKind::Expiry, (self.clock)()).await
    }

    /// Runs one sweep at `now`. Only a failure to load the candidate list is
    /// returned as an error; per-candidate problems are counted in the summary.
    pub async fn run(
        &self,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<SweepSummary, SweepError> {
        let start = Instant::now();
        let run = kind.as_str();
        let candidates = self.database.issuances().list_candidates(kind, now).await?;

        let mut summary = SweepSummary::new(kind, now);
        summary.candidates = candidates.len();
        counter!("sweep_candidates_total", "run" => run).increment(candidates.len() as u64);

        for candidate in &candidates {
            let outcome = match self.process_candidate(kind, candidate, now).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        stage = "sweep",
                        run,
                        issuance_id = candidate.issuance_id,
                        user_id = candidate.user_id,
                        error = %err,
                        "candidate processing failed"
                    );
                    CandidateOutcome::Failed { deliveries: 0 }
                }
            };
            summary.absorb(outcome);
            counter!("sweep_notifications_total", "run" => run, "result" => outcome.as_str())
                .increment(1);
        }

        let elapsed = start.elapsed().as_secs_f64();
        histogram!("sweep_duration_seconds", "run" => run).record(elapsed);
        info!(
            stage = "sweep",
            run,
            candidates = summary.candidates,
            sent = summary.sent,
            suppressed = summary.suppressed,
            not_due = summary.not_due,
            skipped = summary.skipped,
            failed = summary.failed,
            deliveries = summary.deliveries,
            duration_secs = elapsed,
            "sweep completed"
        );

        Ok(summary)
    }

    async fn process_candidate(
        &self,
        kind: NotificationKind,
        candidate: &SweepCandidate,
        now: DateTime<Utc>,
    ) -> Result<CandidateOutcome, StorageError> {
        let Some(entities) = self.load_entities(candidate).await? else {
            warn!(
                stage = "sweep",
                run = kind.as_str(),
                issuance_id = candidate.issuance_id,
                user_id = candidate.user_id,
                "candidate references missing records, skipping"
            );
            return Ok(CandidateOutcome::Skipped);
        };

        let history = self
            .database
            .notification_log()
            .history(candidate.user_id, candidate.course_id)
            .await?;
        let outcome = self.policy.evaluate(
            kind,
            &entities.definition,
            &entities.issuance,
            &history,
            now,
        );

        match outcome.action {
            PolicyAction::NotDue => return Ok(CandidateOutcome::NotDue),
            PolicyAction::Ignored => return Ok(CandidateOutcome::Skipped),
            PolicyAction::Suppressed => return Ok(CandidateOutcome::Suppressed),
            PolicyAction::Eligible => {}
        }

        let mut delivered = 0;
        let mut failed = false;
        for planned in &outcome.deliveries {
            let result = match planned.audience {
                Audience::Learner => self.deliver_to_learner(kind, planned, &entities).await?,
                Audience::Managers => self.deliver_to_managers(kind, planned, &entities).await?,
            };
            delivered += result.acknowledged;
            if result.failed {
                failed = true;
                continue;
            }
            if result.acknowledged > 0 {
                self.database
                    .notification_log()
                    .record_sent(candidate.user_id, candidate.course_id, planned.template, now)
                    .await?;
            }
        }

        Ok(if failed {
            CandidateOutcome::Failed {
                deliveries: delivered,
            }
        } else if delivered > 0 {
            CandidateOutcome::Sent {
                deliveries: delivered,
            }
        } else {
            CandidateOutcome::Skipped
        })
    }

    async fn load_entities(
        &self,
        candidate: &SweepCandidate,
    ) -> Result<Option<CandidateEntities>, StorageError> {
        let directory = self.database.directory();
        let Some(issuance) = self
            .database
            .issuances()
            .find_by_id(candidate.issuance_id)
            .await?
        else {
            return Ok(None);
        };
        let Some(definition) = self.database.definitions().fetch(candidate.definition_id).await?
        else {
            return Ok(None);
        };
        let Some(learner) = directory.active_user(candidate.user_id).await? else {
            return Ok(None);
        };
        let Some(course) = directory.course(candidate.course_id).await? else {
            return Ok(None);
        };
        let Some(company) = directory.company(candidate.company_id).await? else {
            return Ok(None);
        };

        Ok(Some(CandidateEntities {
            issuance,
            definition,
            learner,
            course,
            company,
        }))
    }

    async fn deliver_to_learner(
        &self,
        kind: NotificationKind,
        planned: &PlannedDelivery,
        entities: &CandidateEntities,
    ) -> Result<AudienceResult, StorageError> {
        let context = self.notification_context(kind, entities, &entities.learner);
        let ok = self
            .send_one(kind, planned.template, &entities.learner, context)
            .await;
        Ok(AudienceResult {
            acknowledged: usize::from(ok),
            failed: !ok,
        })
    }

    async fn deliver_to_managers(
        &self,
        kind: NotificationKind,
        planned: &PlannedDelivery,
        entities: &CandidateEntities,
    ) -> Result<AudienceResult, StorageError> {
        let managers = self
            .managers
            .managers_for(
                entities.course.id,
                entities.learner.id,
                entities.definition.group_mode,
            )
            .await?;

        if managers.is_empty() {
            info!(
                stage = "sweep",
                run = kind.as_str(),
                course_id = entities.course.id,
                user_id = entities.learner.id,
                "no managers to notify"
            );
        }

        let mut result = AudienceResult::default();
        for manager in &managers {
            let context = self.notification_context(kind, entities, manager);
            if self.send_one(kind, planned.template, manager, context).await {
                result.acknowledged += 1;
            } else {
                result.failed = true;
            }
        }
        Ok(result)
    }

    async fn send_one(
        &self,
        kind: NotificationKind,
        template: &'static str,
        recipient: &UserProfile,
        context: Value,
    ) -> bool {
        match self.delivery.send(template, &recipient.email, context).await {
            Ok(receipt) => {
                info!(
                    stage = "sweep",
                    run = kind.as_str(),
                    template,
                    recipient_id = recipient.id,
                    delivery_id = %receipt.delivery_id,
                    "notification delivered"
                );
                true
            }
            Err(err) => {
                counter!("delivery_failures_total", "template" => template).increment(1);
                warn!(
                    stage = "sweep",
                    run = kind.as_str(),
                    template,
                    recipient_id = recipient.id,
                    error = %err,
                    "notification delivery failed"
                );
                false
            }
        }
    }

    fn notification_context(
        &self,
        kind: NotificationKind,
        entities: &CandidateEntities,
        recipient: &UserProfile,
    ) -> Value {
        let issuance = &entities.issuance;
        let format = match entities.definition.date_format {
            DateFormat::Hidden => DateFormat::SiteDefault,
            other => other,
        };
        json!({
            "run": kind.as_str(),
            "recipient": recipient.summary(),
            "user": entities.learner.summary(),
            "course": { "id": entities.course.id, "full_name": entities.course.full_name },
            "company": { "id": entities.company.id, "name": entities.company.name },
            "certificate": {
                "name": entities.definition.name,
                "code": issuance.code,
                "issued_at": issuance.issued_at,
                "expires_at": issuance.expires_at,
                "issued_on": format.render(issuance.issued_at, self.timezone),
                "expires_on": issuance.expires_at.map(|value| format.render(value, self.timezone)),
            },
        })
    }
}

struct CandidateEntities {
    issuance: CertificateIssuance,
    definition: CertificateDefinition,
    learner: UserProfile,
    course: Course,
    company: Company,
}

#[derive(Debug, Default)]
struct AudienceResult {
    acknowledged: usize,
    failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    Sent { deliveries: usize },
    Suppressed,
    NotDue,
    Skipped,
    Failed { deliveries: usize },
}

impl CandidateOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Suppressed => "suppressed",
            Self::NotDue => "not_due",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Completion report of one sweep run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub run: NotificationKind,
    pub started_at: DateTime<Utc>,
    pub candidates: usize,
    pub sent: usize,
    pub suppressed: usize,
    pub not_due: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Acknowledged deliveries across all recipients.
    pub deliveries: usize,
}

impl SweepSummary {
    fn new(run: NotificationKind, started_at: DateTime<Utc>) -> Self {
        Self {
            run,
            started_at,
            candidates: 0,
            sent: 0,
            suppressed: 0,
            not_due: 0,
            skipped: 0,
            failed: 0,
            deliveries: 0,
        }
    }

    fn absorb(&mut self, outcome: CandidateOutcome) {
        match outcome {
            CandidateOutcome::Sent { deliveries } => {
                self.sent += 1;
                self.deliveries += deliveries;
            }
            CandidateOutcome::Suppressed => self.suppressed += 1,
            CandidateOutcome::NotDue => self.not_due += 1,
            CandidateOutcome::Skipped => self.skipped += 1,
            CandidateOutcome::Failed { deliveries } => {
                self.failed += 1;
                self.deliveries += deliveries;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("failed to load sweep candidates: {0}")]
    Storage(#[from] StorageError),
}
