use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CertificateDefinition, CertificateIssuance, NotificationKind};

const SECONDS_PER_DAY: i64 = 86_400;

/// Minimum spacing between two reminders of the same template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReminderCooldown {
    /// Reuse each definition's reminder lead time as the window.
    LeadTime,
    Fixed { days: i64 },
}

impl Default for ReminderCooldown {
    fn default() -> Self {
        Self::Fixed { days: 30 }
    }
}

impl ReminderCooldown {
    /// Window length, or `None` when it does not fit a `Duration`.
    fn window(self, definition: &CertificateDefinition) -> Option<Duration> {
        let days = match self {
            Self::LeadTime => definition.reminder_lead_days,
            Self::Fixed { days } => days,
        };
        whole_days(days.max(0))
    }
}

fn whole_days(days: i64) -> Option<Duration> {
    days.checked_mul(SECONDS_PER_DAY)
        .and_then(Duration::try_seconds)
}

/// Recipient group of a planned delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Learner,
    Managers,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Learner => "learner",
            Self::Managers => "managers",
        }
    }

    pub fn template(self, kind: NotificationKind) -> &'static str {
        match self {
            Self::Learner => kind.learner_template(),
            Self::Managers => kind.manager_template(),
        }
    }
}

/// One template the sweep should deliver for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedDelivery {
    pub audience: Audience,
    pub template: &'static str,
}

/// Last send time per template for one (learner, course) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendHistory {
    last_sent: HashMap<String, DateTime<Utc>>,
}

impl SendHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, template: impl Into<String>, sent_at: DateTime<Utc>) {
        self.last_sent.insert(template.into(), sent_at);
    }

    pub fn with(mut self, template: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        self.record(template, sent_at);
        self
    }

    pub fn last_sent(&self, template: &str) -> Option<DateTime<Utc>> {
        self.last_sent.get(template).copied()
    }
}

/// Decides whether a certificate issuance needs a reminder or expiry notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationPolicy {
    cooldown: ReminderCooldown,
}

impl NotificationPolicy {
    pub fn new(cooldown: ReminderCooldown) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> ReminderCooldown {
        self.cooldown
    }

    /// Returns `true` when the run's threshold has been crossed at `now`.
    pub fn threshold_crossed(
        &self,
        kind: NotificationKind,
        definition: &CertificateDefinition,
        issuance: &CertificateIssuance,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(expires_at) = issuance.expires_at else {
            return false;
        };

        let threshold = match kind {
            // A lead time too large to represent puts the threshold before the epoch.
            NotificationKind::Reminder => match whole_days(definition.reminder_lead_days)
                .and_then(|lead| expires_at.checked_sub_signed(lead))
            {
                Some(threshold) => threshold,
                None => return false,
            },
            NotificationKind::Expiry => expires_at,
        };

        threshold.timestamp() > 0 && threshold < now
    }

    /// Evaluates one candidate against its send history.
    pub fn evaluate(
        &self,
        kind: NotificationKind,
        definition: &CertificateDefinition,
        issuance: &CertificateIssuance,
        history: &SendHistory,
        now: DateTime<Utc>,
    ) -> PolicyOutcome {
        let mode = definition.recipients_for(kind);
        if !definition.expiry_enabled || !mode.is_enabled() {
            return PolicyOutcome::ignored("notifications_disabled");
        }

        if !self.threshold_crossed(kind, definition, issuance, now) {
            return PolicyOutcome::not_due();
        }

        let audiences = [
            (mode.includes_learner(), Audience::Learner),
            (mode.includes_managers(), Audience::Managers),
        ];

        let mut deliveries = Vec::new();
        let mut suppressed = Vec::new();
        for (enabled, audience) in audiences {
            if !enabled {
                continue;
            }
            let planned = PlannedDelivery {
                audience,
                template: audience.template(kind),
            };
            if self.is_suppressed(kind, definition, issuance, history, planned.template, now) {
                suppressed.push(planned);
            } else {
                deliveries.push(planned);
            }
        }

        if deliveries.is_empty() {
            PolicyOutcome::suppressed(suppressed)
        } else {
            PolicyOutcome::eligible(deliveries, suppressed)
        }
    }

    fn is_suppressed(
        &self,
        kind: NotificationKind,
        definition: &CertificateDefinition,
        issuance: &CertificateIssuance,
        history: &SendHistory,
        template: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_sent) = history.last_sent(template) else {
            return false;
        };

        match kind {
            // An unrepresentable window reaches past every recorded send.
            NotificationKind::Reminder => match self
                .cooldown
                .window(definition)
                .and_then(|window| now.checked_sub_signed(window))
            {
                Some(cutoff) => last_sent > cutoff,
                None => true,
            },
            // One expiry notice per issuance; a renewed certificate starts over.
            NotificationKind::Expiry => last_sent >= issuance.issued_at,
        }
    }
}

/// Result of evaluating one sweep candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub action: PolicyAction,
    pub deliveries: Vec<PlannedDelivery>,
    pub suppressed: Vec<PlannedDelivery>,
    pub reason: Option<&'static str>,
}

impl PolicyOutcome {
    fn eligible(deliveries: Vec<PlannedDelivery>, suppressed: Vec<PlannedDelivery>) -> Self {
        Self {
            action: PolicyAction::Eligible,
            deliveries,
            suppressed,
            reason: None,
        }
    }

    fn suppressed(suppressed: Vec<PlannedDelivery>) -> Self {
        Self {
            action: PolicyAction::Suppressed,
            deliveries: Vec::new(),
            suppressed,
            reason: Some("sent_within_cooldown"),
        }
    }

    fn not_due() -> Self {
        Self {
            action: PolicyAction::NotDue,
            deliveries: Vec::new(),
            suppressed: Vec::new(),
            reason: Some("threshold_not_reached"),
        }
    }

    fn ignored(reason: &'static str) -> Self {
        Self {
            action: PolicyAction::Ignored,
            deliveries: Vec::new(),
            suppressed: Vec::new(),
            reason: Some(reason),
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self.action, PolicyAction::Eligible)
    }
}

/// Classification of a policy outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Eligible,
    Suppressed,
    NotDue,
    Ignored,
}

impl PolicyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eligible => "eligible",
            Self::Suppressed => "suppressed",
            Self::NotDue => "not_due",
            Self::Ignored => "ignored",
        }
    }
}
