use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::format::DateFormat;

/// Explicit per-operation context replacing ambient request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    pub actor_id: i64,
    pub company_id: Option<i64>,
    pub now: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(actor_id: i64, company_id: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            actor_id,
            company_id,
            now,
        }
    }
}

/// Who receives a reminder or expiry notice.
///
/// The numeric encoding matches the values stored in the definitions table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecipientMode {
    #[default]
    None,
    Manager,
    Learner,
    Both,
}

impl RecipientMode {
    /// Decodes the stored integer; unknown values disable notifications.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Manager,
            2 => Self::Learner,
            3 => Self::Both,
            _ => Self::None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Manager => 1,
            Self::Learner => 2,
            Self::Both => 3,
        }
    }

    pub fn includes_learner(self) -> bool {
        matches!(self, Self::Learner | Self::Both)
    }

    pub fn includes_managers(self) -> bool {
        matches!(self, Self::Manager | Self::Both)
    }

    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Which timestamp an issuance's expiry is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    #[default]
    Issue,
    Completion,
}

impl DateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Completion => "completion",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "completion" => Self::Completion,
            _ => Self::Issue,
        }
    }
}

/// Course group handling used when resolving managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    #[default]
    None,
    Separate,
}

impl GroupMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Separate => "separate",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "separate" => Self::Separate,
            _ => Self::None,
        }
    }
}

/// Certificate policy for one course activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateDefinition {
    pub id: i64,
    pub course_id: i64,
    pub name: String,
    #[serde(default)]
    pub expiry_enabled: bool,
    /// `None` when the stored interval could not be parsed.
    pub valid_interval_days: Option<i64>,
    #[serde(default)]
    pub extend_to_month_end: bool,
    #[serde(default)]
    pub reminder_recipients: RecipientMode,
    #[serde(default = "CertificateDefinition::default_lead_days")]
    pub reminder_lead_days: i64,
    #[serde(default)]
    pub expiry_recipients: RecipientMode,
    #[serde(default)]
    pub date_source: DateSource,
    #[serde(default)]
    pub date_format: DateFormat,
    #[serde(default)]
    pub print_code: bool,
    #[serde(default)]
    pub notify_managers_on_issue: bool,
    #[serde(default)]
    pub notify_others: String,
    #[serde(default)]
    pub group_mode: GroupMode,
}

impl CertificateDefinition {
    fn default_lead_days() -> i64 {
        30
    }

    /// Recipient mode configured for the given sweep kind.
    pub fn recipients_for(&self, kind: NotificationKind) -> RecipientMode {
        match kind {
            NotificationKind::Reminder => self.reminder_recipients,
            NotificationKind::Expiry => self.expiry_recipients,
        }
    }

    /// Extra addresses that receive award notices, trimmed and validated.
    pub fn other_recipients(&self) -> Vec<String> {
        self.notify_others
            .split(',')
            .map(str::trim)
            .filter(|value| is_valid_email(value))
            .map(str::to_string)
            .collect()
    }
}

/// Record that a user has received a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateIssuance {
    pub id: i64,
    pub definition_id: i64,
    pub user_id: i64,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CertificateIssuance {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expiry| expiry <= now).unwrap_or(false)
    }
}

/// The two sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Reminder,
    Expiry,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::Expiry => "expiry",
        }
    }

    /// Template sent to the learner.
    pub fn learner_template(self) -> &'static str {
        match self {
            Self::Reminder => "cert_expiry_warn_user",
            Self::Expiry => "cert_expire_user",
        }
    }

    /// Template sent to each course manager.
    pub fn manager_template(self) -> &'static str {
        match self {
            Self::Reminder => "cert_expiry_warn_manager",
            Self::Expiry => "cert_expire_manager",
        }
    }
}

/// Award notice templates sent when a certificate is first issued.
pub const AWARD_MANAGER_TEMPLATE: &str = "certificate_awarded_manager";
pub const AWARD_OTHER_TEMPLATE: &str = "certificate_awarded_other";

/// Minimal user record used for notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl UserProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "full_name": self.full_name(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
}

/// Cheap structural address check; delivery does the real validation.
pub fn is_valid_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !value.chars().any(|c| c.is_whitespace() || c == ',')
        && !domain.contains('@')
}
