//! Fixtures shared by the app crate's tests.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use certwatch_core::{
    types::{CertificateDefinition, DateSource, GroupMode, RecipientMode},
    DateFormat,
};
use certwatch_mailer::{DeliveryReceipt, MailerError};
use certwatch_storage::Database;

use crate::delivery::{DeliveryError, TemplateDelivery};

pub fn at(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub fn fixed_clock(now: DateTime<Utc>) -> Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> {
    Arc::new(move || now)
}

pub async fn execute_all(db: &Database, statements: &[&str]) {
    for statement in statements {
        sqlx::query(statement)
            .execute(db.pool())
            .await
            .unwrap_or_else(|err| panic!("seed statement failed: {err}\n{statement}"));
    }
}

/// Learner 1 completed course 10; user 2 manages the course. Both belong to
/// company 100. Definition 50 issues certificates for the course.
pub async fn setup_db() -> Database {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("connect");
    db.run_migrations().await.expect("migrations");
    execute_all(
        &db,
        &[
            "INSERT INTO users (id, username, email, first_name, last_name) VALUES \
             (1, 'learner', 'learner@example.com', 'Lea', 'Rner'), \
             (2, 'manager', 'manager@example.com', 'Man', 'Ager')",
            "INSERT INTO courses (id, full_name) VALUES (10, 'Working at height')",
            "INSERT INTO companies (id, name) VALUES (100, 'Acme')",
            "INSERT INTO departments (id, company_id, name) VALUES (1000, 100, 'Top')",
            "INSERT INTO company_users (user_id, company_id, department_id) VALUES \
             (1, 100, 1000), (2, 100, 1000)",
            "INSERT INTO course_completions (user_id, course_id, completed_at) VALUES \
             (1, 10, '2023-05-10T00:00:00.000Z')",
            "INSERT INTO course_managers (course_id, user_id) VALUES (10, 2)",
        ],
    )
    .await;
    db.definitions()
        .upsert(&definition(), at("2023-01-01T00:00:00Z"))
        .await
        .expect("definition");
    db
}

pub fn definition() -> CertificateDefinition {
    CertificateDefinition {
        id: 50,
        course_id: 10,
        name: "Harness safety".into(),
        expiry_enabled: true,
        valid_interval_days: Some(365),
        extend_to_month_end: false,
        reminder_recipients: RecipientMode::Both,
        reminder_lead_days: 7,
        expiry_recipients: RecipientMode::Both,
        date_source: DateSource::Issue,
        date_format: DateFormat::DayMonthYear,
        print_code: true,
        notify_managers_on_issue: false,
        notify_others: String::new(),
        group_mode: GroupMode::None,
    }
}

/// Adds an active learner with a completion and company membership.
pub async fn add_learner(db: &Database, id: i64, email: &str) {
    let statements = [
        format!(
            "INSERT INTO users (id, username, email, first_name, last_name) \
             VALUES ({id}, 'learner{id}', '{email}', 'Learner', '{id}')"
        ),
        format!(
            "INSERT INTO company_users (user_id, company_id, department_id) VALUES ({id}, 100, 1000)"
        ),
        format!(
            "INSERT INTO course_completions (user_id, course_id, completed_at) \
             VALUES ({id}, 10, '2023-05-10T00:00:00.000Z')"
        ),
    ];
    let refs: Vec<&str> = statements.iter().map(String::as_str).collect();
    execute_all(db, &refs).await;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub template: String,
    pub to: String,
    pub context: Value,
}

/// In-memory delivery that records messages and rejects chosen addresses.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<String>>,
    counter: AtomicUsize,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, address: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(address.to_string());
    }

    pub fn recover(&self, address: &str) {
        self.failing.lock().expect("failing lock").remove(address);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.to == address)
            .collect()
    }
}

#[async_trait]
impl TemplateDelivery for RecordingDelivery {
    async fn send(
        &self,
        template: &str,
        to: &str,
        context: Value,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if self.failing.lock().expect("failing lock").contains(to) {
            return Err(DeliveryError::Mailer(MailerError::Status {
                status: reqwest::StatusCode::UNPROCESSABLE_ENTITY,
                body: format!("recipient {to} rejected"),
            }));
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().expect("sent lock").push(SentMessage {
            template: template.to_string(),
            to: to.to_string(),
            context,
        });
        Ok(DeliveryReceipt {
            delivery_id: format!("d-{id}"),
        })
    }
}
