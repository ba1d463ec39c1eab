use std::collections::HashSet;

use async_trait::async_trait;

use certwatch_core::types::{GroupMode, UserProfile};
use certwatch_storage::{Database, StorageError};

/// Resolves the course managers that should hear about a learner.
#[async_trait]
pub trait ManagerDirectory: Send + Sync {
    async fn managers_for(
        &self,
        course_id: i64,
        learner_id: i64,
        group_mode: GroupMode,
    ) -> Result<Vec<UserProfile>, StorageError>;
}

/// Manager resolution backed by the course role and group tables.
#[derive(Clone)]
pub struct SqliteManagerDirectory {
    database: Database,
}

impl SqliteManagerDirectory {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl ManagerDirectory for SqliteManagerDirectory {
    async fn managers_for(
        &self,
        course_id: i64,
        learner_id: i64,
        group_mode: GroupMode,
    ) -> Result<Vec<UserProfile>, StorageError> {
        let directory = self.database.directory();
        let managers: Vec<UserProfile> = directory
            .course_managers(course_id)
            .await?
            .into_iter()
            .filter(|manager| manager.id != learner_id)
            .collect();

        if group_mode == GroupMode::None {
            return Ok(managers);
        }

        let learner_groups: HashSet<i64> = directory
            .course_groups_of(learner_id, course_id)
            .await?
            .into_iter()
            .collect();

        let mut visible = Vec::with_capacity(managers.len());
        for manager in managers {
            let manager_groups = directory.course_groups_of(manager.id, course_id).await?;
            // Ungrouped learners are handled by ungrouped managers.
            let shares_group = if learner_groups.is_empty() {
                manager_groups.is_empty()
            } else {
                manager_groups.iter().any(|group| learner_groups.contains(group))
            };
            if shares_group {
                visible.push(manager);
            }
        }
        Ok(visible)
    }
}
