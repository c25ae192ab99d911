// In-memory task repository for embedded setups and tests

use super::TaskRepository;
use crate::errors::DatabaseError;
use crate::models::ScheduleTask;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Task repository holding rows in a process-local map
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<Uuid, ScheduleTask>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

fn sorted(mut tasks: Vec<ScheduleTask>) -> Vec<ScheduleTask> {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    tasks
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &ScheduleTask) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(DatabaseError::DuplicateKey(task.id.to_string()));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update(&self, task: &ScheduleTask) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(task.id.to_string())),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn find_by_uuid(&self, id: Uuid) -> Result<Option<ScheduleTask>, DatabaseError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn find_by_source(
        &self,
        source_module: &str,
        source_entity_id: &str,
    ) -> Result<Vec<ScheduleTask>, DatabaseError> {
        let tasks = self.tasks.read().await;
        Ok(sorted(
            tasks
                .values()
                .filter(|task| task.belongs_to(source_module, source_entity_id))
                .cloned()
                .collect(),
        ))
    }

    async fn find_all_enabled(&self) -> Result<Vec<ScheduleTask>, DatabaseError> {
        let tasks = self.tasks.read().await;
        Ok(sorted(
            tasks.values().filter(|task| task.enabled).cloned().collect(),
        ))
    }

    async fn find_all(&self) -> Result<Vec<ScheduleTask>, DatabaseError> {
        Ok(sorted(self.tasks.read().await.values().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewScheduleTask;
    use chrono::Utc;

    fn task(name: &str) -> ScheduleTask {
        ScheduleTask::new(NewScheduleTask::new(name, "0 9 * * *"), Utc::now())
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let repo = InMemoryTaskRepository::new();
        let task = task("a");
        repo.save(&task).await.unwrap();
        assert_eq!(repo.find_by_uuid(task.id).await.unwrap(), Some(task.clone()));
        assert!(matches!(
            repo.save(&task).await,
            Err(DatabaseError::DuplicateKey(_))
        ));
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let repo = InMemoryTaskRepository::new();
        assert!(matches!(
            repo.update(&task("ghost")).await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_find_by_source_and_enabled() {
        let repo = InMemoryTaskRepository::new();
        let mut linked = task("linked");
        linked.source_module = Some("reminder".to_string());
        linked.source_entity_id = Some("tmpl-1".to_string());
        let mut disabled = task("disabled");
        disabled.enabled = false;
        repo.save(&linked).await.unwrap();
        repo.save(&disabled).await.unwrap();

        let found = repo.find_by_source("reminder", "tmpl-1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, linked.id);
        assert!(repo.find_by_source("goal", "tmpl-1").await.unwrap().is_empty());

        let enabled = repo.find_all_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(repo.find_all().await.unwrap().len(), 2);

        assert!(repo.delete(linked.id).await.unwrap());
        assert!(!repo.delete(linked.id).await.unwrap());
        assert_eq!(repo.len().await, 1);
    }
}
