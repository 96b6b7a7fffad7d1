//! In-memory stack store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stackd_id::StackId;

use super::{StackStore, StoreError};
use crate::stack::{Stack, StackStatus, StatusCounts};

/// Stack records held in a single locked map.
///
/// Every operation runs under one lock, so the uniqueness checks and the
/// compare-and-set transition are atomic, matching the partial unique
/// indexes of the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStackStore {
    stacks: Mutex<BTreeMap<StackId, Stack>>,
}

impl MemoryStackStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<StackId, Stack>> {
        self.stacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sorted(mut stacks: Vec<Stack>) -> Vec<Stack> {
        stacks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        stacks
    }
}

#[async_trait]
impl StackStore for MemoryStackStore {
    async fn insert(&self, stack: &Stack) -> Result<(), StoreError> {
        let mut stacks = self.lock();

        if stack.is_active() {
            for existing in stacks.values().filter(|s| s.is_active()) {
                if existing.user_id == stack.user_id && existing.problem_id == stack.problem_id {
                    return Err(StoreError::DuplicateActiveStack);
                }
                if existing.node_port == stack.node_port {
                    return Err(StoreError::NodePortTaken(stack.node_port));
                }
            }
        }

        stacks.insert(stack.id, stack.clone());
        Ok(())
    }

    async fn get(&self, id: StackId) -> Result<Option<Stack>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Stack>, StoreError> {
        let stacks = self
            .lock()
            .values()
            .filter(|s| s.status != StackStatus::Deleted)
            .cloned()
            .collect();
        Ok(Self::sorted(stacks))
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Stack>, StoreError> {
        let stacks = self
            .lock()
            .values()
            .filter(|s| s.user_id == user_id && s.status != StackStatus::Deleted)
            .cloned()
            .collect();
        Ok(Self::sorted(stacks))
    }

    async fn list_active(&self) -> Result<Vec<Stack>, StoreError> {
        let stacks = self
            .lock()
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        Ok(Self::sorted(stacks))
    }

    async fn find_active(&self, user_id: i64, problem_id: i64) -> Result<Option<Stack>, StoreError> {
        Ok(self
            .lock()
            .values()
            .find(|s| s.is_active() && s.user_id == user_id && s.problem_id == problem_id)
            .cloned())
    }

    async fn count_active_for_user(&self, user_id: i64) -> Result<u32, StoreError> {
        let count = self
            .lock()
            .values()
            .filter(|s| s.is_active() && s.user_id == user_id)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn transition(
        &self,
        id: StackId,
        from: &[StackStatus],
        to: StackStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Stack>, StoreError> {
        let mut stacks = self.lock();
        match stacks.get_mut(&id) {
            Some(stack) if from.contains(&stack.status) => {
                stack.status = to;
                stack.updated_at = at;
                Ok(Some(stack.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_reconciled(&self, ids: &[StackId], at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut stacks = self.lock();
        let mut updated = 0;
        for id in ids {
            if let Some(stack) = stacks.get_mut(id) {
                stack.last_reconciled_at = Some(at);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for stack in self.lock().values() {
            counts.add(stack.status, 1);
        }
        Ok(counts)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut stacks = self.lock();
        let before = stacks.len();
        stacks.retain(|_, s| !(s.status.is_terminal() && s.updated_at < older_than));
        Ok((before - stacks.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
