//! Gateways to the battle engine and to the secondary battle mirror.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    dao::storage::{StorageError, StorageResult},
    dto::team::Team,
};

/// One side of a battle as handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Combatant {
    pub user_id: String,
    pub name: String,
    pub team: Team,
}

/// Everything the engine needs to open a battle for a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleRequest {
    pub room_id: String,
    pub host: Combatant,
    pub guest: Combatant,
}

#[derive(Debug, Error)]
pub enum BattleServiceError {
    /// The engine refused the request.
    #[error("battle service rejected the request: {0}")]
    Rejected(String),
    #[error("battle service unavailable")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Battle engine entry point; returns an opaque battle identifier.
pub trait BattleService: Send + Sync {
    fn create_battle(
        &self,
        request: BattleRequest,
    ) -> BoxFuture<'static, Result<String, BattleServiceError>>;
}

/// Secondary store the battle runtime reads its initial state from.
pub trait BattleMirror: Send + Sync {
    fn hydrate(
        &self,
        battle_id: &str,
        request: &BattleRequest,
    ) -> BoxFuture<'static, StorageResult<()>>;
}

#[derive(Default)]
struct BattleRegistry {
    battles: DashMap<String, BattleRequest>,
    rejections: AtomicUsize,
}

/// Engine stand-in that records every battle it opens.
#[derive(Clone, Default)]
pub struct InMemoryBattleService {
    registry: Arc<BattleRegistry>,
    latency: Duration,
}

impl InMemoryBattleService {
    /// Service that answers immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every creation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reject the next `count` creation requests.
    pub fn reject_next(&self, count: usize) {
        self.registry.rejections.store(count, Ordering::SeqCst);
    }

    /// Number of battles opened so far.
    pub fn created(&self) -> usize {
        self.registry.battles.len()
    }

    /// Request a battle was created from.
    pub fn battle(&self, battle_id: &str) -> Option<BattleRequest> {
        self.registry
            .battles
            .get(battle_id)
            .map(|entry| entry.value().clone())
    }
}

impl BattleService for InMemoryBattleService {
    fn create_battle(
        &self,
        request: BattleRequest,
    ) -> BoxFuture<'static, Result<String, BattleServiceError>> {
        let registry = self.registry.clone();
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let rejected = registry
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                return Err(BattleServiceError::Rejected(format!(
                    "no capacity for room `{}`",
                    request.room_id
                )));
            }

            let battle_id = Uuid::new_v4().to_string();
            registry.battles.insert(battle_id.clone(), request);
            Ok(battle_id)
        })
    }
}

/// Mirror stand-in keeping serialized battle seeds in memory.
#[derive(Clone, Default)]
pub struct InMemoryBattleMirror {
    seeds: Arc<DashMap<String, serde_json::Value>>,
}

impl InMemoryBattleMirror {
    /// Empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `battle_id` was hydrated.
    pub fn contains(&self, battle_id: &str) -> bool {
        self.seeds.contains_key(battle_id)
    }
}

impl BattleMirror for InMemoryBattleMirror {
    fn hydrate(
        &self,
        battle_id: &str,
        request: &BattleRequest,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let seed = serde_json::to_value(request).map_err(|err| {
            StorageError::unavailable(format!("cannot encode battle `{battle_id}`"), err)
        });
        let seeds = self.seeds.clone();
        let battle_id = battle_id.to_string();
        Box::pin(async move {
            seeds.insert(battle_id, seed?);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::team::tests::{rival_team, starter_team};

    fn request() -> BattleRequest {
        BattleRequest {
            room_id: "r1".into(),
            host: Combatant {
                user_id: "h".into(),
                name: "Red".into(),
                team: starter_team("t1"),
            },
            guest: Combatant {
                user_id: "g".into(),
                name: "Blue".into(),
                team: rival_team("t2"),
            },
        }
    }

    #[tokio::test]
    async fn creates_unique_battles() {
        let service = InMemoryBattleService::new();
        let a = service.create_battle(request()).await.unwrap();
        let b = service.create_battle(request()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(service.created(), 2);
        assert_eq!(service.battle(&a).unwrap().room_id, "r1");
    }

    #[tokio::test]
    async fn rejection_is_one_shot() {
        let service = InMemoryBattleService::new();
        service.reject_next(1);
        assert!(matches!(
            service.create_battle(request()).await,
            Err(BattleServiceError::Rejected(_))
        ));
        assert!(service.create_battle(request()).await.is_ok());
    }

    #[tokio::test]
    async fn mirror_stores_seed() {
        let mirror = InMemoryBattleMirror::new();
        mirror.hydrate("b1", &request()).await.unwrap();
        assert!(mirror.contains("b1"));
    }
}
