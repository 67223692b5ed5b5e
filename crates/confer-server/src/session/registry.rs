//! Room registry
//!
//! Maps room names to rooms. Listing follows insertion order.

use super::Room;
use crate::engine::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct RoomTable {
    rooms: HashMap<String, Arc<Room>>,
    order: Vec<String>,
}

/// Registry of every room known to the server
#[derive(Default)]
pub struct SessionRegistry {
    table: RwLock<RoomTable>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to an empty registry
    pub async fn initialize(&self) {
        let mut table = self.table.write().await;
        table.rooms.clear();
        table.order.clear();
    }

    /// Insert `room` under `name`, overwriting any room of the same name.
    /// An overwritten name keeps its listing position.
    pub async fn add_room(&self, room: Arc<Room>, name: &str) {
        let mut table = self.table.write().await;
        if table.rooms.insert(name.to_string(), room).is_none() {
            table.order.push(name.to_string());
        }
        tracing::info!("Registered room {}", name);
    }

    pub async fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.table.read().await.rooms.get(name).cloned()
    }

    pub async fn delete_room(&self, name: &str) -> Option<Arc<Room>> {
        let mut table = self.table.write().await;
        let removed = table.rooms.remove(name)?;
        table.order.retain(|n| n != name);
        tracing::info!("Deleted room {}", name);
        Some(removed)
    }

    pub async fn list_room_names(&self) -> Vec<String> {
        self.table.read().await.order.clone()
    }

    pub async fn list_rooms(&self) -> Vec<Arc<Room>> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|name| table.rooms.get(name).cloned())
            .collect()
    }

    /// Look up `name`, creating the room on `router` if it does not exist.
    /// The flag is true when this call created it.
    pub async fn get_or_create_room(
        &self,
        name: &str,
        description: Option<String>,
        router: Arc<dyn Router>,
    ) -> (Arc<Room>, bool) {
        let mut table = self.table.write().await;

        if let Some(room) = table.rooms.get(name) {
            return (room.clone(), false);
        }

        let room = Arc::new(Room::new(name, description, router));
        table.rooms.insert(name.to_string(), room.clone());
        table.order.push(name.to_string());
        tracing::info!("Created new room {}", name);

        (room, true)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rooms.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::{LocalWorker, WorkerSettings};
    use crate::engine::ortc;

    fn test_router() -> Arc<dyn Router> {
        let worker = LocalWorker::new(&WorkerSettings {
            rtc_min_port: 30000,
            rtc_max_port: 30100,
        })
        .unwrap();
        worker.create_router(&ortc::default_media_codecs()).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_of_unknown_room_is_absent() {
        let registry = SessionRegistry::new();
        assert!(registry.get_room("nowhere").await.is_none());
        assert!(registry.delete_room("nowhere").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_names_listed_in_insertion_order() {
        let registry = SessionRegistry::new();
        let router = test_router();

        for name in ["zeta", "alpha", "mid"] {
            registry
                .add_room(Arc::new(Room::new(name, None, router.clone())), name)
                .await;
        }

        assert_eq!(registry.list_room_names().await, vec!["zeta", "alpha", "mid"]);

        // Overwriting keeps the original position
        let replacement = Arc::new(Room::new("alpha", Some("new".to_string()), router.clone()));
        registry.add_room(replacement, "alpha").await;
        assert_eq!(registry.list_room_names().await, vec!["zeta", "alpha", "mid"]);
        let alpha = registry.get_room("alpha").await.unwrap();
        assert_eq!(alpha.description().await, "new");

        registry.delete_room("zeta").await;
        let names: Vec<String> = registry
            .list_rooms()
            .await
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "mid"]);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let registry = SessionRegistry::new();
        let router = test_router();

        let (first, created) = registry
            .get_or_create_room("lobby", Some("Main lobby".to_string()), router.clone())
            .await;
        assert!(created);

        let (second, created) = registry
            .get_or_create_room("lobby", Some("ignored".to_string()), router.clone())
            .await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.description().await, "Main lobby");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_initialize_clears_rooms() {
        let registry = SessionRegistry::new();
        registry.get_or_create_room("a", None, test_router()).await;
        registry.initialize().await;

        assert!(registry.list_room_names().await.is_empty());
        assert!(registry.get_room("a").await.is_none());
    }
}
