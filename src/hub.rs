use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, Mutex};

use crate::{
    config::SfuConfig,
    error::{Error, StateErrorKind},
    room::Room,
    transport::BandwidthEstimatorRegistry,
};

/// Hub owns every room of the node and the bandwidth estimates of their sessions.
#[derive(Debug)]
pub struct Hub {
    pub rooms: HashMap<String, Arc<Mutex<Room>>>,
    config: SfuConfig,
    estimators: Arc<BandwidthEstimatorRegistry>,
    hub_event_sender: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    pub fn new(config: SfuConfig) -> Arc<Mutex<Self>> {
        let (tx, rx) = mpsc::unbounded_channel::<HubEvent>();
        let hub = Arc::new(Mutex::new(Self {
            rooms: HashMap::new(),
            config,
            estimators: BandwidthEstimatorRegistry::new(),
            hub_event_sender: tx,
        }));

        {
            let hub = Arc::downgrade(&hub);
            tokio::spawn(async move {
                Self::hub_event_loop(hub, rx).await;
            });
        }

        hub
    }

    /// Creates a new room and adds it to the hub.
    pub fn new_room(&mut self) -> Arc<Mutex<Room>> {
        let (room, id) = Room::new(
            self.config.clone(),
            Arc::clone(&self.estimators),
            self.hub_event_sender.clone(),
        );
        self.rooms.insert(id, Arc::clone(&room));
        room
    }

    pub fn get_room(&self, room_id: &str) -> Result<Arc<Mutex<Room>>, Error> {
        self.rooms.get(room_id).cloned().ok_or_else(|| {
            Error::new_state(
                format!("room {} does not exist", room_id),
                StateErrorKind::RoomNotFound,
            )
        })
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Where transports report downlink estimates, keyed by client ID.
    pub fn estimators(&self) -> Arc<BandwidthEstimatorRegistry> {
        Arc::clone(&self.estimators)
    }

    /// Closes every room. Rooms leave the table as their event loops finish.
    pub async fn close(&self) {
        for room in self.rooms.values() {
            room.lock().await.close().await;
        }
    }

    async fn hub_event_loop(
        hub: std::sync::Weak<Mutex<Hub>>,
        mut event_receiver: mpsc::UnboundedReceiver<HubEvent>,
    ) {
        while let Some(event) = event_receiver.recv().await {
            let Some(hub) = hub.upgrade() else {
                break;
            };
            match event {
                HubEvent::RoomRemoved(room_id) => {
                    let mut guard = hub.lock().await;
                    guard.rooms.remove(&room_id);
                    tracing::debug!("Room {} is removed from hub", room_id);
                }
            }
        }
        tracing::debug!("Hub event loop finished");
    }
}

#[derive(Debug)]
pub enum HubEvent {
    RoomRemoved(String),
}
