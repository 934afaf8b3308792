use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::characteristic::CharacteristicInfo;

/// One service in the graph captured from discovery.
///
/// The sequence of characteristics preserves on-device order. A
/// `ServiceInfo` is immutable once captured for a connection and the whole
/// graph is rebuilt fresh on every new connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Finds the first characteristic with the given uuid, if discovered.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Finds a characteristic anywhere in a captured service graph.
pub fn find_characteristic(services: &[ServiceInfo], service_uuid: Uuid,
                           characteristic_uuid: Uuid)
                           -> Option<&CharacteristicInfo> {
    services.iter()
            .find(|s| s.uuid == service_uuid)
            .and_then(|s| s.characteristic(characteristic_uuid))
}
