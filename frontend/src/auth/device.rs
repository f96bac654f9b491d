use uuid::Uuid;

use crate::utils::storage::{Storage, DEVICE_ID_KEY};

/// The device id, if one has been minted. Never creates one.
pub fn device_id(storage: &dyn Storage) -> Option<String> {
    storage
        .get_item(DEVICE_ID_KEY)
        .filter(|id| !id.trim().is_empty())
}

/// Returns the device id, minting and persisting one on first use. Only
/// called on the login path, so anonymous probes never create an identity.
pub fn ensure_device_id(storage: &dyn Storage) -> String {
    if let Some(existing) = device_id(storage) {
        return existing;
    }
    let id = Uuid::new_v4().to_string();
    storage.set_item(DEVICE_ID_KEY, &id);
    log::debug!("Minted device id {}", id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::storage::MemoryStorage;

    #[test]
    fn device_id_is_minted_lazily_and_reused() {
        let storage = MemoryStorage::new();
        assert!(device_id(&storage).is_none());

        let minted = ensure_device_id(&storage);
        assert_eq!(device_id(&storage).as_deref(), Some(minted.as_str()));
        assert_eq!(ensure_device_id(&storage), minted);
    }

    #[test]
    fn blank_device_id_is_replaced() {
        let storage = MemoryStorage::new();
        storage.set_item(DEVICE_ID_KEY, "  ");
        assert!(device_id(&storage).is_none());
        assert!(!ensure_device_id(&storage).trim().is_empty());
    }
}
