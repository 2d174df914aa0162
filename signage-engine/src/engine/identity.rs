//! Persisted device identity.

use crate::Result;
use crate::config::EngineConfig;
use crate::database::repositories::device_state::{DeviceStateRepository, keys};
use crate::transport::DeviceIdentity;

/// Read the identity from device state, seeding missing keys from `config` first.
///
/// Seeding only fills gaps, so credentials received at runtime win over the
/// environment.
pub async fn load_identity(
    config: &EngineConfig,
    state: &dyn DeviceStateRepository,
) -> Result<DeviceIdentity> {
    let seeds = [
        (keys::DEVICE_TOKEN, &config.device_token),
        (keys::DEVICE_ID, &config.device_id),
        (keys::SCREEN_ID, &config.screen_id),
    ];
    for (key, seed) in seeds {
        if let Some(value) = seed
            && state.get(key).await?.is_none()
        {
            state.set(key, value).await?;
        }
    }

    Ok(DeviceIdentity {
        api_base_url: state
            .get(keys::API_BASE_URL)
            .await?
            .unwrap_or_else(|| config.api_base_url.clone()),
        device_token: state.get(keys::DEVICE_TOKEN).await?,
        device_id: state.get(keys::DEVICE_ID).await?,
        screen_id: state.get(keys::SCREEN_ID).await?,
    })
}

/// Persist credentials handed over by pairing.
pub async fn store_identity(
    state: &dyn DeviceStateRepository,
    identity: &DeviceIdentity,
) -> Result<()> {
    let fields = [
        (keys::DEVICE_TOKEN, &identity.device_token),
        (keys::DEVICE_ID, &identity.device_id),
        (keys::SCREEN_ID, &identity.screen_id),
    ];
    for (key, value) in fields {
        match value {
            Some(value) => state.set(key, value).await?,
            None => state.delete(key).await?,
        }
    }
    state.set(keys::API_BASE_URL, &identity.api_base_url).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::MemoryDeviceState;

    #[tokio::test]
    async fn test_env_seeds_only_missing_keys() {
        let state = MemoryDeviceState::default();
        state.set(keys::DEVICE_TOKEN, "persisted").await.unwrap();

        let mut config = EngineConfig::default();
        config.device_token = Some("from-env".into());
        config.screen_id = Some("screen-1".into());

        let identity = load_identity(&config, &state).await.unwrap();
        assert_eq!(identity.device_token.as_deref(), Some("persisted"));
        assert_eq!(identity.screen_id.as_deref(), Some("screen-1"));
        assert_eq!(identity.device_id, None);
        assert_eq!(identity.api_base_url, config.api_base_url);
        assert!(identity.is_paired());
    }

    #[tokio::test]
    async fn test_store_identity_round_trip() {
        let state = MemoryDeviceState::default();
        state.set(keys::DEVICE_ID, "stale").await.unwrap();
        let identity = DeviceIdentity {
            api_base_url: "https://signage.example.com".into(),
            device_token: Some("tok".into()),
            device_id: None,
            screen_id: Some("s".into()),
        };
        store_identity(&state, &identity).await.unwrap();

        let loaded = load_identity(&EngineConfig::default(), &state).await.unwrap();
        assert_eq!(loaded, identity);
    }
}
