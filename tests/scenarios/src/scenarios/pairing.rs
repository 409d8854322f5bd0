//! Pairing and key distribution scenarios.

#[cfg(test)]
mod tests {
    use crate::harness::{Desktop, FakeBackend, Phone, DEFAULT_DEVICE_LIMIT};
    use link_client::{KeyStore, PairingError, Shutdown, TransportError};
    use link_core::UsageCheck;
    use link_types::Platform;
    use std::time::Duration;

    // ========================================================================
    // Approval and key push
    // ========================================================================

    #[tokio::test]
    async fn approved_device_receives_group_key() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;

        let id = phone.pair(&mut mac).await.unwrap();
        let installed = mac.receive_keys().await.unwrap();

        let group = phone.keys.group_key().await.unwrap().unwrap();
        assert_eq!(installed.id, group.id);
        assert_eq!(installed.keypair.public_key(), group.keypair.public_key());
        assert_eq!(backend.devices().len(), 1);
        assert_eq!(backend.devices()[0].0, id.as_str());
    }

    #[tokio::test]
    async fn every_device_gets_the_same_group_key() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;
        let mut web = Desktop::new(&backend, "Browser", Platform::Web).await;

        phone.pair(&mut mac).await.unwrap();
        phone.pair(&mut web).await.unwrap();

        let a = mac.receive_keys().await.unwrap();
        let b = web.receive_keys().await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.keypair.public_key(), b.keypair.public_key());
    }

    #[tokio::test]
    async fn device_limit_blocks_pairing() {
        let backend = FakeBackend::new(1);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;
        let mut win = Desktop::new(&backend, "Work PC", Platform::Windows).await;

        phone.pair(&mut mac).await.unwrap();
        let err = phone.pair(&mut win).await.unwrap_err();

        assert!(matches!(
            err,
            PairingError::DeviceLimitReached {
                current: 1,
                limit: 1
            }
        ));
        assert_eq!(backend.devices().len(), 1);
        assert!(win.receive_keys().await.is_err());
    }

    #[tokio::test]
    async fn usage_reflects_paired_devices() {
        let backend = FakeBackend::new(2);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;

        assert_eq!(
            phone.pairing.device_usage().await.unwrap(),
            UsageCheck::WithinLimit {
                current: 0,
                limit: 2
            }
        );
        phone.pair(&mut mac).await.unwrap();
        assert_eq!(
            phone.pairing.device_usage().await.unwrap(),
            UsageCheck::WithinLimit {
                current: 1,
                limit: 2
            }
        );

        let devices = phone.pairing.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].display_name, "MacBook");
    }

    // ========================================================================
    // Legacy pull
    // ========================================================================

    #[tokio::test]
    async fn failed_push_recovers_through_key_request() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;

        phone
            .transport
            .fail_next_write(TransportError::remote("unavailable", "push lost"));
        phone.pair(&mut mac).await.unwrap();
        assert!(matches!(
            mac.receive_keys().await,
            Err(PairingError::NoKeyResponse)
        ));

        let shutdown = Shutdown::new();
        let listener = {
            let pairing = phone.pairing.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pairing.run_key_request_listener(shutdown).await })
        };

        mac.request_keys().await.unwrap();
        let mut installed = None;
        for _ in 0..50 {
            if let Ok(key) = mac.receive_keys().await {
                installed = Some(key);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.trigger();
        listener.await.unwrap().unwrap();

        let group = phone.keys.group_key().await.unwrap().unwrap();
        assert_eq!(installed.unwrap().id, group.id);
    }

    #[tokio::test]
    async fn rescanning_an_approved_code_is_refused() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;

        phone.pair(&mut mac).await.unwrap();
        let again = phone.pair(&mut mac).await;

        assert!(matches!(again, Err(PairingError::Session(_))));
        assert_eq!(backend.devices().len(), 1);
    }
}
