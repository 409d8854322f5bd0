//! Messages composed on a paired device and sent by the phone.

#[cfg(test)]
mod tests {
    use crate::harness::{Desktop, FakeBackend, Phone, DEFAULT_DEVICE_LIMIT, USER};
    use async_trait::async_trait;
    use link_client::envelope::seal;
    use link_client::{MessageSender, OutgoingListener, Recipients, Shutdown};
    use link_types::{now_millis, OutgoingMessage, Platform};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Radio {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageSender for Radio {
        async fn send(&self, address: &str, body: &str) -> Result<(), String> {
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), body.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn sealed_message_from_device_is_sent_once() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;
        phone.pair(&mut mac).await.unwrap();
        let group = mac.receive_keys().await.unwrap();

        let radio = Arc::new(Radio::default());
        let listener = Arc::new(OutgoingListener::new(
            Arc::new(phone.transport.clone()),
            Arc::new(phone.keys.clone()),
            None,
            radio.clone(),
        ));
        let shutdown = Shutdown::new();
        let task = {
            let listener = listener.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(shutdown).await })
        };

        let mut message = OutgoingMessage {
            address: "+15557654321".into(),
            body: String::new(),
            timestamp: now_millis(),
            encrypted: false,
            nonce: None,
            key_map: None,
            e2ee_envelope: None,
            key_version: None,
        };
        seal(
            b"on my way",
            &Recipients::group(group.id.clone(), group.keypair.public_key()),
        )
        .unwrap()
        .apply_to_outgoing(&mut message);
        let path = format!("users/{}/outgoing_messages/out-1", USER);
        backend
            .transport()
            .seed(&path, serde_json::to_value(&message).unwrap());

        for _ in 0..50 {
            if backend.transport().doc(&path).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.trigger();
        task.await.unwrap().unwrap();

        let sent = radio.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![("+15557654321".to_string(), "on my way".to_string())]
        );
        assert!(backend.transport().doc(&path).is_none());
    }
}
