//! Message sync scenarios: what a paired device can read back.

#[cfg(test)]
mod tests {
    use crate::harness::{Desktop, FakeBackend, Phone, DEFAULT_DEVICE_LIMIT};
    use link_client::{EnvelopeError, Protection, SyncOutcome};
    use link_core::{LocalMessage, NoThreads};
    use link_types::{Direction, EnvelopeVersion, MessageKey, Platform, ENCRYPTED_PLACEHOLDER};

    fn inbox(bodies: &[&str]) -> Vec<LocalMessage> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, body)| {
                LocalMessage::sms(
                    i as i64 + 1,
                    "+15557654321",
                    1_700_000_000_000 + i as u64,
                    Direction::Received,
                    body,
                )
            })
            .collect()
    }

    async fn paired_pair() -> (FakeBackend, Phone, Desktop) {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        let mut mac = Desktop::new(&backend, "MacBook", Platform::Macos).await;
        phone.pair(&mut mac).await.unwrap();
        mac.receive_keys().await.unwrap();
        (backend, phone, mac)
    }

    // ========================================================================
    // Sealed history
    // ========================================================================

    #[tokio::test]
    async fn paired_device_reads_synced_messages() {
        let (_backend, phone, mac) = paired_pair().await;
        let messages = inbox(&["hello", "running late", "see you"]);

        let report = phone.sync.sync_many(&messages, &NoThreads, |_| {}).await;
        assert_eq!(report.written, 3);
        assert_eq!(report.failed, 0);

        for (i, body) in ["hello", "running late", "see you"].iter().enumerate() {
            let key = MessageKey::new(i as i64 + 1, false);
            let doc = mac.message_doc(&key).unwrap();
            assert_eq!(doc["keyVersion"], u8::from(EnvelopeVersion::V3));
            assert_eq!(mac.read_message(&key).await.unwrap(), *body);
        }
    }

    #[tokio::test]
    async fn stored_body_is_never_plaintext() {
        let (_backend, phone, mac) = paired_pair().await;
        let messages = inbox(&["my one-time code is 123456"]);

        phone.sync.sync_many(&messages, &NoThreads, |_| {}).await;

        let doc = mac.message_doc(&MessageKey::new(1, false)).unwrap();
        let stored = doc.to_string();
        assert!(!stored.contains("123456"));
        assert_eq!(doc["encrypted"], true);
    }

    #[tokio::test]
    async fn device_paired_later_reads_history_without_backfill() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        phone.pairing.ensure_group_key().await.unwrap();

        let messages = inbox(&["before pairing"]);
        let report = phone.sync.sync_many(&messages, &NoThreads, |_| {}).await;
        assert_eq!(report.written, 1);
        let writes_before = phone.transport.writes().len();

        let mut web = Desktop::new(&backend, "Browser", Platform::Web).await;
        phone.pair(&mut web).await.unwrap();
        web.receive_keys().await.unwrap();

        assert_eq!(
            web.read_message(&MessageKey::new(1, false)).await.unwrap(),
            "before pairing"
        );
        // Only the key response was written while pairing.
        assert_eq!(phone.transport.writes().len(), writes_before + 1);
    }

    #[tokio::test]
    async fn unpaired_device_cannot_read() {
        let (backend, phone, _mac) = paired_pair().await;
        let stranger = Desktop::new(&backend, "Stranger", Platform::Windows).await;
        phone
            .sync
            .sync_many(&inbox(&["private"]), &NoThreads, |_| {})
            .await;

        let result = stranger.read_message(&MessageKey::new(1, false)).await;
        assert!(matches!(
            result,
            Err(EnvelopeError::EncryptionUnavailable(_)) | Err(EnvelopeError::DecryptFailed(_))
        ));
    }

    // ========================================================================
    // Without key material
    // ========================================================================

    #[tokio::test]
    async fn no_recipients_redacts_instead_of_leaking() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);

        let outcome = phone
            .sync
            .sync_one(&inbox(&["secret"])[0], &NoThreads, false)
            .await;

        assert!(matches!(
            outcome,
            SyncOutcome::Written {
                protection: Protection::Redacted(_),
                ..
            }
        ));
        let doc = phone
            .transport
            .doc(&format!("users/{}/messages/1", crate::harness::USER))
            .unwrap();
        assert_eq!(doc["body"], ENCRYPTED_PLACEHOLDER);
    }

    #[tokio::test]
    async fn resync_skips_cached_messages() {
        let (_backend, phone, _mac) = paired_pair().await;
        let messages = inbox(&["one", "two"]);

        phone.sync.sync_many(&messages, &NoThreads, |_| {}).await;
        let second = phone.sync.sync_many(&messages, &NoThreads, |_| {}).await;

        assert_eq!(second.written, 0);
        assert_eq!(second.skipped, 2);
    }
}
