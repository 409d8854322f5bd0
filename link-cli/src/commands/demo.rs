//! Run pairing and message sync against the in-memory backend.
//!
//! The phone approves a desktop's QR code, pushes the sync-group key, syncs
//! a few SMS, and the desktop reads them back with the key it received.

use anyhow::{Context, Result};
use link_client::pairing::COMPLETE_PAIRING;
use link_client::{
    load_keyring, open_document, receive_key_bundle, ApprovalResult, Config, KeyPair, KeyStore,
    MemoryKeyStore, MessageSyncEngine, MockTransport, MockUploader, PairingCoordinator,
    SyncCaches, SyncOptions,
};
use link_core::{LocalMessage, NoThreads, PairingQrPayload};
use link_types::{now_millis, Device, DeviceId, Direction, MessageKey, Platform};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEMO_USER: &str = "demo-user";
const DEMO_TOKEN: &str = "demo-token";
const DEMO_DEVICE: &str = "macos-1";

/// What the demo observed.
#[derive(Debug)]
pub struct DemoReport {
    /// Id the backend assigned to the desktop.
    pub device_id: DeviceId,
    /// Records written by the phone.
    pub written: usize,
    /// Bodies the desktop decrypted, in order.
    pub decrypted: Vec<String>,
}

fn install_backend(transport: &MockTransport, desktop: &KeyPair) {
    let store = transport.clone();
    let public_key = desktop.public_key();
    transport.on_call(COMPLETE_PAIRING, move |args| {
        if args["token"] != DEMO_TOKEN {
            return Ok(json!({"status": "error", "reason": "token_unknown"}));
        }
        let device = Device {
            id: DeviceId::new(DEMO_DEVICE),
            display_name: "Demo MacBook".into(),
            platform: Platform::Macos,
            public_key: Some(public_key),
            last_seen: now_millis(),
        };
        let doc = serde_json::to_value(&device)?;
        store.seed(&format!("users/{}/devices/{}", DEMO_USER, DEMO_DEVICE), doc);
        Ok(json!({"status": "approved", "deviceId": DEMO_DEVICE, "userId": DEMO_USER}))
    });
}

fn sample_messages(count: usize) -> Vec<LocalMessage> {
    let base = now_millis();
    (0..count)
        .map(|i| {
            LocalMessage::sms(
                i as i64 + 1,
                "+15557654321",
                base + i as u64,
                Direction::Received,
                &format!("demo message {}", i + 1),
            )
        })
        .collect()
}

/// Run the scenario and report what happened.
pub async fn scenario(count: usize) -> Result<DemoReport> {
    let transport = MockTransport::signed_in(DEMO_USER);
    let phone_keys = MemoryKeyStore::new();
    let caches = Arc::new(SyncCaches::new());
    let config = Config::default();

    // Desktop side: a fresh keypair shown in its QR code.
    let desktop_key = KeyPair::generate();
    let desktop_keys = MemoryKeyStore::new();
    desktop_keys.set_device_key(desktop_key.clone()).await?;
    install_backend(&transport, &desktop_key);

    let qr = PairingQrPayload {
        token: DEMO_TOKEN.into(),
        name: "Demo MacBook".into(),
        platform: Platform::Macos,
        version: link_core::pairing::QR_PAYLOAD_VERSION,
        public_key: desktop_key.public_key(),
        sync_group_id: None,
    }
    .to_json()?;

    // Phone side: scan, approve, push the key bundle.
    let pairing = PairingCoordinator::new(
        Arc::new(transport.clone()),
        Arc::new(phone_keys.clone()),
        caches.clone(),
        &config.pairing,
    );
    let payload = pairing.scan(&qr).await?;
    let approval = match pairing.approve(&payload).await? {
        ApprovalResult::Approved(approval) => approval,
        ApprovalResult::Rejected => anyhow::bail!("Pairing was rejected"),
    };
    if !approval.key_pushed {
        anyhow::bail!("Key bundle was not delivered");
    }
    println!("Paired {} (re-pairing: {})", approval.device_id, approval.is_re_pairing);

    // Desktop opens the pushed bundle.
    let group = receive_key_bundle(&transport, &desktop_keys, &approval.device_id, &desktop_key)
        .await
        .context("Desktop could not open its key bundle")?;
    println!("Desktop joined sync group {}", group.id);

    // Phone syncs its inbox.
    let engine = MessageSyncEngine::new(
        Arc::new(transport.clone()),
        Arc::new(MockUploader::new()),
        Arc::new(phone_keys),
        caches,
        SyncOptions {
            batch_delay: Duration::ZERO,
            ..SyncOptions::from_config(&config)
        },
    );
    let messages = sample_messages(count);
    let report = engine
        .sync_many(&messages, &NoThreads, |progress| {
            tracing::debug!(?progress, "Sync progress");
        })
        .await;
    println!(
        "Synced {} message(s), {} skipped, {} failed",
        report.written, report.skipped, report.failed
    );

    // Desktop reads them back.
    let keyring = load_keyring(&desktop_keys, Some(approval.device_id.clone())).await?;
    let mut decrypted = Vec::with_capacity(messages.len());
    for message in &messages {
        let key = MessageKey::new(message.source_id, message.is_mms);
        let doc = transport
            .doc(&format!("users/{}/messages/{}", DEMO_USER, key))
            .with_context(|| format!("Message {} missing from store", key))?;
        let body = open_document(&doc, &keyring)
            .with_context(|| format!("Desktop could not decrypt {}", key))?;
        println!("  [{}] {}", key, body);
        decrypted.push(body);
    }

    Ok(DemoReport {
        device_id: approval.device_id,
        written: report.written,
        decrypted,
    })
}

/// Run the demo command.
pub async fn run(count: usize) -> Result<()> {
    let report = scenario(count).await?;
    println!();
    println!(
        "Desktop {} decrypted {}/{} message(s) without backfill.",
        report.device_id,
        report.decrypted.len(),
        report.written
    );
    Ok(())
}
