//! Call scenarios: what paired devices see and what they can do.

#[cfg(test)]
mod tests {
    use crate::harness::{FakeBackend, Phone, DEFAULT_DEVICE_LIMIT, USER};
    use link_client::{ListenerExit, Shutdown};
    use link_core::TelephonyAction;
    use link_types::now_millis;
    use serde_json::json;
    use std::time::Duration;

    const CALLER: &str = "+15557654321";

    fn active_calls(phone: &Phone) -> Vec<(String, serde_json::Value)> {
        phone
            .transport
            .children(&format!("users/{}/active_calls", USER))
    }

    async fn wait_for_action(phone: &Phone, count: usize) {
        for _ in 0..50 {
            if phone.telephony.actions().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn repeated_ringing_broadcasts_show_one_call() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);

        phone.calls.on_ringing(CALLER, Some("Bob".into())).await.unwrap();
        phone.calls.on_ringing(CALLER, None).await.unwrap();
        phone.calls.on_ringing("555-765-4321", None).await.unwrap();

        let visible = active_calls(&phone);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].1["state"], "ringing");
        assert_eq!(visible[0].1["contactName"], "Bob");
    }

    #[tokio::test]
    async fn device_answers_then_call_ends() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        let call_id = phone.calls.on_ringing(CALLER, None).await.unwrap().unwrap();

        let shutdown = Shutdown::new();
        let listener = {
            let calls = phone.calls.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { calls.run_command_listener(shutdown).await })
        };

        // A paired device taps "answer".
        backend.transport().seed(
            &format!("users/{}/call_commands/cmd-answer", USER),
            json!({"callId": call_id.as_str(), "command": "answer", "timestamp": now_millis()}),
        );
        wait_for_action(&phone, 1).await;
        assert_eq!(
            phone.telephony.actions(),
            vec![TelephonyAction::AcceptRingingCall]
        );

        phone.calls.on_off_hook(Some(CALLER)).await.unwrap();
        assert_eq!(active_calls(&phone)[0].1["state"], "active");

        // Then "end".
        backend.transport().seed(
            &format!("users/{}/call_commands/cmd-end", USER),
            json!({"callId": call_id.as_str(), "command": "end", "timestamp": now_millis()}),
        );
        wait_for_action(&phone, 2).await;
        phone.calls.on_idle().await.unwrap();

        shutdown.trigger();
        assert_eq!(listener.await.unwrap().unwrap(), ListenerExit::Shutdown);

        assert!(active_calls(&phone).is_empty());
        let history = backend
            .transport()
            .doc(&format!("users/{}/calls/{}", USER, call_id))
            .unwrap();
        assert_eq!(history["state"], "ended");
        for id in ["cmd-answer", "cmd-end"] {
            let doc = backend
                .transport()
                .doc(&format!("users/{}/call_commands/{}", USER, id))
                .unwrap();
            assert_eq!(doc["processed"], true);
        }
    }

    #[tokio::test]
    async fn command_for_old_call_id_targets_current_call() {
        let backend = FakeBackend::new(DEFAULT_DEVICE_LIMIT);
        let phone = Phone::new(&backend);
        phone.calls.on_ringing(CALLER, None).await.unwrap();

        let command = link_types::CallCommand {
            call_id: link_types::CallId::new("id-from-a-stale-notification"),
            command: link_types::CallCommandKind::Reject,
            timestamp: now_millis(),
            processed: false,
        };
        phone.calls.handle_command("cmd-1", &command).await.unwrap();

        assert_eq!(phone.telephony.actions(), vec![TelephonyAction::EndCall]);
    }
}
