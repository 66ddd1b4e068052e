//! End-to-end boot of the fabric with the mock LLM provider.

use fabric_contracts::{ChatMessage, DeferralContext, ResourceUsage, Task};
use fabric_runtime::{AgentRuntime, RuntimeConfig};
use std::collections::HashMap;

fn test_config(dir: &tempfile::TempDir) -> RuntimeConfig {
    RuntimeConfig {
        db_path: dir.path().join("fabric.db"),
        key_dir: dir.path().join("keys"),
        mock_llm: true,
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn boot_completes_and_the_fabric_serves_calls() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AgentRuntime::new(test_config(&dir)).await.unwrap();
    runtime.boot().await.unwrap();

    let status = runtime.initialization().status();
    assert!(status.complete, "boot failed: {:?}", status.error);
    assert!(status.error.is_none());
    assert_eq!(status.phase_status["verification"], "completed");

    // The LLM bus serves structured calls through the mock provider.
    let (value, usage): (serde_json::Value, ResourceUsage) = runtime
        .llm_bus()
        .call_llm_structured(
            vec![ChatMessage::user("ping")],
            64,
            0.0,
            "boot_test",
        )
        .await
        .unwrap();
    assert_eq!(value["echo"], "ping");
    assert_eq!(usage.cost_cents, 0.0);

    // Token totals flow into the resource monitor's window.
    runtime.resource_monitor().tick().await;
    assert!(runtime.resource_monitor().snapshot().tokens_used_hour > 0);

    // The runtime control bus reaches the registered control service.
    let response = runtime.control_bus().pause_processing("boot_test").await;
    assert!(response.success);
    let response = runtime.control_bus().resume_processing("boot_test").await;
    assert!(response.success);

    // Deferrals broadcast through the WA bus onto the core WA service.
    sqlx::query(
        "INSERT INTO tasks (task_id, description, status, priority, created_at, updated_at) \
         VALUES ('boot-task', 'needs review', 'pending', 1, ?, ?)",
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(runtime.authentication().store().pool())
    .await
    .unwrap();

    let accepted = runtime
        .wise_bus()
        .send_deferral(
            DeferralContext {
                task_id: "boot-task".to_string(),
                thought_id: "thought-1".to_string(),
                reason: "needs human".to_string(),
                defer_until: None,
                metadata: HashMap::new(),
            },
            "boot_test",
        )
        .await
        .unwrap();
    assert!(accepted);

    // Graceful shutdown yields exit code 0.
    runtime.shutdown_service().request_shutdown("test complete");
    let code = runtime.run().await;
    assert_eq!(code, 0);
}

#[tokio::test]
async fn bootstrap_is_idempotent_across_boots() {
    let dir = tempfile::tempdir().unwrap();
    {
        let runtime = AgentRuntime::new(test_config(&dir)).await.unwrap();
        runtime.boot().await.unwrap();
        runtime.shutdown_service().request_shutdown("first run over");
        runtime.run().await;
    }

    // Second boot against the same database and key dir.
    let runtime = AgentRuntime::new(test_config(&dir)).await.unwrap();
    runtime.boot().await.unwrap();
    assert!(runtime.initialization().status().complete);
}

#[tokio::test]
async fn task_rows_survive_for_the_processor_queue() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AgentRuntime::new(test_config(&dir)).await.unwrap();
    runtime.boot().await.unwrap();

    let now = chrono::Utc::now();
    let task = Task {
        task_id: "queued-task".to_string(),
        channel_id: None,
        description: "work item".to_string(),
        status: "pending".to_string(),
        priority: 1,
        context: None,
        signed_by: None,
        signature: None,
        signed_at: None,
        parent_task_id: None,
        created_at: now,
        updated_at: now,
    };
    fabric_authority::TaskStore::new(runtime.authentication().store().pool().clone())
        .await
        .unwrap()
        .insert(&task)
        .await
        .unwrap();

    let queue = runtime.control_bus().get_processor_queue_status("boot_test").await;
    assert_eq!(queue.queue_size, 1);
}
