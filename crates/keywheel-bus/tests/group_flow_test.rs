//! End-to-end group-key flows over the in-memory bus.
//!
//! Three members share a `MemoryBus` that honors the full delivery
//! contract (at-least-once, unordered, echoes publishes back to the
//! publisher). The tests drive the real engines through their runtimes and
//! assert on convergence of the in-memory stage keys.

use std::{future::Future, sync::Arc, time::Duration};

use ed25519_dalek::SigningKey;
use keywheel_bus::{MemberRuntime, MemoryBus, MessageBus};
use keywheel_core::{
    ChainRatchet, Engine, EngineState, EnvelopeAttributes, MemberConfig, MemberIdentity,
    MessageType, StageKeyStore, StateStore,
};
use rand::rngs::OsRng;
use tempfile::TempDir;
use tokio::sync::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Member {
    name: &'static str,
    engine: Arc<Mutex<Engine<ChainRatchet>>>,
    keystore: Arc<StageKeyStore>,
    _dir: TempDir,
}

async fn spawn_member(
    bus: &Arc<MemoryBus>,
    index: u32,
    name: &'static str,
) -> Result<Member, String> {
    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let config = MemberConfig::new(
        MemberIdentity {
            index,
            member_name: name.to_string(),
            group_name: "research".to_string(),
        },
        dir.path(),
        "group-setup",
        "key-update",
    );
    let store = StateStore::open(&config).map_err(|e| e.to_string())?;
    let keystore = Arc::new(StageKeyStore::new());
    let engine = Engine::new(config, ChainRatchet::new(), store, Arc::clone(&keystore))
        .map_err(|e| e.to_string())?;

    let runtime = MemberRuntime::new(engine, Arc::clone(bus));
    let engine = runtime.engine();
    tokio::spawn(async move {
        let _ = runtime.run().await;
    });

    Ok(Member { name, engine, keystore, _dir: dir })
}

async fn publish_setup(bus: &MemoryBus, members: &[&Member]) -> Result<(), String> {
    let initiator = SigningKey::generate(&mut OsRng);
    let names: Vec<String> = members.iter().map(|m| m.name.to_string()).collect();
    let setup =
        ChainRatchet::create_group("research", &names, &initiator).map_err(|e| e.to_string())?;

    let attributes = EnvelopeAttributes {
        message_type: MessageType::SetupGroup,
        message_for: None,
        updated_by: None,
        ordering_key: None,
    };
    let data = setup.to_json().map_err(|e| e.to_string())?;
    bus.publish("group-setup", data, attributes.to_map()).await.map_err(|e| e.to_string())?;
    Ok(())
}

async fn publish_rotation_request(bus: &MemoryBus, member: &str) -> Result<(), String> {
    let attributes = EnvelopeAttributes {
        message_type: MessageType::UpdateRequest,
        message_for: Some(member.to_string()),
        updated_by: None,
        ordering_key: None,
    };
    bus.publish("key-update", Vec::new(), attributes.to_map())
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Drive `poll` (a loop that returns once its condition holds) under a
/// deadline.
async fn wait_for<Fut: Future<Output = ()>>(what: &str, poll: Fut) -> Result<(), String> {
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .map_err(|_| format!("timed out waiting for {what}"))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn all_active(members: &[&Member]) -> bool {
    for member in members {
        if member.engine.lock().await.state() != EngineState::Active {
            return false;
        }
    }
    true
}

fn keys_converged(members: &[&Member]) -> bool {
    let Some(first) = members[0].keystore.current() else {
        return false;
    };
    members.iter().all(|m| m.keystore.current().is_some_and(|k| *k == *first))
}

#[tokio::test]
async fn setup_activates_every_member_with_the_same_key() {
    init_tracing();
    let bus = Arc::new(MemoryBus::new());
    let alba = spawn_member(&bus, 0, "alba").await.unwrap();
    let bea = spawn_member(&bus, 1, "bea").await.unwrap();
    let cici = spawn_member(&bus, 2, "cici").await.unwrap();
    let members = [&alba, &bea, &cici];

    publish_setup(&bus, &members).await.unwrap();

    wait_for("all members active", async {
        while !all_active(&members).await {
            settle().await;
        }
    })
    .await
    .unwrap();
    assert!(keys_converged(&members), "stage keys must match after setup");

    // The in-memory key is the derivation of the committed stage-key PEM.
    let stage_key_file = alba.engine.lock().await.config().stage_key_file();
    let derived = keywheel_crypto::stage_key_from_pem_file(&stage_key_file).unwrap();
    assert_eq!(*alba.keystore.current().unwrap(), derived);
}

#[tokio::test]
async fn rotation_propagates_once_and_converges() {
    init_tracing();
    let bus = Arc::new(MemoryBus::new());
    let alba = spawn_member(&bus, 0, "alba").await.unwrap();
    let bea = spawn_member(&bus, 1, "bea").await.unwrap();
    let cici = spawn_member(&bus, 2, "cici").await.unwrap();
    let members = [&alba, &bea, &cici];

    publish_setup(&bus, &members).await.unwrap();
    wait_for("all members active", async {
        while !all_active(&members).await {
            settle().await;
        }
    })
    .await
    .unwrap();
    let key_before = alba.keystore.current().unwrap();

    publish_rotation_request(&bus, "alba").await.unwrap();

    wait_for("rotated key to propagate", async {
        loop {
            let rotated = alba.keystore.current().is_some_and(|k| *k != *key_before);
            if rotated && keys_converged(&members) {
                break;
            }
            settle().await;
        }
    })
    .await
    .unwrap();

    // The bus echoed alba's own broadcast back to it; the self-filter must
    // have kept alba on the key it already rotated to.
    assert!(keys_converged(&members));

    // Let any duplicate redeliveries drain, then re-check convergence.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(keys_converged(&members), "late redeliveries must not diverge members");
}

#[tokio::test]
async fn rotation_request_before_setup_is_recovered_by_redelivery() {
    init_tracing();
    let bus = Arc::new(MemoryBus::new());
    let alba = spawn_member(&bus, 0, "alba").await.unwrap();
    let bea = spawn_member(&bus, 1, "bea").await.unwrap();
    let members = [&alba, &bea];

    // The request arrives first; alba rejects it (not yet initialized) and
    // the bus keeps redelivering it.
    publish_rotation_request(&bus, "alba").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alba.engine.lock().await.state(), EngineState::AwaitingSetup);

    publish_setup(&bus, &members).await.unwrap();
    wait_for("all members active", async {
        while !all_active(&members).await {
            settle().await;
        }
    })
    .await
    .unwrap();

    // A later redelivery of the request triggers the rotation; bea archives
    // the broadcast it applied, so its update artifact is the proof.
    let bea_update_file = bea.engine.lock().await.config().update_msg_file();
    wait_for("rotation after late setup", async {
        while !(bea_update_file.exists() && keys_converged(&members)) {
            settle().await;
        }
    })
    .await
    .unwrap();
}
