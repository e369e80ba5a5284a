// tests/kernel_test.rs

//! End-to-end tests exercising the kernel across module boundaries: a real
//! `Config`, a real `PersistenceModule`, and a real `AppManager` wired
//! together the way `Kernel::initialize` wires them, run against a temp
//! directory with `PICCOLO_ALLOW_UNMOUNTED_TESTS` set so no real gocryptfs
//! binary is required.

use piccolo_kernel::Kernel;
use piccolo_kernel::config::Config;
use piccolo_kernel::core::app::definition::{AppDefinition, ImageSource, Listener};
use piccolo_kernel::core::app::instance::AppStatus;
use piccolo_kernel::core::cluster::{KERNEL_RESOURCE_ID, Role};
use piccolo_kernel::core::errors::PiccoloError;
use piccolo_kernel::core::events::{Event, LockStateChangedEvent, Topic};
use piccolo_kernel::core::volume::{VolumeKind, VolumeState};
use tempfile::tempdir;

fn test_config(dir: &std::path::Path) -> Config {
    std::env::set_var("PICCOLO_STATE_DIR", dir.to_str().unwrap());
    std::env::set_var("PICCOLO_ALLOW_UNMOUNTED_TESTS", "true");
    Config::from_env().unwrap()
}

#[tokio::test]
async fn setup_unlock_attaches_control_volume_and_publishes_lock_event() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let init = Kernel::initialize(config).await.unwrap();
    let kernel = init.kernel;

    let mut lock_rx = kernel.events.subscribe(Topic::LockStateChanged);

    kernel.persistence.keyset.setup("correct horse battery staple").unwrap();
    kernel.cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
    kernel.persistence.ensure_core_volumes().await.unwrap();
    kernel.persistence.unlock().await.unwrap();

    assert!(!kernel.persistence.is_locked());
    let entry = kernel.persistence.volumes.journal().entry("control").unwrap();
    assert_eq!(entry.observed_state, VolumeState::Mounted);
    assert!(!kernel.persistence.control_store.is_read_only());

    let event = lock_rx.recv().await.expect("lock.state_changed should be published");
    assert!(matches!(event, Event::LockStateChanged(LockStateChangedEvent { locked: false })));
}

#[tokio::test]
async fn installing_an_app_on_an_occupied_explicit_port_fails_and_frees_nothing_it_never_held() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let init = Kernel::initialize(config).await.unwrap();
    let kernel = init.kernel;

    kernel.persistence.keyset.setup("pw").unwrap();
    kernel.cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);

    let occupant = AppDefinition {
        name: "occupant".to_string(),
        source: ImageSource { image: Some("demo:latest".to_string()), build: None },
        app_type: Default::default(),
        listeners: vec![Listener { name: "web".to_string(), guest_port: 80, host_port: Some(15001) }],
        storage: Default::default(),
        permissions: Default::default(),
        env: vec![],
        resources: Default::default(),
        depends_on: vec![],
    };
    kernel.apps.install(occupant).await.unwrap();
    kernel.apps.start("occupant").await.unwrap();

    let contender = AppDefinition {
        name: "contender".to_string(),
        source: ImageSource { image: Some("demo:latest".to_string()), build: None },
        app_type: Default::default(),
        listeners: vec![Listener { name: "web".to_string(), guest_port: 80, host_port: Some(15001) }],
        storage: Default::default(),
        permissions: Default::default(),
        env: vec![],
        resources: Default::default(),
        depends_on: vec![],
    };
    // install allocates endpoints up front, so a clash on an explicit host
    // port is caught here rather than later at start time.
    let install_result = kernel.apps.install(contender).await;
    assert!(matches!(install_result, Err(PiccoloError::PortInUse(15001))));
    assert!(matches!(kernel.apps.status("contender").await, Err(PiccoloError::NotFound(_))));

    // releasing the occupant frees the port for a retried install
    kernel.apps.stop("occupant").await.unwrap();
    let contender = AppDefinition {
        name: "contender".to_string(),
        source: ImageSource { image: Some("demo:latest".to_string()), build: None },
        app_type: Default::default(),
        listeners: vec![Listener { name: "web".to_string(), guest_port: 80, host_port: Some(15001) }],
        storage: Default::default(),
        permissions: Default::default(),
        env: vec![],
        resources: Default::default(),
        depends_on: vec![],
    };
    kernel.apps.install(contender).await.unwrap();
    kernel.apps.start("contender").await.unwrap();
    assert_eq!(kernel.apps.status("contender").await.unwrap(), AppStatus::Running);
}

#[tokio::test]
async fn demotion_stops_running_apps_and_relock_rejects_install() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let init = Kernel::initialize(config).await.unwrap();
    let kernel = init.kernel;

    kernel.persistence.keyset.setup("pw").unwrap();
    kernel.cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
    kernel.apps.spawn_event_reactor(&kernel.events);

    let def = AppDefinition {
        name: "demo".to_string(),
        source: ImageSource { image: Some("demo:latest".to_string()), build: None },
        app_type: Default::default(),
        listeners: vec![Listener { name: "web".to_string(), guest_port: 80, host_port: None }],
        storage: Default::default(),
        permissions: Default::default(),
        env: vec![],
        resources: Default::default(),
        depends_on: vec![],
    };
    kernel.apps.install(def).await.unwrap();
    kernel.apps.start("demo").await.unwrap();
    assert_eq!(kernel.apps.status("demo").await.unwrap(), AppStatus::Running);

    kernel.cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Follower);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(kernel.apps.status("demo").await.unwrap(), AppStatus::Stopped);

    assert!(matches!(kernel.apps.start("demo").await, Err(PiccoloError::NotLeader)));
}

#[tokio::test]
async fn corrupted_volume_metadata_is_rejected_without_mounting() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let init = Kernel::initialize(config).await.unwrap();
    let kernel = init.kernel;

    kernel.persistence.keyset.setup("pw").unwrap();
    let sdek = kernel.persistence.keyset.with_sdek(|s| s.clone_key()).unwrap();
    kernel.persistence.volumes.ensure_volume("control", VolumeKind::Control, &sdek).await.unwrap();

    let metadata_path = dir.path().join("volumes").join("control").join("metadata.json");
    std::fs::write(&metadata_path, b"{").unwrap();

    let result = kernel.persistence.volumes.attach("control", &sdek).await;
    assert!(matches!(result, Err(PiccoloError::VolumeMetadataCorrupted(_)) | Err(PiccoloError::Json(_))));
}

#[tokio::test]
async fn export_and_dispatcher_round_trip() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let init = Kernel::initialize(config).await.unwrap();
    let kernel = init.kernel;

    kernel.persistence.keyset.setup("pw").unwrap();
    kernel.cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
    kernel.persistence.ensure_core_volumes().await.unwrap();
    kernel.persistence.unlock().await.unwrap();

    kernel
        .persistence
        .control_store
        .commit("meta", "node", &serde_json::json!({"hostname": "piccolo-1"}))
        .unwrap();

    let result = kernel
        .dispatcher
        .dispatch("persistence.run_control_export", serde_json::json!({"name": "control"}))
        .await
        .unwrap();
    let path = result.get("path").and_then(serde_json::Value::as_str).unwrap();
    assert!(std::path::Path::new(path).exists());
}
