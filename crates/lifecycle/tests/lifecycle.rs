use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use syncwire_lifecycle::{ConnectionRegistry, ConnectionState, ConnectionStateManager};

#[test]
fn registry_cooldown_scenario() {
    let registry = ConnectionRegistry::new(Duration::from_millis(100));

    assert!(registry.try_register("Q1"));
    assert!(!registry.try_register("Q1"));

    thread::sleep(Duration::from_millis(150));
    assert!(registry.try_register("Q1"));
}

#[test]
fn second_owner_is_refused_while_setting_up() {
    let manager = ConnectionStateManager::new(Arc::new(ConnectionRegistry::default()));

    assert!(manager.try_start_connection_setup("c1", "ownerA", "Q1"));
    assert!(!manager.try_start_connection_setup("c1", "ownerB", "Q1"));

    assert_eq!(manager.get_state("c1"), ConnectionState::SettingUp);
    assert_eq!(manager.get_record("c1").unwrap().identity.owner_id, "ownerA");
}

#[test]
fn owner_swap_goes_through_cleanup() {
    let manager = ConnectionStateManager::new(Arc::new(ConnectionRegistry::new(Duration::ZERO)));

    assert!(manager.try_start_connection_setup("c1", "ownerA", "Q1"));
    assert!(manager.mark_connection_established("c1"));
    assert!(!manager.try_start_connection_setup("c1", "ownerB", "Q1"));

    assert!(manager.start_cleanup("c1"));
    assert!(manager.mark_cleanup_complete("c1"));
    assert!(manager.try_start_connection_setup("c1", "ownerB", "Q1"));
    assert!(manager.mark_connection_established("c1"));
    assert_eq!(manager.registry().active_count("Q1"), 1);
}

#[test]
fn racing_keys_never_share_a_queue() {
    let registry = Arc::new(ConnectionRegistry::new(Duration::ZERO));
    let manager = Arc::new(ConnectionStateManager::new(Arc::clone(&registry)));
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|n| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let key = format!("key-{n}");
                barrier.wait();
                for _ in 0..50 {
                    if manager.try_start_connection_setup(&key, "owner", "Q1") {
                        assert!(manager.mark_connection_established(&key));
                        assert!(manager.start_cleanup(&key));
                        assert!(manager.mark_cleanup_complete(&key));
                    }
                    let active = manager.registry().active_count("Q1");
                    assert!(active <= 1, "active count {active}");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(registry.active_count("Q1"), 0);
    assert!(manager.held_queues().is_empty());
}

#[test]
fn clearing_the_registry_unblocks_a_stale_queue() {
    let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(60)));
    assert!(registry.try_register("Q1"));
    assert!(registry.mark_active("Q1"));

    let manager = ConnectionStateManager::new(Arc::clone(&registry));
    assert!(!manager.try_start_connection_setup("c1", "ownerA", "Q1"));

    registry.clear_all();
    assert!(manager.try_start_connection_setup("c1", "ownerA", "Q1"));
}
