use codec::{decode, encode, Envelope, Payload};
use service::{Hub, HubConfig, Session};

fn hub() -> (tempfile::TempDir, Hub) {
    let dir = tempfile::tempdir().unwrap();
    let store = store::Store::open(dir.path()).unwrap();
    let hub = Hub::new(
        store.blocks().unwrap(),
        store.queue().unwrap(),
        HubConfig {
            queue_max_per_agent: 1000,
            queue_ttl_nanos: 7 * 24 * 60 * 60 * 1_000_000_000,
            flush_batch_size: 50,
            rate_limit_sustained: 100.0,
            rate_limit_burst: 100.0,
        },
    );
    (dir, hub)
}

fn encrypted(from: &str, to: &str, ciphertext: &[u8]) -> Vec<u8> {
    encode(&Envelope::new(
        from,
        to,
        vec![1],
        0,
        Payload::Encrypted {
            nonce: [0u8; 24],
            ciphertext: ciphertext.to_vec(),
            sender_public_key: [0u8; 32],
        },
    ))
    .unwrap()
}

#[test]
fn online_round_trip() {
    let (_dir, hub) = hub();
    let (alice, _rx_alice) = Session::new("pinch:alice@relay.example.com".into());
    let (bob, mut rx_bob) = Session::new("pinch:bob@relay.example.com".into());
    hub.register(alice.clone(), 0).unwrap();
    hub.register(bob.clone(), 0).unwrap();

    let raw = encrypted("pinch:alice@relay.example.com", "pinch:bob@relay.example.com", &[0xDE, 0xAD, 0xBE, 0xEF]);
    hub.route_message(&alice, &raw, 0);

    let delivered = decode(&rx_bob.try_recv().unwrap()).unwrap();
    match delivered.payload {
        Payload::Encrypted { ciphertext, .. } => assert_eq!(ciphertext, vec![0xDE, 0xAD, 0xBE, 0xEF]),
        _ => panic!("expected an encrypted payload"),
    }
    assert_eq!(delivered.header.from_address, "pinch:alice@relay.example.com");
    assert_eq!(hub.client_count(), 2);
}

#[test]
fn offline_then_reconnect_flushes_in_order() {
    let (_dir, hub) = hub();
    let (alice, _rx_alice) = Session::new("alice".into());
    hub.register(alice.clone(), 0).unwrap();

    for (i, byte) in [0x01u8, 0x02, 0x03].into_iter().enumerate() {
        let raw = encrypted("alice", "bob", &[byte]);
        hub.route_message(&alice, &raw, i as i64);
    }

    let (bob, mut rx_bob) = Session::new("bob".into());
    hub.register(bob.clone(), 10_000).unwrap();

    let status = decode(&rx_bob.try_recv().unwrap()).unwrap();
    assert!(matches!(status.payload, Payload::QueueStatus { pending_count: 3 }));

    for expected in [0x01u8, 0x02, 0x03] {
        let envelope = decode(&rx_bob.try_recv().unwrap()).unwrap();
        match envelope.payload {
            Payload::Encrypted { ciphertext, .. } => assert_eq!(ciphertext, vec![expected]),
            _ => panic!("expected an encrypted payload"),
        }
    }
}

#[test]
fn queue_caps_and_notifies_sender() {
    let (_dir, hub) = hub_with_cap(2);
    let (alice, mut rx_alice) = Session::new("alice".into());
    hub.register(alice.clone(), 0).unwrap();

    for i in 0..2 {
        hub.route_message(&alice, &encrypted("alice", "bob", &[i]), i as i64);
    }
    hub.route_message(&alice, &encrypted("alice", "bob", &[9]), 9);

    let mut saw_queue_full = false;
    while let Ok(frame) = rx_alice.try_recv() {
        if let Ok(envelope) = decode(&frame) {
            if let Payload::QueueFull { recipient_address, .. } = envelope.payload {
                assert_eq!(recipient_address, "bob");
                saw_queue_full = true;
            }
        }
    }
    assert!(saw_queue_full);
}

fn hub_with_cap(cap: usize) -> (tempfile::TempDir, Hub) {
    let dir = tempfile::tempdir().unwrap();
    let store = store::Store::open(dir.path()).unwrap();
    let hub = Hub::new(
        store.blocks().unwrap(),
        store.queue().unwrap(),
        HubConfig {
            queue_max_per_agent: cap,
            queue_ttl_nanos: 7 * 24 * 60 * 60 * 1_000_000_000,
            flush_batch_size: 50,
            rate_limit_sustained: 100.0,
            rate_limit_burst: 100.0,
        },
    );
    (dir, hub)
}

#[test]
fn block_suppresses_delivery_without_error() {
    let (_dir, hub) = hub();
    let (alice, _rx_alice) = Session::new("alice".into());
    let (bob, mut rx_bob) = Session::new("bob".into());
    hub.register(alice.clone(), 0).unwrap();
    hub.register(bob.clone(), 0).unwrap();

    let notification = encode(&Envelope::new(
        "bob",
        "alice",
        vec![1],
        0,
        Payload::Block {
            blocker_address: "bob".into(),
            target_address: "alice".into(),
        },
    ))
    .unwrap();
    hub.route_message(&bob, &notification, 0);

    hub.route_message(&alice, &encrypted("alice", "bob", &[1]), 1);
    assert!(rx_bob.try_recv().is_err());
}

#[test]
fn duplicate_address_registration_is_rejected() {
    let (_dir, hub) = hub();
    let (alice1, _rx1) = Session::new("alice".into());
    let (alice2, _rx2) = Session::new("alice".into());

    hub.register(alice1, 0).unwrap();
    assert!(hub.register(alice2, 0).is_err());
    assert_eq!(hub.client_count(), 1);
}
