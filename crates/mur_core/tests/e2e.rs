//! End-to-end exchanges between two full protocol cores, each with its own
//! store, wired through an in-memory bundle directory.

use std::path::PathBuf;

use anyhow::Result;
use uuid::Uuid;

use mur_core::{
    BundleDirectory, CoreConfig, MemoryDirectory, ProtocolCore, ProtocolError, SessionId, Store,
};
use mur_crypto::CryptoError;
use mur_proto::Envelope;

struct Party {
    core: ProtocolCore,
    store: Store,
}

fn temp_db(user_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/mur-e2e-{}-{}.db", user_id, Uuid::new_v4()))
}

async fn party(user_id: &str) -> Party {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store = Store::open(&temp_db(user_id), None).await.expect("open store");
    let core = ProtocolCore::open(store.clone(), user_id, CoreConfig::default())
        .await
        .expect("open core");
    Party { core, store }
}

impl Party {
    fn session_with(&self, peer: &str) -> SessionId {
        SessionId::canonical(self.core.user_id(), peer)
    }

    async fn recv_n(&self, peer: &str) -> u32 {
        self.store
            .get_session(&self.session_with(peer))
            .await
            .expect("get session")
            .expect("session exists")
            .state
            .recv_n
    }

    async fn skipped_len(&self, peer: &str) -> usize {
        self.store
            .get_session(&self.session_with(peer))
            .await
            .expect("get session")
            .expect("session exists")
            .state
            .skipped_len()
    }

    async fn generation(&self, peer: &str) -> u32 {
        self.store
            .get_session(&self.session_with(peer))
            .await
            .expect("get session")
            .expect("session exists")
            .state
            .generation()
    }
}

#[tokio::test]
async fn cold_start_in_order_exchange() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;

    bob.core.replenish_one_time_prekeys(1).await?;
    bob.core.publish(&dir).await?;

    let m1 = alice.core.encrypt_outbound("bob", b"m1", &dir).await?;
    let m2 = alice.core.encrypt_outbound("bob", b"m2", &dir).await?;
    let m3 = alice.core.encrypt_outbound("bob", b"m3", &dir).await?;

    // Only the first message of a fresh initiator session carries the
    // inline init block.
    assert!(Envelope::decode(&m1)?.init.is_some());
    assert!(Envelope::decode(&m2)?.init.is_none());
    assert!(Envelope::decode(&m3)?.init.is_none());

    for (env, expect) in [(&m1, &b"m1"[..]), (&m2, &b"m2"[..]), (&m3, &b"m3"[..])] {
        let (sender, plaintext) = bob.core.decrypt_inbound(env).await?;
        assert_eq!(sender, "alice");
        assert_eq!(plaintext, expect);
    }

    // Bob's one-time prekey #1 was consumed and is gone from his store.
    assert!(bob.store.get_one_time_prekey("bob", 1).await?.is_none());
    assert_eq!(bob.core.one_time_prekey_count().await?, 0);

    // One reply completes a full ratchet turn on both sides.
    let b1 = bob.core.encrypt_outbound("alice", b"b1", &dir).await?;
    let (_, plaintext) = alice.core.decrypt_inbound(&b1).await?;
    assert_eq!(plaintext, b"b1");

    assert!(alice.generation("bob").await >= 2);
    assert!(bob.generation("alice").await >= 2);
    Ok(())
}

#[tokio::test]
async fn out_of_order_within_one_chain() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    // Establish the session, then send three messages delivered m2, m3, m1.
    let hello = alice.core.encrypt_outbound("bob", b"hello", &dir).await?;
    bob.core.decrypt_inbound(&hello).await?;

    let m1 = alice.core.encrypt_outbound("bob", b"m1", &dir).await?;
    let m2 = alice.core.encrypt_outbound("bob", b"m2", &dir).await?;
    let m3 = alice.core.encrypt_outbound("bob", b"m3", &dir).await?;

    assert_eq!(bob.core.decrypt_inbound(&m2).await?.1, b"m2");
    assert_eq!(bob.skipped_len("alice").await, 1);

    assert_eq!(bob.core.decrypt_inbound(&m3).await?.1, b"m3");
    assert_eq!(bob.core.decrypt_inbound(&m1).await?.1, b"m1");
    assert_eq!(bob.skipped_len("alice").await, 0);
    Ok(())
}

#[tokio::test]
async fn dh_ratchet_interleave() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    let a1 = alice.core.encrypt_outbound("bob", b"a1", &dir).await?;
    bob.core.decrypt_inbound(&a1).await?;

    let b1 = bob.core.encrypt_outbound("alice", b"b1", &dir).await?;
    alice.core.decrypt_inbound(&b1).await?;

    let a2 = alice.core.encrypt_outbound("bob", b"a2", &dir).await?;

    // The reply rotated Alice's ratchet key.
    let h1 = Envelope::decode(&a1)?.header;
    let h2 = Envelope::decode(&a2)?.header;
    assert_ne!(h1.dh_pub, h2.dh_pub);
    assert_eq!(h2.n, 0);

    let gen_before = bob.generation("alice").await;
    assert_eq!(bob.core.decrypt_inbound(&a2).await?.1, b"a2");
    assert_eq!(bob.generation("alice").await, gen_before + 2);
    // recv counter restarted for the new receiving chain.
    assert_eq!(bob.recv_n("alice").await, 1);
    Ok(())
}

#[tokio::test]
async fn tamper_detection_leaves_state_untouched() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    let hello = alice.core.encrypt_outbound("bob", b"hello", &dir).await?;

    // Flip one ciphertext byte, re-encode.
    let mut tampered = Envelope::decode(&hello)?;
    tampered.sealed.ciphertext[0] ^= 0x01;
    let err = bob.core.decrypt_inbound(&tampered.encode()).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Crypto(CryptoError::AuthFail)));
    assert!(!err.is_retryable());

    // No session state was committed by the failed attempt...
    assert!(bob.store.get_session(&bob.session_with("alice")).await?.is_none());
    // ...so the genuine envelope still decrypts.
    assert_eq!(bob.core.decrypt_inbound(&hello).await?.1, b"hello");
    assert_eq!(bob.recv_n("alice").await, 1);
    Ok(())
}

#[tokio::test]
async fn tamper_on_established_session_keeps_chain() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    let hello = alice.core.encrypt_outbound("bob", b"hello", &dir).await?;
    bob.core.decrypt_inbound(&hello).await?;
    let recv_before = bob.recv_n("alice").await;

    let next = alice.core.encrypt_outbound("bob", b"next", &dir).await?;
    let mut tampered = Envelope::decode(&next)?;
    tampered.sealed.tag[0] ^= 0x01;
    assert!(matches!(
        bob.core.decrypt_inbound(&tampered.encode()).await,
        Err(ProtocolError::Crypto(CryptoError::AuthFail))
    ));

    // Receiving chain unchanged: counter did not move and the genuine
    // message still opens under the same chain key.
    assert_eq!(bob.recv_n("alice").await, recv_before);
    assert_eq!(bob.core.decrypt_inbound(&next).await?.1, b"next");
    Ok(())
}

#[tokio::test]
async fn replay_rejected() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    let once = alice.core.encrypt_outbound("bob", b"once", &dir).await?;
    assert_eq!(bob.core.decrypt_inbound(&once).await?.1, b"once");

    // The very same envelope again: never plaintext.
    assert!(matches!(
        bob.core.decrypt_inbound(&once).await,
        Err(ProtocolError::Crypto(CryptoError::Replay))
    ));
    Ok(())
}

#[tokio::test]
async fn persistence_across_restart() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;

    // Bob runs with at-rest encryption so the restart also exercises the
    // password-wrapped session records.
    let bob_db = temp_db("bob");
    let bob_store = Store::open(&bob_db, Some("bob-password")).await?;
    let bob = Party {
        core: ProtocolCore::open(bob_store.clone(), "bob", CoreConfig::default()).await?,
        store: bob_store,
    };

    bob.core.replenish_one_time_prekeys(1).await?;
    bob.core.publish(&dir).await?;

    for msg in [&b"m1"[..], &b"m2"[..], &b"m3"[..]] {
        let env = alice.core.encrypt_outbound("bob", msg, &dir).await?;
        bob.core.decrypt_inbound(&env).await?;
    }
    let recv_before = bob.recv_n("alice").await;

    // Restart Bob: drop the core, reopen the same database.
    drop(bob);
    let store = Store::open(&bob_db, Some("bob-password")).await?;
    let bob2 = ProtocolCore::open(store.clone(), "bob", CoreConfig::default()).await?;

    let m4 = alice.core.encrypt_outbound("bob", b"m4", &dir).await?;
    let (sender, plaintext) = bob2.decrypt_inbound(&m4).await?;
    assert_eq!(sender, "alice");
    assert_eq!(plaintext, b"m4");

    let record = store
        .get_session(&SessionId::canonical("bob", "alice"))
        .await?
        .expect("session survived restart");
    assert_eq!(record.state.recv_n, recv_before + 1);
    Ok(())
}

#[tokio::test]
async fn simultaneous_open_converges() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    alice.core.publish(&dir).await?;
    bob.core.publish(&dir).await?;

    // Both initiate before either has received anything.
    let from_alice = alice.core.encrypt_outbound("bob", b"hi bob", &dir).await?;
    let from_bob = bob.core.encrypt_outbound("alice", b"hi alice", &dir).await?;

    // "alice" sorts before "bob", so Alice's session wins on both ends:
    // Bob adopts the inbound responder session...
    assert_eq!(bob.core.decrypt_inbound(&from_alice).await?.1, b"hi bob");
    // ...and Alice drops Bob's colliding first message.
    assert!(matches!(
        alice.core.decrypt_inbound(&from_bob).await,
        Err(ProtocolError::SessionConflict { .. })
    ));

    // From here the surviving session works in both directions.
    let b2 = bob.core.encrypt_outbound("alice", b"resent", &dir).await?;
    assert_eq!(alice.core.decrypt_inbound(&b2).await?.1, b"resent");
    let a2 = alice.core.encrypt_outbound("bob", b"ack", &dir).await?;
    assert_eq!(bob.core.decrypt_inbound(&a2).await?.1, b"ack");
    Ok(())
}

#[tokio::test]
async fn missing_session_and_missing_bundle() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;

    // No published bundle: cannot initiate.
    assert!(matches!(
        alice.core.encrypt_outbound("bob", b"x", &dir).await,
        Err(ProtocolError::BundleNotFound { .. })
    ));

    // A non-init envelope with no prior session: dropped.
    bob.core.publish(&dir).await?;
    let first = alice.core.encrypt_outbound("bob", b"one", &dir).await?;
    let second = alice.core.encrypt_outbound("bob", b"two", &dir).await?;
    drop(first);
    assert!(matches!(
        bob.core.decrypt_inbound(&second).await,
        Err(ProtocolError::SessionNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn large_plaintexts_cross_padding_buckets() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    for size in [0usize, 1, 255, 4096, 70_000] {
        let msg = vec![0xA5u8; size];
        let env = alice.core.encrypt_outbound("bob", &msg, &dir).await?;
        assert_eq!(bob.core.decrypt_inbound(&env).await?.1, msg);
    }
    Ok(())
}

#[tokio::test]
async fn delete_session_forgets_peer() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    let env = alice.core.encrypt_outbound("bob", b"hello", &dir).await?;
    bob.core.decrypt_inbound(&env).await?;
    assert_eq!(bob.core.session_ids().await?.len(), 1);

    bob.core.delete_session("alice").await?;
    assert!(bob.core.session_ids().await?.is_empty());

    // Follow-up traffic without an init block can no longer be placed.
    let more = alice.core.encrypt_outbound("bob", b"more", &dir).await?;
    assert!(matches!(
        bob.core.decrypt_inbound(&more).await,
        Err(ProtocolError::SessionNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn fingerprints_are_stable_and_published() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    alice.core.publish(&dir).await?;

    let bundle = dir.fetch_bundle("alice")?.expect("published");
    assert_eq!(
        ProtocolCore::bundle_fingerprint(&bundle)?,
        alice.core.local_fingerprint()
    );
    Ok(())
}

#[tokio::test]
async fn peer_fingerprint_pins_the_session_identity() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.publish(&dir).await?;

    // No session yet, no pinned identity.
    assert!(alice.core.peer_fingerprint("bob").await?.is_none());

    let env = alice.core.encrypt_outbound("bob", b"hi", &dir).await?;
    assert_eq!(
        alice.core.peer_fingerprint("bob").await?,
        Some(bob.core.local_fingerprint())
    );

    bob.core.decrypt_inbound(&env).await?;
    assert_eq!(
        bob.core.peer_fingerprint("alice").await?,
        Some(alice.core.local_fingerprint())
    );
    Ok(())
}

#[tokio::test]
async fn wipe_destroys_all_local_state() -> Result<()> {
    let dir = MemoryDirectory::new();
    let alice = party("alice").await;
    let bob = party("bob").await;
    bob.core.replenish_one_time_prekeys(3).await?;
    bob.core.publish(&dir).await?;

    let env = alice.core.encrypt_outbound("bob", b"hello", &dir).await?;
    bob.core.decrypt_inbound(&env).await?;

    bob.core.wipe().await?;
    assert!(bob.core.session_ids().await?.is_empty());
    assert_eq!(bob.core.one_time_prekey_count().await?, 0);
    assert!(bob.store.get_identity("bob").await?.is_none());
    Ok(())
}
