//! ProtocolCore — the explicit per-user context object.
//!
//! Owns the key store handle, the local identity, the configuration and
//! the per-session lock map. Every operation threads through this struct;
//! there is no ambient state.
//!
//! Concurrency model: operations on one session id are serialised by a
//! per-session async mutex, and no code path holds two session locks at
//! once. The store is shared and internally concurrent.
//!
//! Mutation discipline: `decrypt_inbound` runs the ratchet on a scratch
//! copy of the stored session and commits only on success (or on a
//! consumed skipped key), so a failed call leaves the durable snapshot
//! exactly where it was.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex;

use mur_crypto::{
    error::CryptoError,
    identity::{IdentityKeyPair, PublicKeyBytes},
    prekey::{OneTimePrekey, SignedPrekey},
    ratchet::RatchetState,
    session::{SessionId, SessionRecord},
    x3dh::{self, PrekeyBundle, SessionInit},
};
use mur_proto::{
    codec,
    envelope::{decode_bundle, encode_bundle, Envelope},
};
use mur_store::Store;

use crate::{
    config::CoreConfig,
    directory::BundleDirectory,
    error::ProtocolError,
};

pub struct ProtocolCore {
    store: Store,
    user_id: String,
    identity: IdentityKeyPair,
    config: CoreConfig,
    locks: StdMutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl ProtocolCore {
    /// Open the core for `user_id`: load the identity (creating one on
    /// first run) and make sure an active signed prekey exists.
    pub async fn open(
        store: Store,
        user_id: &str,
        config: CoreConfig,
    ) -> Result<Self, ProtocolError> {
        let identity = match store.get_identity(user_id).await? {
            Some(identity) => identity,
            None => {
                let identity = IdentityKeyPair::generate()?;
                store.put_identity(user_id, &identity).await?;
                tracing::info!(
                    target: "mur_core",
                    event = "identity_created",
                    user_id = %user_id,
                );
                identity
            }
        };

        if store.get_signed_prekey(user_id).await?.is_none() {
            let spk = SignedPrekey::generate(&identity, 1, Utc::now().timestamp_millis())?;
            store.put_signed_prekey(user_id, &spk).await?;
        }

        Ok(Self {
            store,
            user_id: user_id.to_string(),
            identity,
            config,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Fingerprint of the local identity key, for out-of-band comparison.
    pub fn local_fingerprint(&self) -> String {
        self.identity.public().fingerprint()
    }

    /// Fingerprint of the peer identity key a session was keyed against,
    /// or `None` when no session with `peer_user_id` exists yet.
    pub async fn peer_fingerprint(
        &self,
        peer_user_id: &str,
    ) -> Result<Option<String>, ProtocolError> {
        let session_id = SessionId::canonical(&self.user_id, peer_user_id);
        let record = self.store.get_session(&session_id).await?;
        Ok(record.map(|r| PublicKeyBytes(r.peer_identity_pub).fingerprint()))
    }

    /// Fingerprint of the identity key inside an encoded bundle — for
    /// verifying a fetched bundle before any session exists.
    pub fn bundle_fingerprint(bundle_bytes: &[u8]) -> Result<String, ProtocolError> {
        let bundle = decode_bundle(bundle_bytes)?;
        Ok(PublicKeyBytes(bundle.identity_pub).fingerprint())
    }

    // ── Key management ───────────────────────────────────────────────────

    /// Install a fresh signed prekey with the next monotonic id. Rotation
    /// cadence is the caller's policy; superseded prekeys are retained so
    /// in-flight sessions against the old bundle still open.
    pub async fn rotate_signed_prekey(&self) -> Result<u32, ProtocolError> {
        let key_id = self.store.next_signed_prekey_id(&self.user_id).await?;
        let spk = SignedPrekey::generate(&self.identity, key_id, Utc::now().timestamp_millis())?;
        self.store.put_signed_prekey(&self.user_id, &spk).await?;
        tracing::info!(
            target: "mur_core",
            event = "signed_prekey_rotated",
            key_id,
        );
        Ok(key_id)
    }

    /// Top up the one-time prekey pool; returns the new ids.
    pub async fn replenish_one_time_prekeys(&self, count: u32) -> Result<Vec<u32>, ProtocolError> {
        let first_id = self.store.next_one_time_prekey_id(&self.user_id).await?;
        let batch = OneTimePrekey::batch(first_id, count);
        for key in &batch {
            self.store.push_one_time_prekey(&self.user_id, key).await?;
        }
        Ok(batch.iter().map(|k| k.key_id).collect())
    }

    pub async fn one_time_prekey_count(&self) -> Result<u32, ProtocolError> {
        Ok(self.store.count_one_time_prekeys(&self.user_id).await?)
    }

    // ── Bundle publication ───────────────────────────────────────────────

    async fn assemble_bundle(&self) -> Result<PrekeyBundle, ProtocolError> {
        let spk = self
            .store
            .get_signed_prekey(&self.user_id)
            .await?
            .ok_or_else(|| ProtocolError::NotInitialized("no signed prekey".into()))?;
        // Peek, never pop: consumption is recorded when a bundle is used,
        // not when it is published.
        let opk = self.store.peek_one_time_prekey(&self.user_id).await?;
        Ok(PrekeyBundle::assemble(
            &self.user_id,
            &self.identity,
            &spk,
            opk.as_ref(),
        ))
    }

    /// The canonical encoded bundle this user currently publishes.
    pub async fn published_bundle(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(encode_bundle(&self.assemble_bundle().await?))
    }

    pub async fn publish(&self, directory: &dyn BundleDirectory) -> Result<(), ProtocolError> {
        let bundle = self.published_bundle().await?;
        directory.publish_bundle(&self.user_id, &bundle)?;
        Ok(())
    }

    // ── Send path ────────────────────────────────────────────────────────

    /// Encrypt `plaintext` for `peer_user_id`, creating the session on
    /// first use from the peer's published bundle. The session state is
    /// durably advanced before the envelope bytes are released.
    pub async fn encrypt_outbound(
        &self,
        peer_user_id: &str,
        plaintext: &[u8],
        directory: &dyn BundleDirectory,
    ) -> Result<Vec<u8>, ProtocolError> {
        let session_id = SessionId::canonical(&self.user_id, peer_user_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        let now_ms = Utc::now().timestamp_millis();
        let mut record = match self.store.get_session(&session_id).await? {
            Some(record) => record,
            None => {
                self.initiate_session(&session_id, peer_user_id, directory, now_ms)
                    .await?
            }
        };

        let padded = codec::pad(plaintext, self.config.padding);
        let (header, sealed) = record.state.encrypt(&padded)?;
        let init = record.pending_init.take();

        self.store.put_session(&session_id, &record).await?;

        let envelope = Envelope {
            sender_user_id: self.user_id.clone(),
            header,
            sealed,
            init,
            timestamp_ms: now_ms as u64,
        };
        Ok(envelope.encode())
    }

    async fn initiate_session(
        &self,
        session_id: &SessionId,
        peer_user_id: &str,
        directory: &dyn BundleDirectory,
        now_ms: i64,
    ) -> Result<SessionRecord, ProtocolError> {
        let bundle_bytes = directory
            .fetch_bundle(peer_user_id)?
            .ok_or_else(|| ProtocolError::BundleNotFound {
                peer: peer_user_id.to_string(),
            })?;
        let peer_bundle = decode_bundle(&bundle_bytes)?;
        if peer_bundle.user_id != peer_user_id {
            return Err(CryptoError::BadBundle("bundle names a different user".into()).into());
        }

        let own_bundle = self.assemble_bundle().await?;
        let out = x3dh::initiate(
            &self.identity,
            own_bundle,
            &peer_bundle,
            now_ms,
            self.config.bundle_max_age_ms,
        )?;

        let state = RatchetState::initiator(
            peer_user_id,
            &out.shared_secret,
            &peer_bundle.spk_pub,
            self.config.max_skipped,
            self.config.skipped_max_age_ms,
        )?;
        let record = SessionRecord::new(state, Some(out.init), peer_bundle.identity_pub);

        // Durable before first use: a crash here costs nothing but an
        // unused session row.
        self.store.put_session(session_id, &record).await?;

        tracing::info!(
            target: "mur_core",
            event = "session_created",
            role = "initiator",
            peer = %peer_user_id,
            session_id = %session_id,
        );
        Ok(record)
    }

    // ── Receive path ─────────────────────────────────────────────────────

    /// Decrypt an inbound envelope, creating the session from the inline
    /// init block on first contact. Returns the sender id and plaintext.
    pub async fn decrypt_inbound(
        &self,
        envelope_bytes: &[u8],
    ) -> Result<(String, Vec<u8>), ProtocolError> {
        let envelope = Envelope::decode(envelope_bytes)?;
        let sender = envelope.sender_user_id.clone();

        let session_id = SessionId::canonical(&self.user_id, &sender);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;

        let now_ms = Utc::now().timestamp_millis();
        let existing = self.store.get_session(&session_id).await?;

        let record = match (existing, &envelope.init) {
            // Simultaneous open: both sides initiated. Deterministic winner
            // on both ends — the session whose initiator sorts first.
            (Some(record), Some(init))
                if record.state.initiator && !record.state.has_received() =>
            {
                let peer_wins = sender.as_str() < self.user_id.as_str();
                tracing::warn!(
                    target: "mur_core",
                    event = "session_conflict",
                    peer = %sender,
                    adopted = peer_wins,
                );
                if peer_wins {
                    self.respond_session(&sender, init, now_ms).await?
                } else {
                    // Our session wins; the peer will adopt it on receiving
                    // our first message and re-encrypt anything queued.
                    return Err(ProtocolError::SessionConflict { peer: sender });
                }
            }
            (Some(record), _) => record,
            (None, Some(init)) => self.respond_session(&sender, init, now_ms).await?,
            (None, None) => {
                return Err(ProtocolError::SessionNotFound { peer: sender });
            }
        };

        let consumed_skipped = record.state.matches_skipped(&envelope.header);
        let mut scratch = record.clone();

        match scratch
            .state
            .decrypt(&envelope.header, &envelope.sealed, now_ms)
        {
            Ok(padded) => {
                self.store.put_session(&session_id, &scratch).await?;
                let plaintext = codec::unpad(&padded)?;
                Ok((sender, plaintext))
            }
            Err(err @ CryptoError::AuthFail) if consumed_skipped => {
                // The cached key is spent by the attempt; commit that.
                self.store.put_session(&session_id, &scratch).await?;
                tracing::warn!(
                    target: "mur_core",
                    event = "decrypt_failed",
                    peer = %sender,
                    reason = "auth_fail_skipped_key",
                );
                Err(err.into())
            }
            Err(err) => {
                tracing::warn!(
                    target: "mur_core",
                    event = "decrypt_failed",
                    peer = %sender,
                    reason = %err,
                );
                Err(err.into())
            }
        }
    }

    async fn respond_session(
        &self,
        sender: &str,
        init: &SessionInit,
        now_ms: i64,
    ) -> Result<SessionRecord, ProtocolError> {
        if init.sender_bundle.user_id != sender {
            return Err(CryptoError::BadBundle("init block names a different sender".into()).into());
        }
        // Signature chain only: the embedded bundle authenticates the
        // sender's identity key (trust on first use); its prekeys play no
        // part in this agreement, so no age policy applies.
        init.sender_bundle.verify(now_ms, 0)?;

        let spk = self
            .store
            .get_signed_prekey_by_id(&self.user_id, init.spk_id)
            .await?
            .ok_or_else(|| {
                CryptoError::BadBundle(format!("unknown signed prekey {}", init.spk_id))
            })?;

        // The claim is atomic in the store: concurrent inits naming the
        // same one-time prekey resolve to exactly one winner, so one OPK
        // secret can never back two sessions. A claim spent on a message
        // that then fails to decrypt is forfeited.
        let opk = match init.opk_id {
            Some(id) => Some(
                self.store
                    .claim_one_time_prekey(&self.user_id, id)
                    .await?
                    .ok_or_else(|| {
                        CryptoError::BadBundle(format!("one-time prekey {id} already consumed"))
                    })?,
            ),
            None => None,
        };

        let shared = x3dh::respond(&self.identity, &spk, opk.as_ref(), init)?;

        let state = RatchetState::responder(
            sender,
            &shared,
            &spk.secret(),
            &spk.public,
            self.config.max_skipped,
            self.config.skipped_max_age_ms,
        );

        tracing::info!(
            target: "mur_core",
            event = "session_created",
            role = "responder",
            peer = %sender,
        );
        Ok(SessionRecord::new(state, None, init.sender_bundle.identity_pub))
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    pub async fn delete_session(&self, peer_user_id: &str) -> Result<(), ProtocolError> {
        let session_id = SessionId::canonical(&self.user_id, peer_user_id);
        let lock = self.session_lock(&session_id);
        let _guard = lock.lock().await;
        self.store.delete_session(&session_id).await?;
        Ok(())
    }

    pub async fn session_ids(&self) -> Result<Vec<SessionId>, ProtocolError> {
        Ok(self.store.list_session_ids().await?)
    }

    /// Destroy every key and session this store holds. The core instance
    /// must be dropped afterwards; its in-memory identity no longer exists
    /// on disk.
    pub async fn wipe(&self) -> Result<(), ProtocolError> {
        self.store.wipe_all().await?;
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn session_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().expect("session lock map poisoned");
        map.entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
