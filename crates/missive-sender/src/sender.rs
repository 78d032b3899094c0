//! The message sender: every outbound path and the receive pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use missive_net::{EnvelopeHash, NewMessage, SharedSecret, Transport, TransportMessage};
use missive_shared::application::{self, ChatEntity, MembershipUpdateMessage};
use missive_shared::error::MissiveError;
use missive_shared::group::Group;
use missive_shared::identity::Identity;
use missive_shared::protocol;
use missive_shared::raw_message::{CommunityKeyExMsgType, RawMessage, ResendMethod, ResendType};
use missive_shared::segmentation::{segment_payload, SegmentMessage};
use missive_shared::types::{MessageId, PublicKey};
use missive_store::{Confirmation, Database, HashRatchetMessage};

use crate::config::SenderConfig;
use crate::datasync::{DataSync, DataSyncBatch, DataSyncDispatcher, DataSyncId};
use crate::encryption::{EncryptionError, EncryptionProtocol, ProtocolMessageSpec};
use crate::error::SenderError;
use crate::events::{HandledMessages, ReceivedMessage, ScheduledMessage, SentMessage};
use crate::keystore::KeyStore;
use crate::path::{DeliveryPath, Route};
use crate::segmentation::{expiry_cutoff, SegmentationLayer};
use crate::subscriptions::Subscribers;

const BUNDLE_ADVERTISE_TIMEOUT: Duration = Duration::from_secs(1);

/// Called with secrets negotiated by the encryption layer, after the
/// transport has started listening on their topics.
pub type SharedSecretsHandler =
    Arc<dyn Fn(&[SharedSecret]) -> Result<(), MissiveError> + Send + Sync>;

/// Pluggable parts of the sender.
pub struct Collaborators {
    pub protocol: Arc<dyn EncryptionProtocol>,
    pub transport: Arc<dyn Transport>,
    pub datasync: Arc<dyn DataSync>,
    pub key_store: Arc<dyn KeyStore>,
}

pub struct MessageSender {
    identity: Identity,
    db: Arc<Mutex<Database>>,
    protocol: Arc<dyn EncryptionProtocol>,
    transport: Arc<dyn Transport>,
    datasync: Arc<dyn DataSync>,
    key_store: Arc<dyn KeyStore>,
    segmentation: SegmentationLayer,
    config: SenderConfig,
    sent: Subscribers<SentMessage>,
    scheduled: Subscribers<ScheduledMessage>,
    shared_secrets_handler: RwLock<Option<SharedSecretsHandler>>,
    stopped: AtomicBool,
    this: Weak<MessageSender>,
}

/// An encryption-layer payload with the envelope fields needed to decrypt it.
struct InboundPayload {
    hash: EnvelopeHash,
    peer: PublicKey,
    dst: Option<PublicKey>,
    payload: Vec<u8>,
}

impl From<HashRatchetMessage> for InboundPayload {
    fn from(held: HashRatchetMessage) -> Self {
        Self {
            hash: held.hash,
            peer: held.sender,
            dst: held.dst,
            payload: held.payload,
        }
    }
}

fn wrap(identity: &Identity, raw: &RawMessage) -> Result<(Vec<u8>, MessageId), SenderError> {
    Ok(protocol::wrap(identity, raw.message_type, &raw.payload)?)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl MessageSender {
    /// Build the sender and, when enabled, start the datasync batcher. Must
    /// be called from within a tokio runtime.
    pub fn new(
        identity: Identity,
        db: Arc<Mutex<Database>>,
        collaborators: Collaborators,
        config: SenderConfig,
    ) -> Arc<Self> {
        let sender = Arc::new_cyclic(|this| MessageSender {
            identity,
            segmentation: SegmentationLayer::new(Arc::clone(&db)),
            db,
            protocol: collaborators.protocol,
            transport: collaborators.transport,
            datasync: collaborators.datasync,
            key_store: collaborators.key_store,
            sent: Subscribers::new("sent", config.subscription_buffer),
            scheduled: Subscribers::new("scheduled", config.subscription_buffer),
            config,
            shared_secrets_handler: RwLock::new(None),
            stopped: AtomicBool::new(false),
            this: this.clone(),
        });

        if sender.config.datasync_enabled {
            let weak = Arc::downgrade(&sender);
            let dispatcher: Weak<dyn DataSyncDispatcher> = weak;
            let max_batch_bytes = sender.transport.max_message_size() / 4 * 3;
            sender.datasync.start(dispatcher, max_batch_bytes);
        }

        info!(
            identity = %sender.identity.public_key().short(),
            datasync = sender.config.datasync_enabled,
            "message sender ready"
        );
        sender
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender_identity(&self, raw: &RawMessage) -> Identity {
        raw.sender.clone().unwrap_or_else(|| self.identity.clone())
    }

    pub fn set_shared_secrets_handler(&self, handler: SharedSecretsHandler) {
        *self
            .shared_secrets_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn subscribe_to_sent_messages(&self) -> mpsc::Receiver<SentMessage> {
        self.sent.subscribe()
    }

    pub fn subscribe_to_scheduled_messages(&self) -> mpsc::Receiver<ScheduledMessage> {
        self.scheduled.subscribe()
    }

    /// Events dropped so far because a subscriber queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.sent.dropped() + self.scheduled.dropped()
    }

    fn notify_scheduled(&self, recipient: Option<PublicKey>, raw: &RawMessage) {
        self.scheduled.publish(&ScheduledMessage {
            recipient,
            message: raw.clone(),
        });
    }

    /// Send `raw` to one recipient. On success `raw.id` holds the hex
    /// message ID.
    pub async fn send_private(
        &self,
        recipient: &PublicKey,
        raw: &mut RawMessage,
    ) -> Result<MessageId, SenderError> {
        let path = DeliveryPath::select(raw, self.config.datasync_enabled)?;
        let id = self.send_private_with_path(recipient, raw, path).await?;
        self.record_dispatch(raw)?;
        Ok(id)
    }

    async fn send_private_with_path(
        &self,
        recipient: &PublicKey,
        raw: &mut RawMessage,
        path: DeliveryPath,
    ) -> Result<MessageId, SenderError> {
        let sender = self.sender_identity(raw);
        let (wrapped, id) = wrap(&sender, raw)?;
        raw.id = id.to_hex();

        raw.run_before_dispatch().map_err(SenderError::BeforeDispatch)?;
        self.notify_scheduled(Some(*recipient), raw);

        match path {
            DeliveryPath::ReliableDelivery => {
                let datasync_id = self.datasync.append_message(recipient, &wrapped)?;
                // own devices never acknowledge
                if *recipient != self.identity.public_key() {
                    self.db()
                        .insert_pending_confirmation(&datasync_id, &id, recipient)?;
                }
                debug!(
                    id = %id,
                    recipient = %recipient.short(),
                    "queued message for reliable delivery"
                );
            }
            DeliveryPath::SkipEncryption | DeliveryPath::PersonalTopic => {
                let route = if path == DeliveryPath::PersonalTopic {
                    Route::PersonalTopic(*recipient)
                } else {
                    Route::Partitioned(*recipient)
                };
                let message = NewMessage::new(wrapped).with_pubsub_topic(raw.pubsub_topic.clone());
                self.dispatch(&route, message, &[id]).await?;
                self.sent.publish(&SentMessage {
                    recipient: Some(*recipient),
                    spec: None,
                    message_ids: vec![id],
                });
            }
            DeliveryPath::Encrypted => {
                let spec = self.protocol.build_direct_message(&sender, recipient, &wrapped)?;
                // the topic must be live before anything is sent on it
                if let Some(secret) = &spec.shared_secret {
                    self.handle_shared_secrets(std::slice::from_ref(secret)).await?;
                }
                self.send_message_spec(*recipient, spec, &[id], raw.pubsub_topic.clone())
                    .await?;
            }
        }

        Ok(id)
    }

    /// Send `raw` to every recipient. The before-dispatch hook runs once for
    /// the whole group.
    pub async fn send_group(
        &self,
        recipients: &[PublicKey],
        mut raw: RawMessage,
    ) -> Result<MessageId, SenderError> {
        let path = DeliveryPath::select(&raw, self.config.datasync_enabled)?;
        let sender = self.sender_identity(&raw);
        let (_, id) = wrap(&sender, &raw)?;
        raw.id = id.to_hex();

        raw.run_before_dispatch().map_err(SenderError::BeforeDispatch)?;
        raw.before_dispatch = None;

        for recipient in recipients {
            self.send_private_with_path(recipient, &mut raw, path).await?;
        }

        self.record_dispatch(&mut raw)?;
        Ok(id)
    }

    /// Broadcast on the public chat `chat_name`.
    pub async fn send_public(
        &self,
        chat_name: &str,
        mut raw: RawMessage,
    ) -> Result<MessageId, SenderError> {
        let sender = self.sender_identity(&raw);
        let (wrapped, id) = wrap(&sender, &raw)?;

        let spec = if raw.skip_encryption_layer {
            None
        } else {
            Some(self.protocol.build_public_message(&sender, &wrapped)?)
        };
        let payload = match &spec {
            Some(spec) => spec.message.clone(),
            None => wrapped,
        };
        let message = NewMessage::new(payload)
            .with_pubsub_topic(raw.pubsub_topic.clone())
            .ephemeral(raw.ephemeral);

        raw.id = id.to_hex();
        raw.run_before_dispatch().map_err(SenderError::BeforeDispatch)?;
        self.notify_scheduled(None, &raw);

        self.dispatch(&Route::Public(chat_name.to_string()), message, &[id])
            .await?;
        self.sent.publish(&SentMessage {
            recipient: None,
            spec,
            message_ids: vec![id],
        });

        self.record_dispatch(&mut raw)?;
        Ok(id)
    }

    /// Community delivery: key exchanges go to each recipient directly,
    /// chat content is group-encrypted onto the chat topic, and everything
    /// else goes out unencrypted on the community topic.
    pub async fn send_community_message(&self, mut raw: RawMessage) -> Result<MessageId, SenderError> {
        let sender = self.sender_identity(&raw);
        let (wrapped, id) = wrap(&sender, &raw)?;
        raw.id = id.to_hex();

        raw.run_before_dispatch().map_err(SenderError::BeforeDispatch)?;
        self.notify_scheduled(None, &raw);

        if raw.community_key_ex_msg_type != CommunityKeyExMsgType::None {
            let group_id = raw.hash_ratchet_group_id.clone().ok_or_else(|| {
                SenderError::Configuration("key exchange without a hash ratchet group id".into())
            })?;
            let rekey = raw.community_key_ex_msg_type == CommunityKeyExMsgType::Rekey;
            let specs = self.protocol.key_exchange_message_specs(
                &group_id,
                &self.identity,
                &raw.recipients,
                rekey,
            )?;
            if specs.len() != raw.recipients.len() {
                return Err(SenderError::Configuration(format!(
                    "key exchange produced {} specs for {} recipients",
                    specs.len(),
                    raw.recipients.len()
                )));
            }

            for (recipient, spec) in raw.recipients.iter().zip(specs) {
                self.send_message_spec(*recipient, spec, &[id], raw.pubsub_topic.clone())
                    .await?;
            }
            info!(
                group = %hex::encode(&group_id),
                recipients = raw.recipients.len(),
                rekey,
                "sent community key exchange"
            );

            self.record_dispatch(&mut raw)?;
            return Ok(id);
        }

        if raw.message_type.is_community_encrypted() {
            let group_id = raw.hash_ratchet_group_id.as_deref().ok_or_else(|| {
                SenderError::Configuration("encrypted community message without a group id".into())
            })?;
            let spec = self.protocol.build_hash_ratchet_message(group_id, &wrapped)?;
            let message =
                NewMessage::new(spec.message.clone()).with_pubsub_topic(raw.pubsub_topic.clone());

            self.dispatch(&Route::Public(raw.local_chat_id.clone()), message, &[id])
                .await?;
            self.sent.publish(&SentMessage {
                recipient: None,
                spec: Some(spec),
                message_ids: vec![id],
            });
        } else {
            let community = raw.community_id.as_deref().ok_or_else(|| {
                SenderError::Configuration("community message without a community id".into())
            })?;
            let community = PublicKey::from_slice(community)?;
            let message = NewMessage::new(wrapped).with_pubsub_topic(raw.pubsub_topic.clone());

            self.dispatch(&Route::Community(community), message, &[id])
                .await?;
            self.sent.publish(&SentMessage {
                recipient: None,
                spec: None,
                message_ids: vec![id],
            });
        }

        self.record_dispatch(&mut raw)?;
        Ok(id)
    }

    /// Pairing messages are signed with the node identity and encrypted with
    /// a one-off key agreement, independent of any session.
    pub async fn send_pair_installation(
        &self,
        recipient: &PublicKey,
        mut raw: RawMessage,
    ) -> Result<MessageId, SenderError> {
        let (wrapped, id) = wrap(&self.identity, &raw)?;
        raw.id = id.to_hex();

        raw.run_before_dispatch().map_err(SenderError::BeforeDispatch)?;
        self.notify_scheduled(Some(*recipient), &raw);

        let spec = self.protocol.build_dh_message(&self.identity, recipient, &wrapped)?;
        self.send_message_spec(*recipient, spec, &[id], raw.pubsub_topic.clone())
            .await?;
        Ok(id)
    }

    pub fn encode_membership_update(
        group: &Group,
        chat_entity: Option<ChatEntity>,
    ) -> Result<Vec<u8>, SenderError> {
        let message = MembershipUpdateMessage {
            chat_id: group.chat_id().to_string(),
            events: group.events().to_vec(),
            chat_entity,
        };
        Ok(application::encode(&message)?)
    }

    /// Like [`Self::encode_membership_update`] but with only the events
    /// needed to rebuild the group's current state.
    pub fn encode_abridged_membership_update(
        group: &Group,
        chat_entity: Option<ChatEntity>,
    ) -> Result<Vec<u8>, SenderError> {
        let message = MembershipUpdateMessage {
            chat_id: group.chat_id().to_string(),
            events: group.abridged_events(),
            chat_entity,
        };
        Ok(application::encode(&message)?)
    }

    async fn send_message_spec(
        &self,
        recipient: PublicKey,
        spec: ProtocolMessageSpec,
        message_ids: &[MessageId],
        pubsub_topic: Option<String>,
    ) -> Result<(), SenderError> {
        let route = Route::for_spec(recipient, &spec);
        let message = NewMessage::new(spec.message.clone()).with_pubsub_topic(pubsub_topic);

        self.dispatch(&route, message, message_ids).await?;
        self.sent.publish(&SentMessage {
            recipient: Some(recipient),
            spec: Some(spec),
            message_ids: message_ids.to_vec(),
        });
        Ok(())
    }

    /// Publish `message` on `route`, segmenting it first when it exceeds
    /// three quarters of the transport limit. Every envelope is tracked
    /// against `message_ids`.
    async fn dispatch(
        &self,
        route: &Route,
        message: NewMessage,
        message_ids: &[MessageId],
    ) -> Result<Vec<EnvelopeHash>, SenderError> {
        let limit = self.transport.max_message_size() / 4 * 3;
        let chunks = segment_payload(&message.payload, limit)?;
        if chunks.len() > 1 {
            debug!(
                len = message.payload.len(),
                chunks = chunks.len(),
                "segmenting oversized payload"
            );
        }

        let mut hashes = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let part = NewMessage::new(chunk)
                .with_pubsub_topic(message.pubsub_topic.clone())
                .ephemeral(message.ephemeral);

            let hash = match route {
                Route::Public(chat_name) => self.transport.send_public(&part, chat_name).await?,
                Route::Partitioned(recipient) => {
                    self.transport
                        .send_private_with_partitioned(&part, recipient)
                        .await?
                }
                Route::SharedSecret { recipient, secret } => {
                    self.transport
                        .send_private_with_shared_secret(&part, recipient, &secret.key)
                        .await?
                }
                Route::PersonalTopic(recipient) => {
                    self.transport
                        .send_private_on_personal_topic(&part, recipient)
                        .await?
                }
                Route::Community(community) => {
                    self.transport.send_community_message(&part, community).await?
                }
            };

            self.transport.track(message_ids, &hash, &part);
            hashes.push(hash);
        }

        debug!(
            route = ?route,
            envelopes = hashes.len(),
            ids = message_ids.len(),
            "dispatched message"
        );
        Ok(hashes)
    }

    async fn handle_shared_secrets(&self, secrets: &[SharedSecret]) -> Result<(), SenderError> {
        for secret in secrets {
            self.transport.process_negotiated_secret(secret).await?;
        }

        let handler = self
            .shared_secrets_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(secrets).map_err(SenderError::SharedSecrets)?;
        }
        Ok(())
    }

    /// Persist the dispatch of a raw-message-retry message.
    fn record_dispatch(&self, raw: &mut RawMessage) -> Result<(), SenderError> {
        if raw.resend_type != ResendType::RawMessageRetry {
            return Ok(());
        }
        if raw.sender.is_some() {
            warn!(id = %raw.id, "not persisting message with a sender override");
            return Ok(());
        }

        raw.sent = true;
        raw.send_count += 1;
        raw.last_sent = now_millis();

        let db = self.db();
        if !db.update_raw_message_sent(&raw.id, raw.sent, raw.send_count, raw.last_sent)? {
            db.save_raw_message(raw)?;
        }
        Ok(())
    }

    /// Process one received wire envelope.
    ///
    /// Only an unparseable envelope is an error. Incomplete segments,
    /// undecryptable payloads and malformed application messages yield an
    /// empty or partial result. Group messages held back for a missing key
    /// are handled along with the envelope that installs it.
    pub async fn handle_messages(&self, wire: &[u8]) -> Result<HandledMessages, SenderError> {
        let envelope = TransportMessage::parse(wire).map_err(SenderError::TransportParse)?;
        let peer = envelope.sig_pub_key;
        let mut payload = envelope.payload;

        if SegmentMessage::is_segment(&payload) {
            let reassembled = SegmentMessage::from_bytes(&payload)
                .map_err(SenderError::from)
                .and_then(|segment| {
                    self.segmentation
                        .handle_v2(&segment, &peer, chrono::Utc::now().timestamp())
                });
            match reassembled {
                Ok(entire) => payload = entire,
                Err(e) if e.is_segmentation_pending() => {
                    debug!(peer = %peer.short(), reason = %e, "segment stored");
                    return Ok(HandledMessages::default());
                }
                Err(e) => {
                    warn!(peer = %peer.short(), error = %e, "failed to handle segmented message");
                    return Ok(HandledMessages::default());
                }
            }
        }

        let mut handled = HandledMessages::default();
        let mut queue = VecDeque::from([InboundPayload {
            hash: envelope.hash,
            peer,
            dst: envelope.dst,
            payload,
        }]);

        while let Some(inbound) = queue.pop_front() {
            for group_id in self.handle_inbound_payload(inbound, &mut handled).await {
                let held = self.db().take_hash_ratchet_messages(&group_id);
                match held {
                    Ok(held) => {
                        if !held.is_empty() {
                            debug!(
                                group = %hex::encode(&group_id),
                                count = held.len(),
                                "replaying held hash ratchet messages"
                            );
                        }
                        queue.extend(held.into_iter().map(InboundPayload::from));
                    }
                    Err(e) => warn!(
                        group = %hex::encode(&group_id),
                        error = %e,
                        "failed to load held hash ratchet messages"
                    ),
                }
            }
        }

        Ok(handled)
    }

    /// Decrypt and unwrap one encryption-layer payload into `handled`.
    /// Returns the hash ratchet groups whose key it installed.
    async fn handle_inbound_payload(
        &self,
        inbound: InboundPayload,
        handled: &mut HandledMessages,
    ) -> Vec<Vec<u8>> {
        let InboundPayload {
            hash,
            peer,
            dst,
            mut payload,
        } = inbound;

        let (receiver, ephemeral) = match dst.and_then(|dst| self.key_store.get(&dst)) {
            Some(key) => (key, true),
            None => (self.identity.clone(), false),
        };

        let mut installed_groups = Vec::new();
        match self.protocol.handle_message(&receiver, &payload, ephemeral) {
            Ok(decrypted) => {
                if !decrypted.shared_secrets.is_empty() {
                    if let Err(e) = self.handle_shared_secrets(&decrypted.shared_secrets).await {
                        warn!(peer = %peer.short(), error = %e, "failed to handle shared secrets");
                    }
                }
                installed_groups = decrypted.installed_groups;
                match decrypted.payload {
                    Some(plaintext) => payload = plaintext,
                    None => return installed_groups,
                }
            }
            Err(EncryptionError::NotEncrypted) => {}
            Err(EncryptionError::GroupNotFound(group_id)) => {
                self.hold_hash_ratchet_message(HashRatchetMessage {
                    hash,
                    group_id,
                    sender: peer,
                    dst,
                    payload,
                    timestamp: chrono::Utc::now().timestamp(),
                });
                return installed_groups;
            }
            Err(e) => {
                // ephemeral keys never advertise a bundle
                if matches!(e, EncryptionError::DeviceNotFound(_)) && !ephemeral {
                    self.advertise_bundle_in_background(peer);
                }
                debug!(peer = %peer.short(), error = %e, "failed to handle encryption layer message");
                return installed_groups;
            }
        }

        let (payloads, acks) = match self.datasync.unwrap_payloads_and_acks(&peer, &payload) {
            Ok(unwrapped) => unwrapped,
            Err(_) => (vec![payload], Vec::new()),
        };
        handled.acks.extend(acks);

        for wrapped in payloads {
            let (metadata, id) = match protocol::unwrap(&wrapped) {
                Ok(unwrapped) => unwrapped,
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "failed to handle application metadata layer message");
                    continue;
                }
            };

            let parsed = if self.config.parse_application_payloads {
                application::parse_payload(metadata.message_type, &metadata.payload)
                    .unwrap_or_else(|e| {
                        debug!(id = %id, error = %e, "failed to parse application payload");
                        None
                    })
            } else {
                None
            };

            debug!(
                id = %id,
                signer = %metadata.signer.short(),
                message_type = ?metadata.message_type,
                "received message"
            );
            handled.messages.push(ReceivedMessage {
                id,
                envelope_hash: hash,
                envelope_signer: peer,
                signer: metadata.signer,
                message_type: metadata.message_type,
                payload: metadata.payload,
                parsed,
            });
        }

        installed_groups
    }

    fn hold_hash_ratchet_message(&self, message: HashRatchetMessage) {
        match self.db().save_hash_ratchet_message(&message) {
            Ok(_) => debug!(
                peer = %message.sender.short(),
                group = %hex::encode(&message.group_id),
                "holding hash ratchet message until its key arrives"
            ),
            Err(e) => warn!(
                peer = %message.sender.short(),
                error = %e,
                "failed to hold hash ratchet message"
            ),
        }
    }

    fn advertise_bundle_in_background(&self, peer: PublicKey) {
        let Some(sender) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match tokio::time::timeout(BUNDLE_ADVERTISE_TIMEOUT, sender.advertise_bundle(peer)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(peer = %peer.short(), error = %e, "failed to advertise bundle"),
                Err(_) => warn!(peer = %peer.short(), "bundle advertisement timed out"),
            }
        });
    }

    async fn advertise_bundle(&self, peer: PublicKey) -> Result<(), SenderError> {
        let now = chrono::Utc::now().timestamp();
        if !self.protocol.should_advertise_bundle(&peer, now)? {
            return Ok(());
        }

        let spec = self.protocol.build_bundle_advertise_message(&self.identity, &peer)?;
        self.send_message_spec(peer, spec, &[], None).await?;
        self.protocol.confirm_bundle_advertisement(&peer, now);
        debug!(peer = %peer.short(), "advertised bundle");
        Ok(())
    }

    /// Apply datasync acknowledgements. Returns the IDs of messages now
    /// fully confirmed; their persisted copies are dropped.
    pub fn process_acks(&self, acks: &[DataSyncId]) -> Result<Vec<MessageId>, SenderError> {
        let mut db = self.db();
        let mut confirmed = Vec::new();
        for ack in acks {
            if let Some(id) = db.mark_as_confirmed(ack, false)? {
                db.delete_raw_message(&id.to_hex())?;
                debug!(id = %id, "message confirmed");
                confirmed.push(id);
            }
        }
        Ok(confirmed)
    }

    /// Per-recipient acknowledgement state of a reliably delivered message.
    pub fn confirmations(&self, id: &MessageId) -> Result<Vec<Confirmation>, SenderError> {
        Ok(self.db().confirmations_for_message(id)?)
    }

    /// Re-dispatch persisted raw-message-retry messages whose backoff has
    /// elapsed. Returns how many went out.
    pub async fn resend_raw_messages(&self) -> Result<usize, SenderError> {
        let candidates = self.db().raw_messages_for_resend(self.config.max_resend_count)?;
        let now = now_millis();
        let mut resent = 0;

        for raw in candidates {
            if now - raw.last_sent < self.config.resend_backoff_ms(raw.send_count) {
                continue;
            }

            let id = raw.id.clone();
            let result = match raw.resend_method {
                ResendMethod::SendCommunityMessage => self.send_community_message(raw).await,
                ResendMethod::SendPrivate if raw.recipients.is_empty() => {
                    warn!(id = %id, "private resend without recipients");
                    continue;
                }
                ResendMethod::SendPrivate => {
                    let recipients = raw.recipients.clone();
                    self.send_group(&recipients, raw).await
                }
                ResendMethod::Dynamic => {
                    if raw.community_id.is_some() {
                        self.send_community_message(raw).await
                    } else if !raw.recipients.is_empty() {
                        let recipients = raw.recipients.clone();
                        self.send_group(&recipients, raw).await
                    } else {
                        let chat_name = raw.local_chat_id.clone();
                        self.send_public(&chat_name, raw).await
                    }
                }
            };

            match result {
                Ok(_) => resent += 1,
                Err(e) => warn!(id = %id, error = %e, "failed to resend raw message"),
            }
        }

        if resent > 0 {
            info!(resent, "resent raw messages");
        }
        Ok(resent)
    }

    /// Sweep expired segments and held hash ratchet messages. Returns the
    /// number of rows removed.
    pub fn cleanup_segments(&self) -> Result<usize, SenderError> {
        let now = chrono::Utc::now().timestamp();
        let segments = self.segmentation.cleanup(now)?;
        let held = self
            .db()
            .remove_hash_ratchet_messages_older_than(expiry_cutoff(now))?;
        Ok(segments + held)
    }

    /// Register an ephemeral key: the transport starts listening on its
    /// topics and envelopes addressed to it are decrypted with it.
    pub async fn add_ephemeral_key(&self, key: Identity) -> Result<(), SenderError> {
        self.transport.load_key_filters(&key).await?;
        debug!(key = %key.public_key().short(), "added ephemeral key");
        self.key_store.insert(key);
        Ok(())
    }

    pub async fn join_public(&self, chat_name: &str) -> Result<(), SenderError> {
        self.transport.join_public(chat_name).await?;
        Ok(())
    }

    /// Close subscriptions and stop the datasync batcher. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sent.close();
        self.scheduled.close();
        self.datasync.stop();
        info!("message sender stopped");
    }
}

#[async_trait]
impl DataSyncDispatcher for MessageSender {
    async fn dispatch_batch(&self, batch: DataSyncBatch) -> Result<(), SenderError> {
        let signer = self.identity.public_key();
        let message_ids: Vec<MessageId> = batch
            .messages
            .iter()
            .map(|wrapped| MessageId::compute(&signer, wrapped))
            .collect();

        let spec = self
            .protocol
            .build_direct_message(&self.identity, &batch.recipient, &batch.payload)?;
        if let Some(secret) = &spec.shared_secret {
            self.handle_shared_secrets(std::slice::from_ref(secret)).await?;
        }
        self.send_message_spec(batch.recipient, spec, &message_ids, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use missive_net::{MemoryTransport, SendKind};
    use missive_shared::application::{ApplicationPayload, ChatMessage};
    use missive_shared::protocol::MessageType;

    use crate::datasync::BatchingDataSync;
    use crate::encryption::{DecryptedMessage, SealedBoxProtocol};
    use crate::keystore::EphemeralKeyStore;

    const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    struct Node {
        identity: Identity,
        sender: Arc<MessageSender>,
        transport: Arc<MemoryTransport>,
        protocol: Arc<SealedBoxProtocol>,
        datasync: Arc<BatchingDataSync>,
        db: Arc<Mutex<Database>>,
    }

    impl Node {
        fn key(&self) -> PublicKey {
            self.identity.public_key()
        }
    }

    fn node_with(config: SenderConfig, max_message_size: usize) -> Node {
        let identity = Identity::generate();
        let transport = Arc::new(MemoryTransport::new(identity.clone(), max_message_size));
        let protocol = Arc::new(SealedBoxProtocol::new());
        let datasync = Arc::new(BatchingDataSync::new(
            identity.public_key(),
            Duration::from_secs(3600),
        ));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));

        let sender = MessageSender::new(
            identity.clone(),
            Arc::clone(&db),
            Collaborators {
                protocol: protocol.clone(),
                transport: transport.clone(),
                datasync: datasync.clone(),
                key_store: Arc::new(EphemeralKeyStore::new()),
            },
            config,
        );

        Node {
            identity,
            sender,
            transport,
            protocol,
            datasync,
            db,
        }
    }

    fn node() -> Node {
        node_with(SenderConfig::default(), MAX_MESSAGE_SIZE)
    }

    fn chat(text: &str) -> RawMessage {
        let payload = application::encode(&ChatMessage {
            clock: 1,
            timestamp: Utc::now(),
            chat_id: "chat".into(),
            text: text.into(),
            response_to: None,
        })
        .unwrap();
        RawMessage::new("chat", MessageType::ChatMessage, payload)
    }

    fn text_of(message: &ReceivedMessage) -> String {
        match &message.parsed {
            Some(ApplicationPayload::ChatMessage(chat)) => chat.text.clone(),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    async fn deliver(from: &Node, to: &Node) -> Vec<HandledMessages> {
        let mut handled = Vec::new();
        for send in from.transport.take_sends() {
            handled.push(to.sender.handle_messages(&send.wire).await.unwrap());
        }
        handled
    }

    #[tokio::test]
    async fn message_id_is_deterministic() {
        let alice = node();
        let mut raw = chat("same");
        raw.skip_encryption_layer = true;

        let first = alice.sender.send_public("status", raw.clone()).await.unwrap();
        let second = alice.sender.send_public("status", raw).await.unwrap();
        assert_eq!(first, second);

        let sends = alice.transport.take_sends();
        assert_eq!(sends[0].message.payload, sends[1].message.payload);
    }

    #[tokio::test]
    async fn encrypted_private_round_trip() {
        let alice = node();
        let bob = node();

        let mut raw = chat("hello bob");
        let id = alice.sender.send_private(&bob.key(), &mut raw).await.unwrap();
        assert_eq!(raw.id, id.to_hex());

        let sends = alice.transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].kind, SendKind::Partitioned(bob.key()));
        assert_eq!(alice.transport.monitor().message_ids(&sends[0].hash), vec![id]);

        let handled = deliver(&alice, &bob).await;
        let received = &handled[0].messages;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, id);
        assert_eq!(received[0].signer, alice.key());
        assert_eq!(text_of(&received[0]), "hello bob");
        assert_eq!(bob.transport.negotiated_secrets().len(), 1);

        // bob now holds a session with alice, so his reply uses the secret topic
        let mut reply = chat("hi alice");
        bob.sender.send_private(&alice.key(), &mut reply).await.unwrap();
        assert!(matches!(
            bob.transport.sends()[0].kind,
            SendKind::SharedSecret { recipient, .. } if recipient == alice.key()
        ));

        let handled = deliver(&bob, &alice).await;
        assert_eq!(text_of(&handled[0].messages[0]), "hi alice");
    }

    #[tokio::test]
    async fn configuration_error_sends_nothing() {
        let alice = node();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut raw = chat("x");
        raw.resend_type = ResendType::ReliableDelivery;
        raw.skip_encryption_layer = true;
        raw.before_dispatch = Some(Arc::new(move |_: &mut RawMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let err = alice
            .sender
            .send_private(&PublicKey([1u8; 32]), &mut raw)
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Configuration(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(alice.transport.sends().is_empty());
    }

    #[tokio::test]
    async fn shared_secret_handler_runs_before_transport() {
        let alice = node();
        let bob = node();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let transport = alice.transport.clone();
        let log = seen.clone();
        alice
            .sender
            .set_shared_secrets_handler(Arc::new(move |secrets: &[SharedSecret]| {
                log.lock().unwrap().push((secrets.len(), transport.sends().len()));
                Ok(())
            }));

        alice.sender.send_private(&bob.key(), &mut chat("x")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 0)]);
        assert_eq!(alice.transport.sends().len(), 1);
        assert_eq!(alice.transport.negotiated_secrets()[0].identity, bob.key());
    }

    #[tokio::test]
    async fn failing_shared_secret_handler_aborts_send() {
        let alice = node();
        alice
            .sender
            .set_shared_secrets_handler(Arc::new(|_: &[SharedSecret]| {
                Err(MissiveError::Serialization("no topic".into()))
            }));

        let err = alice
            .sender
            .send_private(&Identity::generate().public_key(), &mut chat("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::SharedSecrets(_)));
        assert!(alice.transport.sends().is_empty());
    }

    #[tokio::test]
    async fn before_dispatch_can_abort() {
        let alice = node();
        let mut scheduled = alice.sender.subscribe_to_scheduled_messages();

        let mut raw = chat("x");
        raw.before_dispatch = Some(Arc::new(|_: &mut RawMessage| {
            Err(MissiveError::DispatchAborted("cancelled".into()))
        }));

        let err = alice
            .sender
            .send_private(&Identity::generate().public_key(), &mut raw)
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::BeforeDispatch(_)));
        assert!(alice.transport.sends().is_empty());
        assert!(scheduled.try_recv().is_err());
    }

    #[tokio::test]
    async fn scheduled_and_sent_events() {
        let alice = node();
        let bob = Identity::generate().public_key();
        let mut scheduled = alice.sender.subscribe_to_scheduled_messages();
        let mut sent = alice.sender.subscribe_to_sent_messages();

        let mut raw = chat("x");
        let id = alice.sender.send_private(&bob, &mut raw).await.unwrap();

        let event = scheduled.try_recv().unwrap();
        assert_eq!(event.recipient, Some(bob));
        assert_eq!(event.message.id, id.to_hex());

        let event = sent.try_recv().unwrap();
        assert_eq!(event.recipient, Some(bob));
        assert_eq!(event.message_ids, vec![id]);
        assert!(event.spec.is_some());
    }

    #[tokio::test]
    async fn full_subscription_drops_events() {
        let alice = node_with(
            SenderConfig {
                subscription_buffer: 1,
                ..Default::default()
            },
            MAX_MESSAGE_SIZE,
        );
        let mut sent = alice.sender.subscribe_to_sent_messages();

        let mut raw = chat("x");
        raw.skip_encryption_layer = true;
        for _ in 0..3 {
            alice.sender.send_public("status", raw.clone()).await.unwrap();
        }

        assert!(sent.try_recv().is_ok());
        assert!(sent.try_recv().is_err());
        assert_eq!(alice.sender.dropped_events(), 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_subscriptions() {
        let alice = node();
        let mut sent = alice.sender.subscribe_to_sent_messages();
        assert!(alice.datasync.is_running());

        alice.sender.stop();
        alice.sender.stop();

        assert!(sent.recv().await.is_none());
        assert!(!alice.datasync.is_running());
    }

    #[tokio::test]
    async fn oversized_public_message_is_segmented_and_reassembled() {
        let alice = node_with(SenderConfig::default(), 2000);
        let bob = node_with(SenderConfig::default(), 2000);

        let mut raw = RawMessage::new(
            "status",
            MessageType::StatusUpdate,
            (0..20_000u32).map(|i| (i % 253) as u8).collect(),
        );
        raw.skip_encryption_layer = true;
        let id = alice.sender.send_public("status", raw.clone()).await.unwrap();

        let sends = alice.transport.take_sends();
        assert!(sends.len() > 10);
        for send in &sends {
            assert!(send.message.payload.len() <= 1500 + 128);
            assert_eq!(alice.transport.monitor().message_ids(&send.hash), vec![id]);
        }

        let mut complete = Vec::new();
        for send in sends.iter().rev() {
            let handled = bob.sender.handle_messages(&send.wire).await.unwrap();
            complete.extend(handled.messages);
        }
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].id, id);
        assert_eq!(complete[0].payload, raw.payload);
    }

    #[tokio::test]
    async fn ephemeral_key_decrypts_without_negotiation() {
        let alice = node();
        let bob = node();
        let ephemeral = Identity::generate();

        bob.sender.add_ephemeral_key(ephemeral.clone()).await.unwrap();
        assert_eq!(bob.transport.key_filters(), vec![ephemeral.public_key()]);

        alice
            .sender
            .send_private(&ephemeral.public_key(), &mut chat("to ephemeral"))
            .await
            .unwrap();

        let handled = deliver(&alice, &bob).await;
        assert_eq!(text_of(&handled[0].messages[0]), "to ephemeral");
        assert!(bob.transport.negotiated_secrets().is_empty());
        assert!(!bob.protocol.has_session(&alice.key()));
    }

    #[tokio::test]
    async fn unknown_device_triggers_bundle_advertisement() {
        let alice = node();
        let bob = node();
        let carol = Identity::generate().public_key();

        alice.sender.send_private(&carol, &mut chat("not for bob")).await.unwrap();
        let handled = deliver(&alice, &bob).await;
        assert!(handled[0].is_empty());

        for _ in 0..100 {
            if !bob.transport.sends().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sends = bob.transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].kind, SendKind::Partitioned(alice.key()));

        // rate limited
        let now = Utc::now().timestamp();
        assert!(!bob.protocol.should_advertise_bundle(&alice.key(), now).unwrap());
    }

    #[tokio::test]
    async fn reliable_delivery_is_confirmed_by_ack() {
        let alice = node();
        let bob = node();

        let mut raw = chat("reliable");
        raw.resend_type = ResendType::ReliableDelivery;
        let id = alice.sender.send_private(&bob.key(), &mut raw).await.unwrap();
        assert!(alice.transport.sends().is_empty());

        let pending = alice.sender.confirmations(&id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].public_key, bob.key());
        assert!(!pending[0].is_confirmed());

        alice.datasync.flush(alice.sender.as_ref(), MAX_MESSAGE_SIZE).await;
        let handled = deliver(&alice, &bob).await;
        assert_eq!(handled[0].messages[0].id, id);
        assert_eq!(text_of(&handled[0].messages[0]), "reliable");

        bob.datasync.flush(bob.sender.as_ref(), MAX_MESSAGE_SIZE).await;
        let handled = deliver(&bob, &alice).await;
        assert!(handled[0].messages.is_empty());
        assert_eq!(handled[0].acks.len(), 1);

        assert_eq!(alice.sender.process_acks(&handled[0].acks).unwrap(), vec![id]);
        assert!(alice.sender.confirmations(&id).unwrap().is_empty());
        assert!(alice.sender.process_acks(&handled[0].acks).unwrap().is_empty());
    }

    #[tokio::test]
    async fn raw_message_retry_is_resent_with_backoff() {
        let alice = node_with(
            SenderConfig {
                resend_backoff_base: Duration::ZERO,
                max_resend_count: 3,
                ..Default::default()
            },
            MAX_MESSAGE_SIZE,
        );
        let bob = Identity::generate().public_key();

        let mut raw = chat("retry me");
        raw.resend_type = ResendType::RawMessageRetry;
        raw.resend_method = ResendMethod::SendPrivate;
        raw.recipients = vec![bob];
        alice.sender.send_private(&bob, &mut raw).await.unwrap();

        let stored = alice.db.lock().unwrap().raw_message_by_id(&raw.id).unwrap();
        assert!(stored.sent);
        assert_eq!(stored.send_count, 1);

        assert_eq!(alice.sender.resend_raw_messages().await.unwrap(), 1);
        assert_eq!(alice.sender.resend_raw_messages().await.unwrap(), 1);
        assert_eq!(alice.sender.resend_raw_messages().await.unwrap(), 0);

        let stored = alice.db.lock().unwrap().raw_message_by_id(&raw.id).unwrap();
        assert_eq!(stored.send_count, 3);
        assert_eq!(alice.transport.sends().len(), 3);
    }

    #[tokio::test]
    async fn raw_message_retry_waits_for_backoff() {
        let alice = node();
        let mut raw = chat("later");
        raw.resend_type = ResendType::RawMessageRetry;
        raw.skip_encryption_layer = true;
        alice.sender.send_public("status", raw).await.unwrap();

        assert_eq!(alice.sender.resend_raw_messages().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn community_key_exchange_then_group_encrypted_chat() {
        let alice = node();
        let bob = node();
        let group_id = b"community-1".to_vec();

        alice
            .sender
            .send_community_message(key_exchange(&group_id, vec![bob.key()]))
            .await
            .unwrap();

        let handled = deliver(&alice, &bob).await;
        assert!(handled[0].is_empty());
        assert!(bob.protocol.has_group_key(&group_id));

        let mut message = chat("to the community");
        message.local_chat_id = "community-chat".into();
        message.hash_ratchet_group_id = Some(group_id);
        alice.sender.send_community_message(message).await.unwrap();
        assert_eq!(
            alice.transport.sends()[0].kind,
            SendKind::Public("community-chat".into())
        );

        let handled = deliver(&alice, &bob).await;
        assert_eq!(text_of(&handled[0].messages[0]), "to the community");
    }

    fn key_exchange(group_id: &[u8], recipients: Vec<PublicKey>) -> RawMessage {
        let mut raw = RawMessage::new("community-chat", MessageType::CommunityEncryptionKeys, Vec::new());
        raw.community_key_ex_msg_type = CommunityKeyExMsgType::Rekey;
        raw.hash_ratchet_group_id = Some(group_id.to_vec());
        raw.recipients = recipients;
        raw
    }

    #[tokio::test]
    async fn key_exchange_runs_hook_and_schedules_once() {
        let alice = node();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut scheduled = alice.sender.subscribe_to_scheduled_messages();
        let mut sent = alice.sender.subscribe_to_sent_messages();

        let recipients = vec![Identity::generate().public_key(), Identity::generate().public_key()];
        let mut raw = key_exchange(b"community-2", recipients);
        raw.before_dispatch = Some(Arc::new(move |_: &mut RawMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let id = alice.sender.send_community_message(raw).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let event = scheduled.try_recv().unwrap();
        assert_eq!(event.recipient, None);
        assert_eq!(event.message.id, id.to_hex());
        assert!(scheduled.try_recv().is_err());

        assert_eq!(alice.transport.sends().len(), 2);
        assert_eq!(sent.try_recv().unwrap().message_ids, vec![id]);
        assert_eq!(sent.try_recv().unwrap().message_ids, vec![id]);
    }

    #[tokio::test]
    async fn key_exchange_hook_can_abort() {
        let alice = node();
        let mut scheduled = alice.sender.subscribe_to_scheduled_messages();

        let mut raw = key_exchange(b"community-3", vec![Identity::generate().public_key()]);
        raw.before_dispatch = Some(Arc::new(|_: &mut RawMessage| {
            Err(MissiveError::DispatchAborted("cancelled".into()))
        }));

        let err = alice.sender.send_community_message(raw).await.unwrap_err();
        assert!(matches!(err, SenderError::BeforeDispatch(_)));
        assert!(alice.transport.sends().is_empty());
        assert!(scheduled.try_recv().is_err());
    }

    /// Drops the last key exchange spec.
    struct ShortKeyExchange(SealedBoxProtocol);

    impl EncryptionProtocol for ShortKeyExchange {
        fn build_direct_message(
            &self,
            sender: &Identity,
            recipient: &PublicKey,
            payload: &[u8],
        ) -> Result<ProtocolMessageSpec, EncryptionError> {
            self.0.build_direct_message(sender, recipient, payload)
        }

        fn build_public_message(
            &self,
            sender: &Identity,
            payload: &[u8],
        ) -> Result<ProtocolMessageSpec, EncryptionError> {
            self.0.build_public_message(sender, payload)
        }

        fn build_dh_message(
            &self,
            sender: &Identity,
            recipient: &PublicKey,
            payload: &[u8],
        ) -> Result<ProtocolMessageSpec, EncryptionError> {
            self.0.build_dh_message(sender, recipient, payload)
        }

        fn build_bundle_advertise_message(
            &self,
            sender: &Identity,
            recipient: &PublicKey,
        ) -> Result<ProtocolMessageSpec, EncryptionError> {
            self.0.build_bundle_advertise_message(sender, recipient)
        }

        fn build_hash_ratchet_message(
            &self,
            group_id: &[u8],
            payload: &[u8],
        ) -> Result<ProtocolMessageSpec, EncryptionError> {
            self.0.build_hash_ratchet_message(group_id, payload)
        }

        fn key_exchange_message_specs(
            &self,
            group_id: &[u8],
            sender: &Identity,
            recipients: &[PublicKey],
            rekey: bool,
        ) -> Result<Vec<ProtocolMessageSpec>, EncryptionError> {
            let mut specs = self.0.key_exchange_message_specs(group_id, sender, recipients, rekey)?;
            specs.pop();
            Ok(specs)
        }

        fn handle_message(
            &self,
            receiver: &Identity,
            payload: &[u8],
            skip_negotiation: bool,
        ) -> Result<DecryptedMessage, EncryptionError> {
            self.0.handle_message(receiver, payload, skip_negotiation)
        }

        fn should_advertise_bundle(&self, peer: &PublicKey, now: i64) -> Result<bool, EncryptionError> {
            self.0.should_advertise_bundle(peer, now)
        }

        fn confirm_bundle_advertisement(&self, peer: &PublicKey, now: i64) {
            self.0.confirm_bundle_advertisement(peer, now)
        }
    }

    #[tokio::test]
    async fn key_exchange_rejects_spec_count_mismatch() {
        let identity = Identity::generate();
        let transport = Arc::new(MemoryTransport::new(identity.clone(), MAX_MESSAGE_SIZE));
        let sender = MessageSender::new(
            identity.clone(),
            Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            Collaborators {
                protocol: Arc::new(ShortKeyExchange(SealedBoxProtocol::new())),
                transport: transport.clone(),
                datasync: Arc::new(BatchingDataSync::new(
                    identity.public_key(),
                    Duration::from_secs(3600),
                )),
                key_store: Arc::new(EphemeralKeyStore::new()),
            },
            SenderConfig::default(),
        );

        let recipients = vec![Identity::generate().public_key(), Identity::generate().public_key()];
        let err = sender
            .send_community_message(key_exchange(b"community-4", recipients))
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Configuration(_)));
        assert!(transport.sends().is_empty());
    }

    #[tokio::test]
    async fn group_message_before_its_key_is_delivered_with_the_key() {
        let alice = node();
        let bob = node();
        let group_id = b"community-5".to_vec();

        alice
            .sender
            .send_community_message(key_exchange(&group_id, vec![bob.key()]))
            .await
            .unwrap();
        let mut message = chat("to the community");
        message.local_chat_id = "community-chat".into();
        message.hash_ratchet_group_id = Some(group_id.clone());
        let id = alice.sender.send_community_message(message).await.unwrap();

        let sends = alice.transport.take_sends();
        assert_eq!(sends.len(), 2);
        let (key_ex, chat_send) = (&sends[0], &sends[1]);

        let handled = bob.sender.handle_messages(&chat_send.wire).await.unwrap();
        assert!(handled.is_empty());
        assert_eq!(bob.db.lock().unwrap().hash_ratchet_messages(&group_id).unwrap().len(), 1);

        let handled = bob.sender.handle_messages(&key_ex.wire).await.unwrap();
        assert!(bob.protocol.has_group_key(&group_id));
        assert_eq!(handled.messages.len(), 1);
        assert_eq!(handled.messages[0].id, id);
        assert_eq!(handled.messages[0].envelope_hash, chat_send.hash);
        assert_eq!(text_of(&handled.messages[0]), "to the community");
        assert!(bob.db.lock().unwrap().hash_ratchet_messages(&group_id).unwrap().is_empty());

        // held copy is gone, so a second key delivery replays nothing
        let handled = bob.sender.handle_messages(&key_ex.wire).await.unwrap();
        assert!(handled.messages.is_empty());
    }

    #[tokio::test]
    async fn community_control_message_is_unencrypted() {
        let alice = node();
        let bob = node();
        let community = Identity::generate().public_key();

        let mut raw = RawMessage::new("", MessageType::CommunityDescription, b"description".to_vec());
        raw.community_id = Some(community.0.to_vec());
        let id = alice.sender.send_community_message(raw).await.unwrap();
        assert_eq!(alice.transport.sends()[0].kind, SendKind::Community(community));

        let handled = deliver(&alice, &bob).await;
        assert_eq!(handled[0].messages[0].id, id);
        assert_eq!(handled[0].messages[0].payload, b"description");
        assert!(handled[0].messages[0].parsed.is_none());
    }

    #[tokio::test]
    async fn pair_installation_uses_one_off_key() {
        let alice = node();
        let bob = node();

        let raw = RawMessage::new("", MessageType::PairInstallation, b"not parsed".to_vec());
        let id = alice.sender.send_pair_installation(&bob.key(), raw).await.unwrap();

        let handled = deliver(&alice, &bob).await;
        assert_eq!(handled[0].messages[0].id, id);
        assert_eq!(handled[0].messages[0].payload, b"not parsed");
        assert!(bob.transport.negotiated_secrets().is_empty());
    }

    #[tokio::test]
    async fn group_send_runs_hook_once() {
        let alice = node();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut raw = chat("group");
        raw.before_dispatch = Some(Arc::new(move |_: &mut RawMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let recipients = [Identity::generate().public_key(), Identity::generate().public_key()];
        alice.sender.send_group(&recipients, raw).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(alice.transport.sends().len(), 2);
    }

    #[tokio::test]
    async fn personal_topic_skips_encryption() {
        let alice = node();
        let bob = node();

        let mut raw = chat("personal");
        raw.skip_encryption_layer = true;
        raw.send_on_personal_topic = true;
        alice.sender.send_private(&bob.key(), &mut raw).await.unwrap();
        assert_eq!(alice.transport.sends()[0].kind, SendKind::PersonalTopic(bob.key()));

        let handled = deliver(&alice, &bob).await;
        assert_eq!(text_of(&handled[0].messages[0]), "personal");
    }

    #[test]
    fn membership_update_encoding() {
        let creator = Identity::generate();
        let group = Group::create("friends", &creator, 1).unwrap();

        let full = MessageSender::encode_membership_update(&group, None).unwrap();
        let abridged = MessageSender::encode_abridged_membership_update(&group, None).unwrap();

        let parsed = application::parse_payload(MessageType::MembershipUpdate, &full).unwrap();
        match parsed {
            Some(ApplicationPayload::MembershipUpdate(update)) => {
                assert_eq!(update.chat_id, group.chat_id());
                assert_eq!(update.events, group.events());
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let parsed = application::parse_payload(MessageType::MembershipUpdate, &abridged).unwrap();
        match parsed {
            Some(ApplicationPayload::MembershipUpdate(update)) => {
                assert_eq!(update.events, group.abridged_events());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn junk_wire_is_a_transport_error() {
        let alice = node();
        assert!(matches!(
            alice.sender.handle_messages(b"junk").await,
            Err(SenderError::TransportParse(_))
        ));
    }

    #[tokio::test]
    async fn public_chat_join_and_round_trip() {
        let alice = node();
        let bob = node();
        bob.sender.join_public("status").await.unwrap();
        assert_eq!(bob.transport.joined(), vec!["status".to_string()]);

        let id = alice.sender.send_public("status", chat("broadcast")).await.unwrap();
        let handled = deliver(&alice, &bob).await;
        assert_eq!(handled[0].messages[0].id, id);
        assert_eq!(text_of(&handled[0].messages[0]), "broadcast");
    }
}
