//! Relay boundary between the remote client, the local network and the
//! message store.
//!
//! Inbound: dedup window first, translation only for unseen events, then the
//! durable mapping. Outbound: per-account send lock around the remote send
//! and the mapping write, so the remote echo of our own message always finds
//! the mapping (or the dedup entry) in place.

use crate::dedup::{ChatKey, DedupRegistry, Deduplicator, LocalRef, Reconcile};
use crate::send_lock::AccountSendSerializer;
use crate::CoreError;
use async_trait::async_trait;
use relaybridge_db::{messages, DbPool};
use relaybridge_models::event::RemoteEvent;
use relaybridge_models::message::MessageRecord;
use std::future::Future;
use std::sync::Arc;

/// Converts a remote event into a local one and posts it.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Post `event` into `room_id` and return the mapping to persist.
    async fn translate(
        &self,
        event: &RemoteEvent,
        room_id: &str,
        space: i64,
    ) -> Result<MessageRecord, CoreError>;
}

#[derive(Debug, Clone)]
pub struct InboundContext {
    pub chat: ChatKey,
    pub room_id: String,
    /// Fingerprint by content; required where remote ids are not unique per
    /// event.
    pub force_hash: bool,
    /// Set when the event was sent by a bridged account, so the handler waits
    /// for any outbound send of that account to finish registering.
    pub own_account: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Bridged(MessageRecord),
    /// Already bridged (or being bridged) as the given local identity.
    Duplicate(LocalRef),
    /// Bridged, but another writer finalized the dedup entry first. The caller
    /// decides which side to keep.
    Superseded { record: MessageRecord, winner: LocalRef },
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat: ChatKey,
    pub local_event_id: String,
    pub local_room_id: String,
    pub sender_local_id: Option<String>,
    pub account: Option<i64>,
    pub require_lock: bool,
    pub force_hash: bool,
}

#[derive(Clone)]
pub struct Bridge {
    pool: DbPool,
    dedup: DedupRegistry,
    send_locks: Arc<AccountSendSerializer>,
}

impl Bridge {
    pub fn new(pool: DbPool, dedup: DedupRegistry, send_locks: Arc<AccountSendSerializer>) -> Self {
        Self {
            pool,
            dedup,
            send_locks,
        }
    }

    pub fn send_locks(&self) -> &Arc<AccountSendSerializer> {
        &self.send_locks
    }

    pub fn dedup(&self) -> &DedupRegistry {
        &self.dedup
    }

    pub async fn relay_inbound<T>(
        &self,
        ctx: &InboundContext,
        event: &RemoteEvent,
        translator: &T,
    ) -> Result<InboundOutcome, CoreError>
    where
        T: Translator + ?Sized,
    {
        let _guard = self.send_locks.acquire(ctx.own_account, false).await?;
        let dedup = self.dedup.for_chat(ctx.chat.0).await;
        let pending = LocalRef::pending(ctx.room_id.as_str(), ctx.chat.1);
        if let Some(previous) = dedup.check(event, pending.clone(), ctx.force_hash) {
            tracing::debug!(
                chat_id = ctx.chat.0,
                remote_msg_id = event.id,
                "dedup: dropping duplicate event"
            );
            if previous.space != ctx.chat.1 {
                self.mirror_into_space(event, ctx.chat.1, &previous).await?;
            }
            return Ok(InboundOutcome::Duplicate(previous));
        }

        let record = translator.translate(event, &ctx.room_id, ctx.chat.1).await?;
        messages::put(&self.pool, &record).await?;
        Ok(Self::settle(&dedup, ctx, event, record, &pending, ctx.force_hash))
    }

    /// Store a new revision of an already bridged remote message. The edit
    /// index is allocated by the store. Edits are always fingerprinted by
    /// content, so `event.date` should carry the edit time.
    pub async fn relay_edit<T>(
        &self,
        ctx: &InboundContext,
        event: &RemoteEvent,
        translator: &T,
    ) -> Result<InboundOutcome, CoreError>
    where
        T: Translator + ?Sized,
    {
        let _guard = self.send_locks.acquire(ctx.own_account, false).await?;
        let dedup = self.dedup.for_chat(ctx.chat.0).await;
        let pending = LocalRef::pending(ctx.room_id.as_str(), ctx.chat.1);
        if let Some(previous) = dedup.check(event, pending.clone(), true) {
            tracing::debug!(
                chat_id = ctx.chat.0,
                remote_msg_id = event.id,
                "dedup: dropping duplicate edit"
            );
            return Ok(InboundOutcome::Duplicate(previous));
        }

        let record = translator.translate(event, &ctx.room_id, ctx.chat.1).await?;
        let edit_index = messages::put_next_edit(&self.pool, &record).await?;
        let record = record.with_edit_index(edit_index);
        Ok(Self::settle(&dedup, ctx, event, record, &pending, true))
    }

    /// Replace the provisional dedup value with the bridged identity.
    fn settle(
        dedup: &Deduplicator<LocalRef>,
        ctx: &InboundContext,
        event: &RemoteEvent,
        record: MessageRecord,
        pending: &LocalRef,
        force_hash: bool,
    ) -> InboundOutcome {
        let bridged = LocalRef::new(
            record.local_event_id.as_str(),
            record.local_room_id.as_str(),
            record.space,
        );
        match dedup.reconcile(event, bridged, pending, force_hash) {
            Reconcile::Replaced | Reconcile::Missing => InboundOutcome::Bridged(record),
            Reconcile::Conflict(winner) => {
                tracing::warn!(
                    chat_id = ctx.chat.0,
                    remote_msg_id = event.id,
                    "dedup: event finalized concurrently"
                );
                InboundOutcome::Superseded { record, winner }
            }
        }
    }

    /// A message already bridged through another space's stream: map this
    /// space's remote id onto the same local event.
    async fn mirror_into_space(
        &self,
        event: &RemoteEvent,
        space: i64,
        previous: &LocalRef,
    ) -> Result<(), CoreError> {
        let Some(local_event_id) = previous.event_id.as_deref() else {
            tracing::debug!(
                remote_msg_id = event.id,
                space,
                "dedup: duplicate still in flight in another space"
            );
            return Ok(());
        };
        let record = MessageRecord::new(event.id, space, local_event_id, previous.room_id.as_str());
        if messages::put_if_absent(&self.pool, &record).await? {
            tracing::debug!(
                remote_msg_id = event.id,
                space,
                from_space = previous.space,
                "dedup: mapped duplicate into second space"
            );
        }
        Ok(())
    }

    /// Returns `true` the first time a service action is seen in a chat.
    pub async fn accept_action(&self, chat: ChatKey, event: &RemoteEvent) -> bool {
        !self.dedup.for_chat(chat.0).await.check_action(event)
    }

    /// Send a local message to the remote network under the account's send
    /// lock. `send` returns the remote network's copy of the message.
    ///
    /// The dedup entry and the mapping are written before the lock is
    /// released. A failed send leaves no state behind.
    pub async fn relay_outbound<F, Fut>(
        &self,
        msg: &OutboundMessage,
        send: F,
    ) -> Result<MessageRecord, CoreError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<RemoteEvent, CoreError>> + Send,
    {
        let guard = self.send_locks.acquire(msg.account, msg.require_lock).await?;
        let sent = match send().await {
            Ok(sent) => sent,
            Err(e) => {
                drop(guard);
                return Err(e);
            }
        };

        let local = LocalRef::new(msg.local_event_id.as_str(), msg.local_room_id.as_str(), msg.chat.1);
        let dedup = self.dedup.for_chat(msg.chat.0).await;
        if let Some(previous) = dedup.check(&sent, local, msg.force_hash) {
            tracing::warn!(
                remote_msg_id = sent.id,
                previous = ?previous.event_id,
                "dedup: outbound message already registered"
            );
        }

        let record = MessageRecord::new(
            sent.id,
            msg.chat.1,
            msg.local_event_id.as_str(),
            msg.local_room_id.as_str(),
        )
        .with_sender(msg.sender_local_id.clone(), sent.sender_id);
        let stored = messages::put(&self.pool, &record).await;
        drop(guard);
        stored?;
        Ok(record)
    }

    /// Swap a provisional local id once the real local event exists.
    pub async fn finish_placeholder(
        &self,
        old_local_id: &str,
        new_local_id: &str,
        local_room_id: &str,
    ) -> Result<u64, CoreError> {
        Ok(messages::replace_placeholder(&self.pool, old_local_id, new_local_id, local_room_id).await?)
    }

    pub async fn relay_redaction(&self, local_event_id: &str, local_room_id: &str) -> Result<u64, CoreError> {
        Ok(messages::mark_redacted(&self.pool, local_event_id, local_room_id).await?)
    }
}
