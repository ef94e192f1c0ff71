//! Direct messages between two users
//!
//! A conversation has exactly two participants and at most one exists per
//! unordered pair; lookup and creation are one store procedure.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use super::chat::clean_content;
use super::{client_ref_or_new, load, notifications, profiles};
use crate::auth::Actor;
use crate::domain::{
    Conversation, ConversationParticipant, ConversationSummary, DirectMessage, MessageWithSender,
    SendMessageRequest, StartConversationRequest,
};
use crate::error::{MarketError, MarketResult};
use crate::store::{decode, Collection, Direction, Filter, Procedure, Query, Store, StoreExt};

pub async fn start_conversation(
    store: &dyn Store,
    actor: &Actor,
    req: StartConversationRequest,
) -> MarketResult<Conversation> {
    if req.user_id == actor.id() {
        return Err(MarketError::validation("you cannot message yourself"));
    }
    let other = profiles::get_profile(store, req.user_id).await?;
    if !other.is_active() {
        return Err(MarketError::forbidden("this user is no longer active"));
    }

    let row = store
        .transaction(Procedure::GetOrCreateConversation {
            user_a: actor.id(),
            user_b: other.id,
            task_id: req.task_id,
        })
        .await?;
    let conversation: Conversation = decode(row)?;
    tracing::info!(
        actor_id = %actor.id(),
        conversation_id = %conversation.id,
        other_user_id = %other.id,
        "Conversation opened"
    );
    Ok(conversation)
}

/// The actor's participant row, or Authorization if they are not a member.
pub async fn membership(
    store: &dyn Store,
    conversation_id: Uuid,
    actor_id: Uuid,
) -> MarketResult<ConversationParticipant> {
    let query = Query::new(Collection::ConversationParticipants).filter(
        Filter::eq("conversation_id", conversation_id).and(Filter::eq("user_id", actor_id)),
    );
    match store.fetch_one(&query).await? {
        Some(participant) => Ok(participant),
        None => {
            // Distinguish a missing conversation from one the actor is not in
            let _: Conversation = load(store, Collection::Conversations, conversation_id, "Conversation").await?;
            Err(MarketError::forbidden("you are not a participant in this conversation"))
        }
    }
}

pub fn direct_messages_query(conversation_id: Uuid) -> Query {
    Query::new(Collection::DirectMessages)
        .filter(Filter::eq("conversation_id", conversation_id))
        .order_by("created_at", Direction::Asc)
}

/// The actor's inbox, most recently active first
pub async fn list_conversations(store: &dyn Store, actor: &Actor) -> MarketResult<Vec<ConversationSummary>> {
    let mine: Vec<ConversationParticipant> = store
        .fetch(&Query::new(Collection::ConversationParticipants).filter(Filter::eq("user_id", actor.id())))
        .await?;
    if mine.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = mine.iter().map(|p| p.conversation_id).collect();
    let last_read: HashMap<Uuid, _> = mine.iter().map(|p| (p.conversation_id, p.last_read_at)).collect();

    let conversations: Vec<Conversation> = store
        .fetch(
            &Query::new(Collection::Conversations)
                .filter(Filter::is_in("id", ids.iter().copied()))
                .order_by("updated_at", Direction::Desc),
        )
        .await?;
    let others: Vec<ConversationParticipant> = store
        .fetch(
            &Query::new(Collection::ConversationParticipants).filter(
                Filter::is_in("conversation_id", ids.iter().copied())
                    .and(Filter::neq("user_id", actor.id())),
            ),
        )
        .await?;
    let other_of: HashMap<Uuid, Uuid> = others.iter().map(|p| (p.conversation_id, p.user_id)).collect();
    let people = profiles::summaries(store, other_of.values().copied()).await?;

    let messages: Vec<DirectMessage> = store
        .fetch(
            &Query::new(Collection::DirectMessages)
                .filter(Filter::is_in("conversation_id", ids.iter().copied()))
                .order_by("created_at", Direction::Asc),
        )
        .await?;
    let mut by_conversation: HashMap<Uuid, Vec<DirectMessage>> = HashMap::new();
    for message in messages {
        by_conversation.entry(message.conversation_id).or_default().push(message);
    }

    Ok(conversations
        .into_iter()
        .map(|conversation| {
            let thread = by_conversation.remove(&conversation.id).unwrap_or_default();
            let read_at = last_read.get(&conversation.id).copied();
            let unread_count = thread
                .iter()
                .filter(|m| m.sender_id != actor.id())
                .filter(|m| read_at.map_or(true, |at| m.created_at > at))
                .count();
            ConversationSummary {
                other_user: other_of.get(&conversation.id).and_then(|id| people.get(id).cloned()),
                last_message: thread.into_iter().last(),
                unread_count,
                conversation,
            }
        })
        .collect())
}

pub async fn list_direct_messages(
    store: &dyn Store,
    conversation_id: Uuid,
    actor: &Actor,
) -> MarketResult<Vec<MessageWithSender<DirectMessage>>> {
    membership(store, conversation_id, actor.id()).await?;
    let messages: Vec<DirectMessage> = store.fetch(&direct_messages_query(conversation_id)).await?;
    let people = profiles::summaries(store, messages.iter().map(|m| m.sender_id)).await?;
    Ok(messages
        .into_iter()
        .map(|message| MessageWithSender {
            sender: people.get(&message.sender_id).cloned(),
            message,
        })
        .collect())
}

pub fn provisional_direct_message(
    conversation_id: Uuid,
    actor: &Actor,
    req: SendMessageRequest,
) -> MarketResult<DirectMessage> {
    let content = clean_content(&req.content, None)?;
    Ok(DirectMessage {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id: actor.id(),
        content,
        is_read: false,
        client_ref: client_ref_or_new(req.client_ref),
        created_at: Utc::now(),
    })
}

pub async fn send_direct_message(
    store: &dyn Store,
    conversation_id: Uuid,
    actor: &Actor,
    req: SendMessageRequest,
) -> MarketResult<DirectMessage> {
    let message = provisional_direct_message(conversation_id, actor, req)?;
    post_direct_message(store, actor, message).await
}

pub async fn post_direct_message(
    store: &dyn Store,
    actor: &Actor,
    message: DirectMessage,
) -> MarketResult<DirectMessage> {
    let conversation_id = message.conversation_id;
    membership(store, conversation_id, actor.id()).await?;

    tracing::info!(
        actor_id = %actor.id(),
        conversation_id = %conversation_id,
        message_id = %message.id,
        "Sending direct message"
    );
    let saved: DirectMessage = store.create(Collection::DirectMessages, &message).await?;

    // Inbox ordering follows the latest message
    if let Err(e) = store
        .update(
            Collection::Conversations,
            conversation_id,
            json!({ "updated_at": saved.created_at }),
            None,
        )
        .await
    {
        tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to bump conversation");
    }

    notify_participants(store, actor, &saved).await;
    Ok(saved)
}

/// The message is saved by now; a failed lookup only costs the notification.
async fn notify_participants(store: &dyn Store, actor: &Actor, saved: &DirectMessage) {
    let conversation_id = saved.conversation_id;
    let query = Query::new(Collection::ConversationParticipants).filter(
        Filter::eq("conversation_id", conversation_id).and(Filter::neq("user_id", actor.id())),
    );
    let others: Vec<ConversationParticipant> = match store.fetch(&query).await {
        Ok(others) => others,
        Err(e) => {
            tracing::warn!(
                conversation_id = %conversation_id,
                message_id = %saved.id,
                error = %e,
                "Could not load participants to notify"
            );
            return;
        }
    };
    for other in others {
        notifications::notify_new_message(
            store,
            other.user_id,
            &actor.profile.username,
            json!({ "conversation_id": conversation_id, "message_id": saved.id }),
        )
        .await;
    }
}

/// Mark everything the other participant sent as read. Returns how many
/// messages changed.
pub async fn mark_read(store: &dyn Store, conversation_id: Uuid, actor: &Actor) -> MarketResult<usize> {
    let me = membership(store, conversation_id, actor.id()).await?;
    let now = Utc::now();
    store
        .update(
            Collection::ConversationParticipants,
            me.id,
            json!({ "last_read_at": now }),
            None,
        )
        .await?;

    let unread: Vec<DirectMessage> = store
        .fetch(
            &Query::new(Collection::DirectMessages).filter(
                Filter::eq("conversation_id", conversation_id)
                    .and(Filter::neq("sender_id", actor.id()))
                    .and(Filter::eq("is_read", false)),
            ),
        )
        .await?;
    for message in &unread {
        store
            .update(Collection::DirectMessages, message.id, json!({ "is_read": true }), None)
            .await?;
    }
    tracing::debug!(actor_id = %actor.id(), conversation_id = %conversation_id, count = unread.len(), "Conversation read");
    Ok(unread.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{actor, market, FlakyReads};

    fn say(text: &str) -> SendMessageRequest {
        SendMessageRequest {
            content: text.into(),
            file_url: None,
            client_ref: None,
        }
    }

    async fn open_between(store: &dyn Store, me: &Actor, other: &Actor) -> Conversation {
        start_conversation(store, me, StartConversationRequest { user_id: other.id(), task_id: None })
            .await
            .expect("conversation")
    }

    #[tokio::test]
    async fn one_conversation_per_pair_and_members_only() {
        let store = market();
        let (ann, ben, cat) = (
            actor(&store, "ann").await,
            actor(&store, "ben").await,
            actor(&store, "cat").await,
        );
        let first = open_between(&store, &ann, &ben).await;
        let again = open_between(&store, &ben, &ann).await;
        assert_eq!(first.id, again.id);

        assert!(membership(&store, first.id, ann.id()).await.is_ok());
        let outsider = membership(&store, first.id, cat.id()).await;
        assert!(matches!(outsider, Err(MarketError::Authorization(_))));
        let missing = membership(&store, Uuid::new_v4(), ann.id()).await;
        assert!(matches!(missing, Err(MarketError::NotFound(_))));

        let sent = send_direct_message(&store, first.id, &cat, say("hi both")).await;
        assert!(matches!(sent, Err(MarketError::Authorization(_))));
        let read = list_direct_messages(&store, first.id, &cat).await;
        assert!(matches!(read, Err(MarketError::Authorization(_))));
    }

    #[tokio::test]
    async fn self_conversations_are_refused() {
        let store = market();
        let ann = actor(&store, "ann").await;
        let result = start_conversation(&store, &ann, StartConversationRequest { user_id: ann.id(), task_id: None }).await;
        assert!(matches!(result, Err(MarketError::Validation(_))));
    }

    #[tokio::test]
    async fn unread_counts_follow_mark_read() {
        let store = market();
        let (ann, ben) = (actor(&store, "ann").await, actor(&store, "ben").await);
        let conversation = open_between(&store, &ann, &ben).await;

        send_direct_message(&store, conversation.id, &ann, say("one")).await.expect("send");
        send_direct_message(&store, conversation.id, &ann, say("two")).await.expect("send");

        let inbox = list_conversations(&store, &ben).await.expect("inbox");
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].unread_count, 2);
        assert_eq!(inbox[0].last_message.as_ref().map(|m| m.content.as_str()), Some("two"));
        assert_eq!(inbox[0].other_user.as_ref().map(|u| u.username.as_str()), Some("ann"));
        // the sender has nothing unread
        assert_eq!(list_conversations(&store, &ann).await.expect("inbox")[0].unread_count, 0);

        assert_eq!(mark_read(&store, conversation.id, &ben).await.expect("read"), 2);
        assert_eq!(list_conversations(&store, &ben).await.expect("inbox")[0].unread_count, 0);
        assert_eq!(mark_read(&store, conversation.id, &ben).await.expect("read again"), 0);

        let thread = list_direct_messages(&store, conversation.id, &ben).await.expect("thread");
        assert!(thread.iter().all(|m| m.message.is_read));
    }

    #[tokio::test]
    async fn posting_a_message_tells_the_other_participant() {
        let store = market();
        let (ann, ben) = (actor(&store, "ann").await, actor(&store, "ben").await);
        let conversation = open_between(&store, &ann, &ben).await;

        let message = provisional_direct_message(conversation.id, &ann, say("ping")).expect("valid");
        let saved = post_direct_message(&store, &ann, message.clone()).await.expect("posted");
        assert_eq!(saved.client_ref, message.client_ref);

        let notes: Vec<crate::domain::Notification> = store
            .fetch(&Query::new(Collection::Notifications).filter(Filter::eq("user_id", ben.id())))
            .await
            .expect("notifications");
        assert_eq!(notes.len(), 1);
        assert!(store
            .fetch::<crate::domain::Notification>(
                &Query::new(Collection::Notifications).filter(Filter::eq("user_id", ann.id()))
            )
            .await
            .expect("notifications")
            .is_empty());
    }

    #[tokio::test]
    async fn saved_message_stands_when_the_participant_lookup_fails() {
        let flaky = FlakyReads::new(market());
        let (ann, ben) = (actor(&flaky.inner, "ann").await, actor(&flaky.inner, "ben").await);
        let conversation = open_between(&flaky.inner, &ann, &ben).await;

        flaky.arm();
        let saved = send_direct_message(&flaky, conversation.id, &ann, say("still here"))
            .await
            .expect("saved message is reported as sent");
        let stored: DirectMessage = flaky.inner.get(Collection::DirectMessages, saved.id).await.expect("row");
        assert_eq!(stored.content, "still here");
    }
}
