//! Task chat between the owner and the assigned worker
//!
//! A task's thread opens once a worker is accepted. Messages are append-only.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::lifecycle::{get_task, role_of};
use super::{client_ref_or_new, notifications, profiles};
use crate::auth::Actor;
use crate::domain::{Message, MessageWithSender, SendMessageRequest, Task, TaskStatus};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, Query, Store, StoreExt};

const MAX_MESSAGE_LEN: usize = 4000;

pub(crate) fn clean_content(content: &str, file_url: Option<&str>) -> MarketResult<String> {
    let content = content.trim();
    if content.is_empty() && file_url.is_none() {
        return Err(MarketError::validation("message must not be empty"));
    }
    if content.chars().count() > MAX_MESSAGE_LEN {
        return Err(MarketError::validation(format!(
            "message must be at most {MAX_MESSAGE_LEN} characters"
        )));
    }
    Ok(content.to_string())
}

/// The thread is readable and writable by task participants once the task has left OPEN.
pub fn check_participant(task: &Task, actor_id: Uuid) -> MarketResult<()> {
    if role_of(task, actor_id).is_none() {
        return Err(MarketError::forbidden("only the task owner and the assigned worker can chat"));
    }
    if task.status == TaskStatus::Open {
        return Err(MarketError::conflict("chat opens once a bid is accepted"));
    }
    Ok(())
}

pub fn messages_query(task_id: Uuid) -> Query {
    Query::new(Collection::Messages)
        .filter(Filter::eq("task_id", task_id))
        .order_by("created_at", Direction::Asc)
}

pub async fn list_messages(
    store: &dyn Store,
    task_id: Uuid,
    actor: &Actor,
) -> MarketResult<Vec<MessageWithSender<Message>>> {
    let task = get_task(store, task_id).await?;
    check_participant(&task, actor.id())?;

    let messages: Vec<Message> = store.fetch(&messages_query(task.id)).await?;
    let people = profiles::summaries(store, messages.iter().map(|m| m.sender_id)).await?;
    Ok(messages
        .into_iter()
        .map(|message| MessageWithSender {
            sender: people.get(&message.sender_id).cloned(),
            message,
        })
        .collect())
}

pub fn provisional_message(task_id: Uuid, actor: &Actor, req: SendMessageRequest) -> MarketResult<Message> {
    let content = clean_content(&req.content, req.file_url.as_deref())?;
    Ok(Message {
        id: Uuid::new_v4(),
        task_id,
        sender_id: actor.id(),
        content,
        file_url: req.file_url,
        client_ref: client_ref_or_new(req.client_ref),
        created_at: Utc::now(),
    })
}

pub async fn send_message(
    store: &dyn Store,
    task_id: Uuid,
    actor: &Actor,
    req: SendMessageRequest,
) -> MarketResult<Message> {
    let message = provisional_message(task_id, actor, req)?;
    post_message(store, actor, message).await
}

/// Store an already-built message after checking the sender still participates.
pub async fn post_message(store: &dyn Store, actor: &Actor, message: Message) -> MarketResult<Message> {
    let task = get_task(store, message.task_id).await?;
    check_participant(&task, actor.id())?;

    tracing::info!(actor_id = %actor.id(), task_id = %task.id, message_id = %message.id, "Sending task message");
    let saved: Message = store.create(Collection::Messages, &message).await?;

    let recipient = if task.is_owner(actor.id()) {
        task.accepted_user_id
    } else {
        Some(task.owner_id)
    };
    if let Some(recipient) = recipient {
        notifications::notify_new_message(
            store,
            recipient,
            &actor.profile.username,
            json!({ "task_id": task.id, "message_id": saved.id }),
        )
        .await;
    }
    Ok(saved)
}
