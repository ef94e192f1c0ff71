//! Task attachments
//!
//! Files go to object storage; the task keeps a row per file with its
//! public URL.

use chrono::Utc;
use uuid::Uuid;

use super::lifecycle::{get_task, role_of};
use crate::auth::Actor;
use crate::domain::TaskAttachment;
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, ObjectStorage, Query, Store, StoreExt};

const ATTACHMENT_BUCKET: &str = "task-attachments";

/// Reduce a client-supplied file name to a safe storage path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub async fn upload_attachment(
    store: &dyn Store,
    objects: &dyn ObjectStorage,
    task_id: Uuid,
    actor: &Actor,
    upload: Upload,
    max_bytes: usize,
) -> MarketResult<TaskAttachment> {
    let task = get_task(store, task_id).await?;
    if role_of(&task, actor.id()).is_none() {
        return Err(MarketError::forbidden("only the task owner and the assigned worker can attach files"));
    }
    if upload.bytes.is_empty() {
        return Err(MarketError::validation("file is empty"));
    }
    if upload.bytes.len() > max_bytes {
        return Err(MarketError::validation(format!("file exceeds the {max_bytes} byte limit")));
    }

    let file_name = sanitize_file_name(&upload.file_name);
    let path = format!("{}/{}-{}", task.id, Uuid::new_v4(), file_name);
    let file_size = upload.bytes.len() as i64;
    let url = objects
        .upload(ATTACHMENT_BUCKET, &path, upload.bytes, &upload.content_type)
        .await?;

    let attachment = TaskAttachment {
        id: Uuid::new_v4(),
        task_id: task.id,
        file_url: url,
        file_name,
        file_type: upload.content_type,
        file_size,
        created_at: Utc::now(),
    };
    tracing::info!(
        actor_id = %actor.id(),
        task_id = %task.id,
        path = %path,
        size = file_size,
        "Attachment uploaded"
    );
    Ok(store.create(Collection::TaskAttachments, &attachment).await?)
}

pub async fn list_attachments(store: &dyn Store, task_id: Uuid) -> MarketResult<Vec<TaskAttachment>> {
    let task = get_task(store, task_id).await?;
    Ok(store
        .fetch(
            &Query::new(Collection::TaskAttachments)
                .filter(Filter::eq("task_id", task.id))
                .order_by("created_at", Direction::Asc),
        )
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\my report (v2).pdf"), "my_report__v2_.pdf");
        assert_eq!(sanitize_file_name("..."), "file");
    }
}
