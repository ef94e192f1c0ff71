//! Threaded task comments
//!
//! Deleting a comment removes its whole subtree; the store cascades on
//! `parent_id`.

use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::lifecycle::get_task;
use super::{client_ref_or_new, load, notifications, profiles};
use crate::auth::Actor;
use crate::domain::{Comment, CommentNode, CreateCommentRequest, ProfileSummary, UpdateCommentRequest};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, Query, Store, StoreExt};

const MAX_COMMENT_LEN: usize = 2000;

fn clean_comment(content: &str) -> MarketResult<String> {
    let content = content.trim();
    if content.is_empty() {
        return Err(MarketError::validation("comment must not be empty"));
    }
    if content.chars().count() > MAX_COMMENT_LEN {
        return Err(MarketError::validation(format!(
            "comment must be at most {MAX_COMMENT_LEN} characters"
        )));
    }
    Ok(content.to_string())
}

pub fn comments_query(task_id: Uuid) -> Query {
    Query::new(Collection::Comments)
        .filter(Filter::eq("task_id", task_id))
        .order_by("created_at", Direction::Asc)
}

/// Arrange a flat, creation-ordered list into trees. Comments whose parent is
/// not in the list are treated as roots.
pub fn build_thread(comments: Vec<Comment>, people: &HashMap<Uuid, ProfileSummary>) -> Vec<CommentNode> {
    let present: HashSet<Uuid> = comments.iter().map(|c| c.id).collect();
    let mut children: HashMap<Uuid, Vec<Comment>> = HashMap::new();
    let mut roots = Vec::new();
    for comment in comments {
        match comment.parent_id.filter(|p| present.contains(p)) {
            Some(parent) => children.entry(parent).or_default().push(comment),
            None => roots.push(comment),
        }
    }

    fn attach(
        comment: Comment,
        depth: usize,
        children: &mut HashMap<Uuid, Vec<Comment>>,
        people: &HashMap<Uuid, ProfileSummary>,
    ) -> CommentNode {
        let replies = children
            .remove(&comment.id)
            .unwrap_or_default()
            .into_iter()
            .map(|child| attach(child, depth + 1, children, people))
            .collect();
        CommentNode {
            author: people.get(&comment.user_id).cloned(),
            comment,
            depth,
            replies,
        }
    }

    roots
        .into_iter()
        .map(|root| attach(root, 0, &mut children, people))
        .collect()
}

/// Ids of every comment below `root`, deepest first.
pub fn descendants(comments: &[Comment], root: Uuid) -> Vec<Uuid> {
    let mut levels: Vec<Vec<Uuid>> = Vec::new();
    let mut frontier = vec![root];
    while !frontier.is_empty() {
        let next: Vec<Uuid> = comments
            .iter()
            .filter(|c| c.parent_id.map_or(false, |p| frontier.contains(&p)))
            .map(|c| c.id)
            .collect();
        if !next.is_empty() {
            levels.push(next.clone());
        }
        frontier = next;
    }
    levels.into_iter().rev().flatten().collect()
}

pub async fn list_comments(store: &dyn Store, task_id: Uuid) -> MarketResult<Vec<CommentNode>> {
    let task = get_task(store, task_id).await?;
    let comments: Vec<Comment> = store.fetch(&comments_query(task.id)).await?;
    let people = profiles::summaries(store, comments.iter().map(|c| c.user_id)).await?;
    Ok(build_thread(comments, &people))
}

pub fn provisional_comment(task_id: Uuid, actor: &Actor, req: CreateCommentRequest) -> MarketResult<Comment> {
    let now = Utc::now();
    Ok(Comment {
        id: Uuid::new_v4(),
        task_id,
        user_id: actor.id(),
        parent_id: req.parent_id,
        content: clean_comment(&req.content)?,
        client_ref: client_ref_or_new(req.client_ref),
        created_at: now,
        updated_at: now,
    })
}

pub async fn create_comment(
    store: &dyn Store,
    task_id: Uuid,
    actor: &Actor,
    req: CreateCommentRequest,
) -> MarketResult<Comment> {
    let comment = provisional_comment(task_id, actor, req)?;
    post_comment(store, actor, comment).await
}

pub async fn post_comment(store: &dyn Store, actor: &Actor, comment: Comment) -> MarketResult<Comment> {
    if !actor.is_active() {
        return Err(MarketError::forbidden("deactivated profiles cannot comment"));
    }
    let task = get_task(store, comment.task_id).await?;
    if let Some(parent_id) = comment.parent_id {
        let parent: Comment = load(store, Collection::Comments, parent_id, "Parent comment").await?;
        if parent.task_id != task.id {
            return Err(MarketError::validation("a reply must belong to the same task as its parent"));
        }
    }

    tracing::info!(actor_id = %actor.id(), task_id = %task.id, comment_id = %comment.id, "Posting comment");
    let saved: Comment = store.create(Collection::Comments, &comment).await?;
    if !task.is_owner(actor.id()) {
        notifications::notify_new_comment(store, &task, &actor.profile.username, saved.id).await;
    }
    Ok(saved)
}

pub async fn edit_comment(
    store: &dyn Store,
    comment_id: Uuid,
    actor: &Actor,
    req: UpdateCommentRequest,
) -> MarketResult<Comment> {
    let comment: Comment = load(store, Collection::Comments, comment_id, "Comment").await?;
    if comment.user_id != actor.id() {
        return Err(MarketError::forbidden("only the author can edit a comment"));
    }
    let content = clean_comment(&req.content)?;
    tracing::info!(actor_id = %actor.id(), comment_id = %comment.id, "Editing comment");
    Ok(store
        .patch(
            Collection::Comments,
            comment.id,
            json!({ "content": content, "updated_at": Utc::now() }),
            None,
        )
        .await?)
}

/// Delete a comment and its replies. Returns how many rows went away.
pub async fn delete_comment(store: &dyn Store, comment_id: Uuid, actor: &Actor) -> MarketResult<usize> {
    let comment: Comment = load(store, Collection::Comments, comment_id, "Comment").await?;
    if comment.user_id != actor.id() {
        return Err(MarketError::forbidden("only the author can delete a comment"));
    }

    let thread: Vec<Comment> = store.fetch(&comments_query(comment.task_id)).await?;
    let below = descendants(&thread, comment.id);
    tracing::info!(
        actor_id = %actor.id(),
        task_id = %comment.task_id,
        comment_id = %comment.id,
        replies = below.len(),
        "Deleting comment"
    );
    store.delete(Collection::Comments, comment.id, None).await?;
    Ok(below.len() + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{actor, market, open_task};
    use chrono::Duration;

    fn remark(text: &str, parent_id: Option<Uuid>) -> CreateCommentRequest {
        CreateCommentRequest {
            content: text.into(),
            parent_id,
            client_ref: None,
        }
    }

    #[tokio::test]
    async fn replies_must_stay_on_their_parents_task() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let (here, there) = (open_task(&store, &owner).await, open_task(&store, &owner).await);
        let root = create_comment(&store, here.id, &owner, remark("details?", None))
            .await
            .expect("root");

        let stray = create_comment(&store, there.id, &owner, remark("wrong thread", Some(root.id))).await;
        assert!(matches!(stray, Err(MarketError::Validation(_))));
        let orphan = create_comment(&store, here.id, &owner, remark("to nobody", Some(Uuid::new_v4()))).await;
        assert!(matches!(orphan, Err(MarketError::NotFound(_))));

        create_comment(&store, here.id, &owner, remark("see below", Some(root.id)))
            .await
            .expect("reply");
        let thread = list_comments(&store, here.id).await.expect("thread");
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].replies.len(), 1);
        assert_eq!(thread[0].author.as_ref().map(|a| a.username.as_str()), Some("owner"));
    }

    #[tokio::test]
    async fn only_the_author_edits_or_deletes() {
        let store = market();
        let (owner, other) = (actor(&store, "owner").await, actor(&store, "other").await);
        let task = open_task(&store, &owner).await;
        let mine = create_comment(&store, task.id, &other, remark("first", None))
            .await
            .expect("comment");

        let edit = UpdateCommentRequest { content: "hijacked".into() };
        let hijack = edit_comment(&store, mine.id, &owner, edit).await;
        assert!(matches!(hijack, Err(MarketError::Authorization(_))));
        let removal = delete_comment(&store, mine.id, &owner).await;
        assert!(matches!(removal, Err(MarketError::Authorization(_))));

        let edited = edit_comment(&store, mine.id, &other, UpdateCommentRequest { content: " second ".into() })
            .await
            .expect("edit");
        assert_eq!(edited.content, "second");
        assert!(edited.updated_at >= mine.updated_at);
    }

    #[tokio::test]
    async fn deleting_a_comment_takes_its_replies_along() {
        let store = market();
        let owner = actor(&store, "owner").await;
        let task = open_task(&store, &owner).await;
        let root = create_comment(&store, task.id, &owner, remark("root", None)).await.expect("root");
        let reply = create_comment(&store, task.id, &owner, remark("reply", Some(root.id)))
            .await
            .expect("reply");
        create_comment(&store, task.id, &owner, remark("nested", Some(reply.id)))
            .await
            .expect("nested");
        let kept = create_comment(&store, task.id, &owner, remark("separate", None))
            .await
            .expect("separate");

        assert_eq!(delete_comment(&store, root.id, &owner).await.expect("delete"), 3);
        let left: Vec<Comment> = store.fetch(&comments_query(task.id)).await.expect("comments");
        assert_eq!(left.iter().map(|c| c.id).collect::<Vec<_>>(), vec![kept.id]);
    }

    fn comment(id: Uuid, parent: Option<Uuid>, minutes: i64) -> Comment {
        let at = Utc::now() + Duration::minutes(minutes);
        Comment {
            id,
            task_id: Uuid::nil(),
            user_id: Uuid::nil(),
            parent_id: parent,
            content: "x".into(),
            client_ref: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn threads_nest_by_parent_and_keep_order() {
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let flat = vec![
            comment(a, None, 0),
            comment(b, Some(a), 1),
            comment(c, Some(b), 2),
            comment(d, None, 3),
        ];
        let tree = build_thread(flat, &HashMap::new());

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].comment.id, a);
        assert_eq!(tree[0].replies[0].comment.id, b);
        assert_eq!(tree[0].replies[0].replies[0].depth, 2);
        assert_eq!(tree[1].comment.id, d);
    }

    #[test]
    fn orphans_become_roots() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let tree = build_thread(vec![comment(a, Some(Uuid::new_v4()), 0), comment(b, Some(a), 1)], &HashMap::new());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].depth, 0);
        assert_eq!(tree[0].replies[0].comment.id, b);
    }

    #[test]
    fn descendants_are_listed_deepest_first() {
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let flat = vec![
            comment(a, None, 0),
            comment(b, Some(a), 1),
            comment(c, Some(b), 2),
            comment(d, None, 3),
        ];
        assert_eq!(descendants(&flat, a), vec![c, b]);
        assert!(descendants(&flat, d).is_empty());
    }

    #[test]
    fn blank_comments_are_rejected() {
        assert!(clean_comment("  ").is_err());
        assert_eq!(clean_comment(" ok ").unwrap(), "ok");
    }
}
