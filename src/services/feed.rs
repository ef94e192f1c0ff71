//! Public task feed: OPEN, public tasks with filters, sorting and skill ranking

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::api::{Paginated, PaginationParams};
use crate::domain::{Task, TaskStatus, TaskWithOwner};
use crate::error::MarketResult;
use crate::store::{Collection, Direction, Filter, Query, Store, StoreExt};

use super::profiles;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedSort {
    #[default]
    CreatedAt,
    Budget,
    Deadline,
}

impl FeedSort {
    fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Budget => "budget",
            Self::Deadline => "deadline",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedParams {
    /// Case-insensitive substring of the subject
    pub subject: Option<String>,
    pub min_budget: Option<Decimal>,
    pub max_budget: Option<Decimal>,
    /// Only tasks due at or before this instant
    pub deadline: Option<DateTime<Utc>>,
    /// Matched against title and description
    pub search: Option<String>,
    #[serde(default)]
    pub sort: FeedSort,
    #[serde(default)]
    pub order: Option<Direction>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl FeedParams {
    pub fn pagination(&self) -> PaginationParams {
        PaginationParams {
            page: self.page,
            per_page: self.per_page,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Row filter of the feed. Also scopes the live feed subscription.
pub fn feed_filter(params: &FeedParams) -> Filter {
    let mut filter = Filter::eq("status", TaskStatus::Open.as_str())
        .and(Filter::eq("visibility", "public"));
    if let Some(subject) = non_blank(&params.subject) {
        filter = filter.and(Filter::contains("subject", subject));
    }
    if let Some(min) = params.min_budget {
        filter = filter.and(Filter::gte("budget", min));
    }
    if let Some(max) = params.max_budget {
        filter = filter.and(Filter::lte("budget", max));
    }
    if let Some(deadline) = params.deadline {
        filter = filter.and(Filter::lte("deadline", deadline));
    }
    if let Some(search) = non_blank(&params.search) {
        filter = filter.and(Filter::any(vec![
            Filter::contains("title", search),
            Filter::contains("description", search),
        ]));
    }
    filter
}

pub fn feed_query(params: &FeedParams) -> Query {
    Query::new(Collection::Tasks)
        .filter(feed_filter(params))
        .order_by(params.sort.column(), params.order.unwrap_or(Direction::Desc))
}

/// Subject matches weigh 3, title 2, description 1.
pub fn skill_score(task: &Task, skills: &[String]) -> u32 {
    let subject = task.subject.to_lowercase();
    let title = task.title.to_lowercase();
    let description = task.description.to_lowercase();
    skills
        .iter()
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
        .map(|skill| {
            let mut score = 0;
            if subject.contains(&skill) {
                score += 3;
            }
            if title.contains(&skill) {
                score += 2;
            }
            if description.contains(&skill) {
                score += 1;
            }
            score
        })
        .sum()
}

/// Order by skill score, highest first, then newest first.
pub fn rank_by_skills(tasks: &mut [Task], skills: &[String]) {
    if skills.is_empty() {
        return;
    }
    tasks.sort_by_cached_key(|t| {
        (
            std::cmp::Reverse(skill_score(t, skills)),
            std::cmp::Reverse(t.created_at),
        )
    });
}

/// One page of the feed. With `skills`, matching tasks rank first.
pub async fn public_feed(
    store: &dyn Store,
    params: &FeedParams,
    skills: &[String],
) -> MarketResult<Paginated<TaskWithOwner>> {
    let mut tasks: Vec<Task> = store.fetch(&feed_query(params)).await?;
    rank_by_skills(&mut tasks, skills);

    let pagination = params.pagination();
    let total = tasks.len() as u64;
    let page = pagination.window(tasks);

    let owners = profiles::summaries(store, page.iter().map(|t| t.owner_id)).await?;
    let rows = page
        .into_iter()
        .map(|task| TaskWithOwner {
            owner: owners.get(&task.owner_id).cloned(),
            task,
        })
        .collect();
    Ok(Paginated::new(rows, &pagination, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Visibility;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn task(title: &str, subject: &str, age_minutes: i64) -> Task {
        let at = Utc::now() - Duration::minutes(age_minutes);
        Task {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            subject: subject.into(),
            budget: Decimal::from(100),
            deadline: at + Duration::days(2),
            status: TaskStatus::Open,
            visibility: Visibility::Public,
            owner_id: Uuid::new_v4(),
            accepted_user_id: None,
            file_url: None,
            client_ref: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn feed_filter_excludes_closed_and_unlisted_rows() {
        let filter = feed_filter(&FeedParams {
            subject: Some("math".into()),
            min_budget: Some(Decimal::from(50)),
            ..Default::default()
        });
        let row = |status: &str, visibility: &str, budget: f64| {
            json!({ "status": status, "visibility": visibility, "subject": "Mathematics", "budget": budget })
        };

        assert!(filter.matches(&row("OPEN", "public", 80.0)));
        assert!(!filter.matches(&row("IN_PROGRESS", "public", 80.0)));
        assert!(!filter.matches(&row("OPEN", "unlisted", 80.0)));
        assert!(!filter.matches(&row("OPEN", "public", 20.0)));
    }

    #[test]
    fn skills_rank_subject_over_title() {
        let mut tasks = vec![
            task("Plain chores", "Cleaning", 1),
            task("Rust lexer help", "Programming", 2),
            task("Intro course", "Rust", 3),
        ];
        rank_by_skills(&mut tasks, &["rust".to_string()]);

        assert_eq!(tasks[0].subject, "Rust");
        assert_eq!(tasks[1].title, "Rust lexer help");
        assert_eq!(tasks[2].title, "Plain chores");
    }

    #[test]
    fn without_skills_order_is_untouched() {
        let mut tasks = vec![task("b", "x", 5), task("a", "x", 1)];
        rank_by_skills(&mut tasks, &[]);
        assert_eq!(tasks[0].title, "b");
    }
}
