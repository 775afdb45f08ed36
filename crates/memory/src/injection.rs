//! Per-context memory injection.
//!
//! Pinned and auto-retrieved memories have separate caps. Capping only
//! bounds what is surfaced into a prompt; nothing is deleted.

use crate::bank::{MemoryBank, MemoryQuery, ScoredMemory};
use canopy_core::Result;
use canopy_core::memory::{MemoryItem, MemoryScope};
use canopy_core::tree::FolderMemorySettings;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionLimits {
    pub max_pinned: usize,
    pub max_auto: usize,
}

impl Default for InjectionLimits {
    fn default() -> Self {
        Self {
            max_pinned: 16,
            max_auto: 8,
        }
    }
}

/// The memories chosen for one context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryInjection {
    pub pinned: Vec<MemoryItem>,
    pub retrieved: Vec<ScoredMemory>,
}

impl MemoryInjection {
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty() && self.retrieved.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pinned.len() + self.retrieved.len()
    }

    /// Pinned items first, then retrieved items in rank order.
    pub fn items(&self) -> impl Iterator<Item = &MemoryItem> {
        self.pinned.iter().chain(self.retrieved.iter().map(|s| &s.item))
    }
}

/// Build the retrieval query a folder's memory settings describe. Trees
/// outside any folder search user-scoped memories only.
pub fn query_for_folder(
    query: &str,
    folder_id: Option<&str>,
    settings: &FolderMemorySettings,
    now: DateTime<Utc>,
) -> MemoryQuery {
    let mut q = MemoryQuery::new(query, settings.top_k).with_tags(settings.tags.iter().cloned());
    match folder_id {
        Some(folder_id) => {
            q = q.with_scope(MemoryScope::Folder {
                folder_id: folder_id.to_string(),
            });
            if settings.include_user_scope {
                q = q.with_scope(MemoryScope::User);
            }
        }
        None => q = q.with_scope(MemoryScope::User),
    }
    // an age past chrono's range means no lower bound
    let oldest = settings
        .max_age_days
        .and_then(|days| Duration::try_days(i64::from(days)))
        .and_then(|age| now.checked_sub_signed(age));
    if oldest.is_some() {
        q = q.with_time_range(oldest, None);
    }
    q
}

/// Pick the memories for one context: active pinned items in pin order up
/// to `max_pinned`, then search results not already pinned up to
/// `max_auto`. A blank query retrieves nothing automatically.
pub async fn select_injection(
    bank: &MemoryBank,
    pinned_ids: &[String],
    query: &MemoryQuery,
    limits: InjectionLimits,
) -> Result<MemoryInjection> {
    let pinned: Vec<MemoryItem> = bank
        .get_by_ids(pinned_ids)
        .await?
        .into_iter()
        .filter(MemoryItem::is_active)
        .take(limits.max_pinned)
        .collect();

    let mut retrieved = Vec::new();
    if limits.max_auto > 0 && !query.query.trim().is_empty() {
        let pinned_set: HashSet<&str> = pinned_ids.iter().map(String::as_str).collect();
        let mut widened = query.clone();
        widened.top_k = query.top_k.min(limits.max_auto) + pinned_set.len();
        retrieved = bank
            .search(&widened)
            .await?
            .into_iter()
            .filter(|s| !pinned_set.contains(s.item.id.as_str()))
            .take(query.top_k.min(limits.max_auto))
            .collect();
    }

    debug!(pinned = pinned.len(), retrieved = retrieved.len(), "Selected memories for context");
    Ok(MemoryInjection { pinned, retrieved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::event::EventBus;
    use canopy_store::SqliteStore;

    async fn bank() -> MemoryBank {
        MemoryBank::new(SqliteStore::new("sqlite::memory:").await.unwrap(), EventBus::default())
    }

    async fn add(bank: &MemoryBank, text: &str) -> MemoryItem {
        bank.upsert(MemoryItem::new(MemoryScope::User, text)).await.unwrap()
    }

    #[tokio::test]
    async fn caps_apply_separately_and_pins_win() {
        let bank = bank().await;
        let mut items = Vec::new();
        for i in 0..5 {
            items.push(add(&bank, &format!("python fact {i}")).await);
        }
        let pinned_ids = vec![items[0].id.clone(), items[1].id.clone(), items[2].id.clone()];
        let limits = InjectionLimits { max_pinned: 2, max_auto: 2 };

        let injection = select_injection(&bank, &pinned_ids, &MemoryQuery::new("python", 10), limits)
            .await
            .unwrap();
        assert_eq!(injection.pinned.len(), 2);
        assert_eq!(injection.retrieved.len(), 2);
        assert!(injection.retrieved.iter().all(|s| !pinned_ids.contains(&s.item.id)));
        assert_eq!(injection.len(), 4);
        assert_eq!(injection.items().next().map(|i| i.id.as_str()), Some(items[0].id.as_str()));
    }

    #[tokio::test]
    async fn archived_pins_and_blank_queries_are_skipped() {
        let bank = bank().await;
        let a = add(&bank, "likes jazz").await;
        bank.archive(&a.id).await.unwrap();
        let injection = select_injection(&bank, &[a.id.clone()], &MemoryQuery::new("", 8), InjectionLimits::default())
            .await
            .unwrap();
        assert!(injection.is_empty());
    }

    #[test]
    fn folder_query_scopes_and_age() {
        let now = Utc::now();
        let settings = FolderMemorySettings {
            max_age_days: Some(30),
            include_user_scope: false,
            tags: vec!["work".into()],
            ..Default::default()
        };
        let q = query_for_folder("deadline", Some("f1"), &settings, now);
        assert_eq!(q.scopes, vec![MemoryScope::Folder { folder_id: "f1".into() }]);
        assert_eq!(q.tags, vec!["work"]);
        assert_eq!(q.time_from, Some(now - Duration::days(30)));
        assert_eq!(q.top_k, settings.top_k);

        let q = query_for_folder("x", None, &FolderMemorySettings::default(), now);
        assert_eq!(q.scopes, vec![MemoryScope::User]);
        assert!(q.time_from.is_none());
    }

    #[test]
    fn huge_max_age_means_no_lower_bound() {
        let settings = FolderMemorySettings {
            max_age_days: Some(u32::MAX),
            ..Default::default()
        };
        let q = query_for_folder("tea", Some("f"), &settings, Utc::now());
        assert!(q.time_from.is_none());
        assert!(q.time_to.is_none());
    }
}
