//! Lazy, restartable pagination with per-pass deduplication.
//!
//! A [`PageStream`] walks one entity type's list endpoint page by page.
//! It holds no state beyond the pass it is driving: where to start is an
//! explicit parameter ([`PageStream::starting_at`]), which is how a resumed
//! run re-enters a phase at its checkpointed page.
//!
//! Each page request goes through the shared [`RetryPolicy`]; the client
//! underneath spends one rate-limiter token per attempt.
//!
//! Items keep their position on the page (`index`) so the orchestrator can
//! checkpoint "page N, item K" precisely. Ids already seen in this pass are
//! dropped, which absorbs adjacent-page overlap when records shift under
//! concurrent writes. Records that move the other way (past the cursor)
//! are not detectable here.
//!
//! The pass ends on the first empty page, on the page the source marks as
//! last, or on a page shorter than the requested page size.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SyncError;
use crate::models::{raw_id, EntityType, RawEntity};
use crate::retry::RetryPolicy;
use crate::source::SourceApi;

/// One list item in page order.
#[derive(Debug)]
pub struct FetchedItem {
    /// Position on the page, counting every raw item.
    pub index: usize,
    /// Source id as sent, when one could be read.
    pub raw_id: Option<String>,
    pub entity: Result<RawEntity, SyncError>,
}

#[derive(Debug)]
pub struct FetchedPage {
    pub entity: EntityType,
    pub page: u32,
    /// Raw item count, duplicates included.
    pub len: usize,
    pub items: Vec<FetchedItem>,
    /// Items dropped because their id was already yielded in this pass.
    pub duplicates: usize,
    /// Items dropped because they were not newer than `since`.
    pub stale: usize,
}

pub struct PageStream<'a> {
    source: &'a dyn SourceApi,
    retry: RetryPolicy,
    cancel: CancellationToken,
    entity: EntityType,
    since: Option<DateTime<Utc>>,
    page_size: usize,
    next_page: u32,
    seen: HashSet<String>,
    done: bool,
}

impl<'a> PageStream<'a> {
    pub fn new(
        source: &'a dyn SourceApi,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
        page_size: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            retry,
            cancel,
            entity,
            since,
            page_size: page_size.max(1),
            next_page: 1,
            seen: HashSet::new(),
            done: false,
        }
    }

    /// Start the pass at `page` instead of page 1.
    pub fn starting_at(mut self, page: u32) -> Self {
        self.next_page = page.max(1);
        self
    }

    /// Fetch, parse and deduplicate the next page. `Ok(None)` ends the pass.
    ///
    /// Errors are those the retry policy gave up on: non-retryable
    /// statuses, `Exhausted`, or `Cancelled`.
    pub async fn next_page(&mut self) -> Result<Option<FetchedPage>, SyncError> {
        if self.done {
            return Ok(None);
        }
        let page = self.next_page;
        let (source, entity, since) = (self.source, self.entity, self.since);
        let what = format!("fetch {} page {}", entity, page);
        let fetched = self
            .retry
            .run(&what, &self.cancel, |_| source.fetch_page(entity, page, since))
            .await?;

        let len = fetched.items.len();
        if len == 0 {
            self.done = true;
            return Ok(None);
        }

        let last_marked = fetched.total_pages.is_some_and(|t| page >= t);
        if last_marked || len < self.page_size {
            self.done = true;
        }
        self.next_page = page + 1;

        let mut items = Vec::with_capacity(len);
        let mut duplicates = 0;
        let mut stale = 0;
        for (index, value) in fetched.items.into_iter().enumerate() {
            let id = raw_id(&value);
            if let Some(id) = &id {
                if !self.seen.insert(id.clone()) {
                    duplicates += 1;
                    continue;
                }
            }
            let parsed = RawEntity::parse(entity, value);
            if let (Ok(e), Some(since)) = (&parsed, since) {
                if e.updated_at() <= since {
                    stale += 1;
                    continue;
                }
            }
            items.push(FetchedItem {
                index,
                raw_id: id,
                entity: parsed,
            });
        }

        debug!(
            entity = %entity,
            page,
            len,
            duplicates,
            stale,
            total_pages = ?fetched.total_pages,
            "fetched page"
        );
        Ok(Some(FetchedPage {
            entity,
            page,
            len,
            items,
            duplicates,
            stale,
        }))
    }
}

/// Document ids of every record of `entity`, without building documents.
pub async fn list_doc_ids(
    source: &dyn SourceApi,
    entity: EntityType,
    page_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<Vec<String>, SyncError> {
    let mut stream = PageStream::new(source, entity, None, page_size, retry, cancel);
    let mut ids = Vec::new();
    while let Some(page) = stream.next_page().await? {
        ids.extend(
            page.items
                .iter()
                .filter_map(|item| item.raw_id.as_deref())
                .map(|id| format!("{}{}", entity.doc_prefix(), id)),
        );
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Comment;
    use crate::source::{SourceIdentity, SourcePage};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Serves fixed pages and records which pages were requested.
    struct Pages {
        pages: Vec<SourcePage>,
        requested: Mutex<Vec<u32>>,
        fail_first: Mutex<u32>,
    }

    impl Pages {
        fn new(pages: Vec<Vec<serde_json::Value>>, total: Option<u32>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|items| SourcePage {
                        items,
                        total_pages: total,
                    })
                    .collect(),
                requested: Mutex::new(Vec::new()),
                fail_first: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceApi for Pages {
        async fn fetch_page(
            &self,
            _entity: EntityType,
            page: u32,
            _since: Option<DateTime<Utc>>,
        ) -> Result<SourcePage, SyncError> {
            self.requested.lock().unwrap().push(page);
            {
                let mut fails = self.fail_first.lock().unwrap();
                if *fails > 0 {
                    *fails -= 1;
                    return Err(SyncError::Server {
                        status: 502,
                        body: String::new(),
                    });
                }
            }
            Ok(self
                .pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default())
        }

        async fn ticket_comments(&self, _: u64) -> Result<Vec<Comment>, SyncError> {
            Ok(Vec::new())
        }

        async fn check(&self) -> Result<SourceIdentity, SyncError> {
            Ok(SourceIdentity::default())
        }
    }

    fn customer(id: u64, day: u32) -> serde_json::Value {
        json!({"id": id, "firstname": format!("C{}", id),
               "updated_at": format!("2024-01-{:02}T00:00:00Z", day)})
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        }
    }

    async fn drain(stream: &mut PageStream<'_>) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(page) = stream.next_page().await.unwrap() {
            for item in page.items {
                ids.push(item.entity.unwrap().id());
            }
        }
        ids
    }

    #[tokio::test]
    async fn overlapping_pages_yield_each_id_once() {
        let src = Pages::new(
            vec![
                vec![customer(1, 1), customer(2, 1), customer(3, 1)],
                vec![customer(3, 1), customer(4, 1), customer(5, 1)],
                vec![customer(6, 1)],
            ],
            None,
        );
        let mut s = PageStream::new(
            &src,
            EntityType::Customer,
            None,
            3,
            retry(),
            CancellationToken::new(),
        );
        assert_eq!(drain(&mut s).await, vec![1, 2, 3, 4, 5, 6]);
        // short third page ends the pass without asking for page 4
        assert_eq!(*src.requested.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn duplicate_keeps_page_positions() {
        let src = Pages::new(
            vec![
                vec![customer(1, 1), customer(2, 1)],
                vec![customer(2, 1), customer(3, 1)],
            ],
            Some(2),
        );
        let mut s = PageStream::new(
            &src,
            EntityType::Customer,
            None,
            2,
            retry(),
            CancellationToken::new(),
        );
        s.next_page().await.unwrap();
        let p2 = s.next_page().await.unwrap().unwrap();
        assert_eq!(p2.len, 2);
        assert_eq!(p2.duplicates, 1);
        assert_eq!(p2.items.len(), 1);
        assert_eq!(p2.items[0].index, 1);
        // total_pages marker ends the pass
        assert!(s.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_page_ends_pass() {
        let src = Pages::new(vec![vec![customer(1, 1)], vec![]], None);
        let mut s = PageStream::new(
            &src,
            EntityType::Customer,
            None,
            1,
            retry(),
            CancellationToken::new(),
        );
        assert_eq!(drain(&mut s).await, vec![1]);
        assert_eq!(*src.requested.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn restarts_from_explicit_page() {
        let src = Pages::new(
            vec![
                vec![customer(1, 1), customer(2, 1)],
                vec![customer(3, 1), customer(4, 1)],
                vec![customer(5, 1)],
            ],
            None,
        );
        let mut s = PageStream::new(
            &src,
            EntityType::Customer,
            None,
            2,
            retry(),
            CancellationToken::new(),
        )
        .starting_at(2);
        assert_eq!(drain(&mut s).await, vec![3, 4, 5]);
        assert_eq!(*src.requested.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn malformed_items_surface_in_place() {
        let src = Pages::new(
            vec![vec![
                customer(1, 1),
                json!({"id": 2, "updated_at": "garbage"}),
            ]],
            Some(1),
        );
        let mut s = PageStream::new(
            &src,
            EntityType::Customer,
            None,
            25,
            retry(),
            CancellationToken::new(),
        );
        let page = s.next_page().await.unwrap().unwrap();
        assert!(page.items[0].entity.is_ok());
        assert!(matches!(
            page.items[1].entity,
            Err(SyncError::Malformed { .. })
        ));
        assert_eq!(page.items[1].raw_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn since_drops_records_not_newer() {
        let src = Pages::new(vec![vec![customer(1, 1), customer(2, 5)]], Some(1));
        let since = "2024-01-01T00:00:00Z".parse().unwrap();
        let mut s = PageStream::new(
            &src,
            EntityType::Customer,
            Some(since),
            25,
            retry(),
            CancellationToken::new(),
        );
        let page = s.next_page().await.unwrap().unwrap();
        assert_eq!(page.stale, 1);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_page_errors_are_retried() {
        let src = Pages::new(vec![vec![customer(1, 1)]], Some(1));
        *src.fail_first.lock().unwrap() = 2;
        let mut s = PageStream::new(
            &src,
            EntityType::Customer,
            None,
            25,
            retry(),
            CancellationToken::new(),
        );
        assert_eq!(drain(&mut s).await, vec![1]);
        assert_eq!(*src.requested.lock().unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn lists_prefixed_ids() {
        let src = Pages::new(vec![vec![customer(7, 1), customer(8, 1)]], Some(1));
        let ids = list_doc_ids(
            &src,
            EntityType::Customer,
            25,
            retry(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(ids, vec!["rs_customer_7", "rs_customer_8"]);
    }
}
