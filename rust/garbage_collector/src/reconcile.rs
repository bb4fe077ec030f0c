use std::collections::VecDeque;

use async_trait::async_trait;
use librarian_storage::ContentId;

/// The verdict on one id found in storage.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Classification {
    /// Whether the database knows the id.
    pub wanted: bool,
    /// Known ids passed over without being found in storage.
    pub missing: Vec<ContentId>,
}

/// Ids the database knows about, read in ascending pages. Each page is a
/// complete query, so nothing stays open between pages.
#[async_trait]
pub trait KnownIds: Send {
    type Error: Send;

    /// Up to `limit` known ids greater than `after`, in ascending order.
    async fn page_after(
        &mut self,
        after: Option<ContentId>,
        limit: usize,
    ) -> Result<Vec<ContentId>, Self::Error>;
}

/// Merges the ids found while walking a storage backend against the ids the
/// database knows about. Found ids must arrive in non-decreasing order; only
/// one page of known ids is held at a time.
pub struct Reconciler<K> {
    known: K,
    page_size: usize,
    page: VecDeque<ContentId>,
    last_fetched: Option<ContentId>,
    exhausted: bool,
    last_wanted: Option<ContentId>,
}

impl<K: KnownIds> Reconciler<K> {
    pub fn new(known: K, page_size: usize) -> Self {
        Reconciler {
            known,
            page_size: page_size.max(1),
            page: VecDeque::new(),
            last_fetched: None,
            exhausted: false,
            last_wanted: None,
        }
    }

    async fn peek_known(&mut self) -> Result<Option<ContentId>, K::Error> {
        if self.page.is_empty() && !self.exhausted {
            let page = self
                .known
                .page_after(self.last_fetched, self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.last_fetched = Some(*last);
            }
            self.page.extend(page);
        }
        Ok(self.page.front().copied())
    }

    pub async fn classify(&mut self, found: ContentId) -> Result<Classification, K::Error> {
        // Several entries may belong to one id, e.g. the segments of an object.
        if self.last_wanted == Some(found) {
            return Ok(Classification {
                wanted: true,
                missing: Vec::new(),
            });
        }
        let mut missing = Vec::new();
        while let Some(known) = self.peek_known().await? {
            if known > found {
                break;
            }
            self.page.pop_front();
            if known == found {
                self.last_wanted = Some(found);
                return Ok(Classification {
                    wanted: true,
                    missing,
                });
            }
            missing.push(known);
        }
        Ok(Classification {
            wanted: false,
            missing,
        })
    }

    /// The next known id that was never found. Call once storage is
    /// exhausted; every remaining known id is missing.
    pub async fn next_missing(&mut self) -> Result<Option<ContentId>, K::Error> {
        let next = self.peek_known().await?;
        self.page.pop_front();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::convert::Infallible;

    struct SortedIds {
        ids: Vec<ContentId>,
        pages_read: usize,
    }

    impl SortedIds {
        fn new(ids: Vec<ContentId>) -> Self {
            SortedIds { ids, pages_read: 0 }
        }
    }

    #[async_trait]
    impl KnownIds for SortedIds {
        type Error = Infallible;

        async fn page_after(
            &mut self,
            after: Option<ContentId>,
            limit: usize,
        ) -> Result<Vec<ContentId>, Infallible> {
            self.pages_read += 1;
            Ok(self
                .ids
                .iter()
                .copied()
                .filter(|id| after.map_or(true, |after| *id > after))
                .take(limit)
                .collect())
        }
    }

    #[test]
    fn test_classify_in_order() {
        block_on(async {
            let mut reconciler = Reconciler::new(SortedIds::new(vec![2, 4, 6, 8]), 3);
            assert_eq!(
                reconciler.classify(1).await.unwrap(),
                Classification {
                    wanted: false,
                    missing: vec![]
                }
            );
            assert_eq!(
                reconciler.classify(4).await.unwrap(),
                Classification {
                    wanted: true,
                    missing: vec![2]
                }
            );
            // A second entry for the same id, like an object segment.
            assert!(reconciler.classify(4).await.unwrap().wanted);
            assert_eq!(
                reconciler.classify(7).await.unwrap(),
                Classification {
                    wanted: false,
                    missing: vec![6]
                }
            );
            assert_eq!(reconciler.next_missing().await.unwrap(), Some(8));
            assert_eq!(reconciler.next_missing().await.unwrap(), None);
            // 2 4 6 | 8 (short page, so no third read)
            assert_eq!(reconciler.known.pages_read, 2);
        });
    }

    proptest! {
        #[test]
        fn test_reconciler_matches_set_difference(
            known in proptest::collection::btree_set(0i64..200, 0..60),
            found in proptest::collection::btree_set(0i64..200, 0..60),
            page_size in 1usize..8,
        ) {
            let (wanted, unwanted, missing) = block_on(async {
                let mut reconciler =
                    Reconciler::new(SortedIds::new(known.iter().copied().collect()), page_size);
                let mut wanted = BTreeSet::new();
                let mut unwanted = BTreeSet::new();
                let mut missing = BTreeSet::new();
                for id in &found {
                    let classification = reconciler.classify(*id).await.unwrap();
                    missing.extend(classification.missing);
                    if classification.wanted {
                        wanted.insert(*id);
                    } else {
                        unwanted.insert(*id);
                    }
                }
                while let Some(id) = reconciler.next_missing().await.unwrap() {
                    missing.insert(id);
                }
                (wanted, unwanted, missing)
            });
            prop_assert_eq!(wanted, known.intersection(&found).copied().collect::<BTreeSet<_>>());
            prop_assert_eq!(unwanted, found.difference(&known).copied().collect::<BTreeSet<_>>());
            prop_assert_eq!(missing, known.difference(&found).copied().collect::<BTreeSet<_>>());
        }
    }
}
