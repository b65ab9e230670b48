//! In-memory gallery of enrolled templates with top-K ranking.
//!
//! Queries take the read lock and may run concurrently; enroll, remove and
//! close take the write lock. Indices are assigned sequentially from zero
//! and never reused, so removing one entry leaves every other index valid.

use crate::template::Template;
use crate::types::{Candidate, GalleryIndex};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GalleryError {
    #[error("gallery is closed")]
    Closed,
    #[error("no template enrolled at index {0}")]
    UnknownIndex(GalleryIndex),
    #[error("gallery lock poisoned by a panicked writer")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for GalleryError {
    fn from(_: PoisonError<T>) -> Self {
        GalleryError::Poisoned
    }
}

#[derive(Default)]
struct GalleryState {
    entries: BTreeMap<GalleryIndex, Template>,
    next_index: u64,
    closed: bool,
}

impl GalleryState {
    fn ensure_open(&self) -> Result<(), GalleryError> {
        if self.closed {
            Err(GalleryError::Closed)
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct Gallery {
    state: RwLock<GalleryState>,
}

impl Gallery {
    pub fn open() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GalleryState>, GalleryError> {
        let state = self.state.read()?;
        state.ensure_open()?;
        Ok(state)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GalleryState>, GalleryError> {
        let state = self.state.write()?;
        state.ensure_open()?;
        Ok(state)
    }

    /// Store a copy of `template` under the next sequential index.
    pub fn enroll(&self, template: &Template) -> Result<GalleryIndex, GalleryError> {
        let mut state = self.write()?;
        let index = GalleryIndex(state.next_index);
        state.next_index += 1;
        state.entries.insert(index, template.clone());
        tracing::trace!(%index, "template enrolled");
        Ok(index)
    }

    /// Release the template at `index`. Other indices are unaffected.
    pub fn remove(&self, index: GalleryIndex) -> Result<(), GalleryError> {
        let mut state = self.write()?;
        state
            .entries
            .remove(&index)
            .map(drop)
            .ok_or(GalleryError::UnknownIndex(index))
    }

    /// Copy of the template enrolled at `index`.
    pub fn at(&self, index: GalleryIndex) -> Result<Template, GalleryError> {
        let state = self.read()?;
        state
            .entries
            .get(&index)
            .cloned()
            .ok_or(GalleryError::UnknownIndex(index))
    }

    pub fn len(&self) -> Result<usize, GalleryError> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, GalleryError> {
        Ok(self.len()? == 0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().map(|s| s.closed).unwrap_or(true)
    }

    /// Rank every enrolled template against `probe`.
    ///
    /// Returns exactly `k` entries: candidates scoring at least
    /// `min_similarity`, best first, ties broken by lower index, then
    /// `None` for each position no candidate qualified for.
    pub fn search<F>(
        &self,
        probe: &Template,
        k: usize,
        min_similarity: f32,
        compare: F,
    ) -> Result<Vec<Option<Candidate>>, GalleryError>
    where
        F: Fn(&Template, &Template) -> f32,
    {
        let state = self.read()?;
        let scored = state
            .entries
            .iter()
            .map(|(&index, template)| Candidate {
                index,
                similarity: compare(probe, template),
            })
            .collect();
        Ok(rank(scored, k, min_similarity))
    }

    /// Close the gallery and release every enrolled template. Returns how
    /// many were released.
    pub fn close(&self) -> Result<usize, GalleryError> {
        let mut state = self.write()?;
        state.closed = true;
        let released = state.entries.len();
        state.entries.clear();
        tracing::debug!(released, "gallery closed");
        Ok(released)
    }
}

/// Order candidates for a top-`k` answer, padding with `None`.
pub fn rank(mut scored: Vec<Candidate>, k: usize, min_similarity: f32) -> Vec<Option<Candidate>> {
    // NaN never clears the threshold.
    scored.retain(|c| c.similarity >= min_similarity);
    scored.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.index.cmp(&b.index))
    });
    scored.truncate(k);

    let mut ranked: Vec<Option<Candidate>> = scored.into_iter().map(Some).collect();
    ranked.resize(k, None);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ResourceKind, ResourceLedger};
    use crate::template::{feature_similarity, TemplateRecord};
    use crate::types::CapabilitySet;
    use std::sync::Arc;

    fn template(ledger: &Arc<ResourceLedger>, features: Vec<f32>) -> Template {
        Template::new(
            TemplateRecord {
                stages: CapabilitySet::verification(),
                bounding_box: None,
                confidence: 1.0,
                attributes: Default::default(),
                features,
            },
            ledger.issue(ResourceKind::Template),
        )
    }

    fn by_features(a: &Template, b: &Template) -> f32 {
        feature_similarity(a.features(), b.features())
    }

    fn candidate(index: u64, similarity: f32) -> Candidate {
        Candidate {
            index: GalleryIndex(index),
            similarity,
        }
    }

    #[test]
    fn test_enroll_assigns_sequential_indices() {
        let ledger = ResourceLedger::new();
        let gallery = Gallery::open();
        let t = template(&ledger, vec![1.0, 0.0]);
        assert_eq!(gallery.enroll(&t).unwrap(), GalleryIndex(0));
        assert_eq!(gallery.enroll(&t).unwrap(), GalleryIndex(1));
        assert_eq!(gallery.len().unwrap(), 2);
        assert_eq!(ledger.live_templates(), 3);
    }

    #[test]
    fn test_removed_index_is_never_reused() {
        let ledger = ResourceLedger::new();
        let gallery = Gallery::open();
        let t = template(&ledger, vec![1.0]);
        let first = gallery.enroll(&t).unwrap();
        let second = gallery.enroll(&t).unwrap();
        gallery.remove(first).unwrap();

        assert_eq!(gallery.at(first).unwrap_err(), GalleryError::UnknownIndex(first));
        assert!(gallery.at(second).is_ok());
        assert_eq!(gallery.enroll(&t).unwrap(), GalleryIndex(2));
        assert_eq!(gallery.remove(first).unwrap_err(), GalleryError::UnknownIndex(first));
    }

    #[test]
    fn test_search_self_match_is_top_candidate() {
        let ledger = ResourceLedger::new();
        let gallery = Gallery::open();
        let faces = [
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.6, 0.8, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        for f in &faces {
            gallery.enroll(&template(&ledger, f.clone())).unwrap();
        }

        for (i, f) in faces.iter().enumerate() {
            let probe = template(&ledger, f.clone());
            let ranked = gallery.search(&probe, 3, 0.0, by_features).unwrap();
            let top = ranked[0].expect("top candidate");
            assert_eq!(top.index, GalleryIndex(i as u64));
            assert!((top.similarity - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_search_pads_with_none() {
        let ledger = ResourceLedger::new();
        let gallery = Gallery::open();
        gallery.enroll(&template(&ledger, vec![1.0, 0.0])).unwrap();
        gallery.enroll(&template(&ledger, vec![0.0, 1.0])).unwrap();

        let probe = template(&ledger, vec![1.0, 0.0]);
        let ranked = gallery.search(&probe, 5, 0.0, by_features).unwrap();
        assert_eq!(ranked.len(), 5);
        assert!(ranked[0].is_some());
        assert!(ranked[1].is_some());
        assert!(ranked[2..].iter().all(Option::is_none));
    }

    #[test]
    fn test_search_threshold_filters() {
        let ledger = ResourceLedger::new();
        let gallery = Gallery::open();
        gallery.enroll(&template(&ledger, vec![0.0, 1.0])).unwrap();
        gallery.enroll(&template(&ledger, vec![1.0, 0.0])).unwrap();

        let probe = template(&ledger, vec![1.0, 0.0]);
        let ranked = gallery.search(&probe, 2, 0.5, by_features).unwrap();
        assert_eq!(ranked[0].map(|c| c.index), Some(GalleryIndex(1)));
        assert_eq!(ranked[1], None);
    }

    #[test]
    fn test_search_empty_gallery() {
        let ledger = ResourceLedger::new();
        let gallery = Gallery::open();
        let probe = template(&ledger, vec![1.0]);
        assert_eq!(gallery.search(&probe, 3, 0.0, by_features).unwrap(), vec![None; 3]);
        assert!(gallery.search(&probe, 0, 0.0, by_features).unwrap().is_empty());
    }

    #[test]
    fn test_rank_ties_prefer_lower_index() {
        let ranked = rank(
            vec![candidate(4, 0.7), candidate(2, 0.9), candidate(1, 0.7), candidate(3, 0.9)],
            4,
            0.0,
        );
        let order: Vec<u64> = ranked.iter().map(|c| c.unwrap().index.0).collect();
        assert_eq!(order, vec![2, 3, 1, 4]);
    }

    #[test]
    fn test_rank_truncates_and_drops_nan() {
        let ranked = rank(
            vec![candidate(0, f32::NAN), candidate(1, 0.2), candidate(2, 0.8), candidate(3, 0.5)],
            2,
            0.0,
        );
        assert_eq!(ranked, vec![Some(candidate(2, 0.8)), Some(candidate(3, 0.5))]);
    }

    #[test]
    fn test_closed_gallery_rejects_everything() {
        let ledger = ResourceLedger::new();
        let gallery = Gallery::open();
        let t = template(&ledger, vec![1.0]);
        gallery.enroll(&t).unwrap();
        gallery.enroll(&t).unwrap();

        assert_eq!(gallery.close().unwrap(), 2);
        assert!(gallery.is_closed());
        assert_eq!(ledger.live_templates(), 1);

        assert_eq!(gallery.enroll(&t).unwrap_err(), GalleryError::Closed);
        assert_eq!(gallery.at(GalleryIndex(0)).unwrap_err(), GalleryError::Closed);
        assert_eq!(gallery.search(&t, 1, 0.0, by_features).unwrap_err(), GalleryError::Closed);
        assert_eq!(gallery.len().unwrap_err(), GalleryError::Closed);
        assert_eq!(gallery.close().unwrap_err(), GalleryError::Closed);
    }

    #[test]
    fn test_concurrent_queries_and_enrollment() {
        let ledger = ResourceLedger::new();
        let gallery = Arc::new(Gallery::open());
        gallery.enroll(&template(&ledger, vec![1.0, 0.0])).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gallery = Arc::clone(&gallery);
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        gallery.enroll(&template(&ledger, vec![0.0, 1.0])).unwrap();
                    } else {
                        let probe = template(&ledger, vec![1.0, 0.0]);
                        let ranked = gallery.search(&probe, 1, 0.0, by_features).unwrap();
                        assert_eq!(ranked[0].unwrap().index, GalleryIndex(0));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(gallery.len().unwrap(), 5);
        gallery.close().unwrap();
        assert!(ledger.is_quiescent());
    }
}
