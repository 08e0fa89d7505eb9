use crate::error::{Error, Result};
use crate::library::TrackStore;
use crate::model::Track;
use crate::storage::KeyValueStore;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

pub const ORDER_NAMESPACE: &str = "playlist";
pub const ORDER_KEY: &str = "shuffle_order";

/// Persisted shuffle order over the track store plus a play cursor.
///
/// `cursor == len()` means the cycle is exhausted: the next forward pull
/// draws and persists a fresh order first. Walking backwards wraps without
/// reshuffling.
pub struct ShuffleSequencer {
    tracks: TrackStore,
    store: Box<dyn KeyValueStore>,
    order: Vec<usize>,
    cursor: usize,
    current: usize,
    rng: SmallRng,
    degraded: bool,
}

impl ShuffleSequencer {
    pub fn initialize(tracks: TrackStore, store: Box<dyn KeyValueStore>) -> Self {
        Self::with_rng(tracks, store, SmallRng::from_rng(&mut rand::rng()))
    }

    pub fn with_rng(tracks: TrackStore, store: Box<dyn KeyValueStore>, rng: SmallRng) -> Self {
        let mut sequencer = Self {
            tracks,
            store,
            order: Vec::new(),
            cursor: 0,
            current: 0,
            rng,
            degraded: false,
        };
        sequencer.load_or_generate();
        sequencer
    }

    pub fn next(&mut self) -> Result<Track> {
        let count = self.tracks.len();
        if count == 0 {
            return Err(Error::Empty);
        }

        if self.cursor >= count {
            info!(count, "shuffle cycle complete, reshuffling");
            self.reshuffle();
        }

        self.current = self.cursor;
        self.cursor += 1;
        self.track_at(self.current)
    }

    pub fn previous(&mut self) -> Result<Track> {
        let count = self.tracks.len();
        if count == 0 {
            return Err(Error::Empty);
        }

        if self.cursor == 0 {
            self.cursor = count;
        }
        self.cursor -= 1;
        self.current = self.cursor;
        self.track_at(self.current)
    }

    /// Last track handed out, or the head of the order before any pull.
    pub fn current(&self) -> Result<Track> {
        if self.tracks.is_empty() {
            return Err(Error::Empty);
        }
        self.track_at(self.current)
    }

    /// Positions the cursor just past `identifier` so `next()` resumes
    /// after it.
    pub fn set_current_by_identity(&mut self, identifier: &str) -> Result<Track> {
        let index = self
            .tracks
            .find(identifier)
            .ok_or_else(|| Error::NotFound(identifier.to_string()))?;
        let position = self
            .order
            .iter()
            .position(|candidate| *candidate == index)
            .ok_or_else(|| Error::NotFound(identifier.to_string()))?;

        self.current = position;
        self.cursor = position + 1;
        self.track_at(position)
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.current = 0;
    }

    /// Re-enumerates the store and re-initializes the order against the
    /// new track count.
    pub fn rescan(&mut self) -> Result<usize> {
        let count = self.tracks.rescan()?;
        self.load_or_generate();
        Ok(count)
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn tracks(&self) -> &TrackStore {
        &self.tracks
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn track_at(&self, position: usize) -> Result<Track> {
        self.order
            .get(position)
            .and_then(|index| self.tracks.get(*index))
            .cloned()
            .ok_or(Error::Empty)
    }

    fn load_or_generate(&mut self) {
        let count = self.tracks.len();
        self.cursor = 0;
        self.current = 0;

        if count == 0 {
            warn!("no tracks found, nothing to shuffle");
            self.order.clear();
            return;
        }

        match self.load_order(count) {
            Ok(order) => {
                info!(count, "shuffle order loaded");
                self.order = order;
                return;
            }
            Err(Error::StorageFault(reason)) => {
                warn!(%reason, "persisted shuffle order unreachable");
            }
            Err(err) => debug!(%err, "no usable persisted shuffle order"),
        }

        self.reshuffle();
    }

    fn load_order(&self, count: usize) -> Result<Vec<usize>> {
        let raw = self.store.get(ORDER_NAMESPACE, ORDER_KEY)?;
        let order: Vec<usize> = serde_json::from_slice(&raw)
            .map_err(|err| Error::NotFound(format!("corrupt shuffle order: {err}")))?;
        if !is_permutation(&order, count) {
            return Err(Error::NotFound(format!(
                "persisted shuffle order does not cover {count} tracks"
            )));
        }
        Ok(order)
    }

    fn reshuffle(&mut self) {
        self.order = (0..self.tracks.len()).collect();
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
        self.current = 0;
        self.persist();
    }

    fn persist(&mut self) {
        let saved = serde_json::to_vec(&self.order)
            .map_err(|err| Error::StorageFault(err.to_string()))
            .and_then(|bytes| self.store.put(ORDER_NAMESPACE, ORDER_KEY, &bytes));

        match saved {
            Ok(()) => {
                if self.degraded {
                    info!("shuffle order persisted again, leaving degraded mode");
                }
                self.degraded = false;
                debug!(count = self.order.len(), "shuffle order saved");
            }
            Err(err) => {
                warn!(%err, "shuffle order kept in memory only (degraded mode)");
                self.degraded = true;
            }
        }
    }
}

fn is_permutation(order: &[usize], count: usize) -> bool {
    if order.len() != count {
        return false;
    }
    let mut seen = vec![false; count];
    for index in order {
        match seen.get_mut(*index) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prop_assert_eq;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn store_of(count: usize) -> TrackStore {
        TrackStore::from_tracks(
            (0..count)
                .map(|index| Track {
                    index,
                    path: PathBuf::from(format!("/sd/T{index}.mp3")),
                    name: format!("T{index}.mp3"),
                })
                .collect(),
        )
    }

    fn seeded(count: usize, kv: &MemoryStore, seed: u64) -> ShuffleSequencer {
        ShuffleSequencer::with_rng(
            store_of(count),
            Box::new(kv.clone()),
            SmallRng::seed_from_u64(seed),
        )
    }

    fn preloaded(order: &[usize]) -> (ShuffleSequencer, MemoryStore) {
        let mut kv = MemoryStore::new();
        kv.put(
            ORDER_NAMESPACE,
            ORDER_KEY,
            &serde_json::to_vec(order).expect("encode"),
        )
        .expect("seed order");
        (seeded(order.len(), &kv, 7), kv)
    }

    #[test]
    fn walks_loaded_order_with_previous_and_exhaustion() {
        let (mut seq, kv) = preloaded(&[2, 0, 1]);
        assert_eq!(seq.order(), &[2, 0, 1]);
        assert_eq!(seq.position(), 0);

        assert_eq!(seq.next().expect("next").name, "T2.mp3");
        assert_eq!(seq.position(), 1);
        assert_eq!(seq.next().expect("next").name, "T0.mp3");
        assert_eq!(seq.position(), 2);
        assert_eq!(seq.previous().expect("prev").name, "T0.mp3");
        assert_eq!(seq.position(), 1);
        assert_eq!(seq.next().expect("next").name, "T0.mp3");
        assert_eq!(seq.position(), 2);
        assert_eq!(seq.next().expect("next").name, "T1.mp3");
        assert_eq!(seq.position(), 3);

        assert_eq!(kv.writes(), 1, "only the seeding write so far");
        seq.next().expect("next after exhaustion");
        assert_eq!(kv.writes(), 2);
        assert_eq!(seq.position(), 1);
    }

    #[test]
    fn previous_before_any_next_wraps_to_last_without_reshuffle() {
        let (mut seq, kv) = preloaded(&[1, 3, 0, 2]);
        let writes = kv.writes();

        assert_eq!(seq.previous().expect("prev").name, "T2.mp3");
        assert_eq!(seq.position(), 3);
        assert_eq!(seq.order(), &[1, 3, 0, 2]);
        assert_eq!(kv.writes(), writes);
    }

    #[test]
    fn exhaustion_reshuffles_exactly_once() {
        let kv = MemoryStore::new();
        let mut seq = seeded(5, &kv, 42);
        assert_eq!(kv.writes(), 1, "first boot generates and persists");

        for _ in 0..5 {
            seq.next().expect("next");
        }
        assert_eq!(kv.writes(), 1);

        seq.next().expect("sixth next");
        assert_eq!(kv.writes(), 2);
        assert!(is_permutation(seq.order(), 5));

        let persisted: Vec<usize> =
            serde_json::from_slice(&kv.get(ORDER_NAMESPACE, ORDER_KEY).expect("get"))
                .expect("decode");
        assert_eq!(persisted, seq.order());
    }

    #[test]
    fn reloading_persisted_order_reproduces_it() {
        let kv = MemoryStore::new();
        let first = seeded(6, &kv, 3);
        let order = first.order().to_vec();
        drop(first);

        let mut second = seeded(6, &kv, 99);
        assert_eq!(second.order(), order.as_slice());
        let walked: Vec<usize> = (0..6).map(|_| second.next().expect("next").index).collect();
        assert_eq!(walked, order);
    }

    #[test]
    fn length_mismatch_regenerates() {
        let (_, kv) = preloaded(&[0, 1, 2]);
        let seq = seeded(4, &kv, 5);
        assert!(is_permutation(seq.order(), 4));
        assert_eq!(kv.writes(), 2);
    }

    #[test]
    fn corrupt_blob_regenerates() {
        let mut kv = MemoryStore::new();
        kv.put(ORDER_NAMESPACE, ORDER_KEY, b"[0,0,1]").expect("put");
        let seq = seeded(3, &kv, 5);
        assert!(is_permutation(seq.order(), 3));
        assert_eq!(kv.writes(), 2);
    }

    #[test]
    fn unreachable_storage_degrades_to_memory() {
        let kv = MemoryStore::unreachable();
        let mut seq = seeded(3, &kv, 1);
        assert!(seq.is_degraded());
        assert!(is_permutation(seq.order(), 3));
        for _ in 0..4 {
            seq.next().expect("next still works");
        }

        kv.set_unreachable(false);
        for _ in 0..3 {
            seq.next().expect("next");
        }
        assert!(!seq.is_degraded(), "next reshuffle persists again");
    }

    #[test]
    fn empty_store_reports_empty() {
        let kv = MemoryStore::new();
        let mut seq = seeded(0, &kv, 1);
        assert!(matches!(seq.next(), Err(Error::Empty)));
        assert!(matches!(seq.previous(), Err(Error::Empty)));
        assert!(matches!(seq.current(), Err(Error::Empty)));
        assert_eq!(kv.writes(), 0);
    }

    #[test]
    fn current_tracks_last_returned() {
        let (mut seq, _) = preloaded(&[2, 0, 1]);
        assert_eq!(seq.current().expect("head").name, "T2.mp3");
        seq.next().expect("next");
        seq.next().expect("next");
        assert_eq!(seq.current().expect("current").name, "T0.mp3");
        seq.previous().expect("prev");
        seq.previous().expect("prev");
        assert_eq!(seq.current().expect("current").name, "T2.mp3");
        assert_eq!(seq.position(), 0);
    }

    #[test]
    fn set_current_by_identity_resumes_after_track() {
        let (mut seq, _) = preloaded(&[2, 0, 1]);
        let selected = seq.set_current_by_identity("T0.mp3").expect("select");
        assert_eq!(selected.index, 0);
        assert_eq!(seq.position(), 2);
        assert_eq!(seq.current().expect("current").name, "T0.mp3");
        assert_eq!(seq.next().expect("next").name, "T1.mp3");

        assert!(matches!(
            seq.set_current_by_identity("missing.mp3"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn reshuffles_show_no_position_bias() {
        let kv = MemoryStore::new();
        let mut seq = seeded(4, &kv, 2024);
        let rounds = 4_000;
        let mut first_slot = [0_usize; 4];

        for _ in 0..rounds {
            // Every round after the first starts on an exhausted cursor.
            let head = seq.next().expect("head of cycle");
            first_slot[head.index] += 1;
            for _ in 1..4 {
                seq.next().expect("drain");
            }
        }
        assert_eq!(kv.writes(), rounds);

        let expected = rounds / 4;
        for count in first_slot {
            assert!(
                count.abs_diff(expected) < expected / 7,
                "first-slot counts {first_slot:?} deviate from {expected}"
            );
        }
    }

    proptest::proptest! {
        #[test]
        fn one_cycle_visits_every_track_once(count in 0usize..60, seed in 0u64..1_000) {
            let kv = MemoryStore::new();
            let mut seq = seeded(count, &kv, seed);
            let mut seen = HashSet::new();
            for _ in 0..count {
                let track = seq.next().expect("next");
                seen.insert(track.index);
            }
            prop_assert_eq!(seen.len(), count);
            prop_assert_eq!(seq.position(), count);
        }

        #[test]
        fn cursor_stays_in_bounds(ops in proptest::collection::vec(0u8..4, 1..200), count in 1usize..12) {
            let kv = MemoryStore::new();
            let mut seq = seeded(count, &kv, 11);
            for op in ops {
                match op {
                    0 => { seq.next().expect("next"); }
                    1 => { seq.previous().expect("prev"); }
                    2 => { seq.current().expect("current"); }
                    _ => { seq.set_current_by_identity("T0.mp3").expect("select"); }
                }
                proptest::prop_assert!(seq.position() <= count);
                proptest::prop_assert!(is_permutation(seq.order(), count));
            }
        }
    }
}
