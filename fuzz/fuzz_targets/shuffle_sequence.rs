#![no_main]

use libfuzzer_sys::fuzz_target;
use sdtune::library::TrackStore;
use sdtune::model::Track;
use sdtune::sequencer::ShuffleSequencer;
use sdtune::storage::MemoryStore;
use std::path::PathBuf;

fuzz_target!(|data: &[u8]| {
    let Some((&first, ops)) = data.split_first() else {
        return;
    };
    let count = usize::from(first % 24);
    let tracks = (0..count)
        .map(|index| Track {
            index,
            path: PathBuf::from(format!("/sd/track_{index}.mp3")),
            name: format!("track_{index}.mp3"),
        })
        .collect();
    let store = MemoryStore::new();
    let mut sequencer =
        ShuffleSequencer::initialize(TrackStore::from_tracks(tracks), Box::new(store.clone()));

    for byte in ops {
        match byte % 6 {
            0 | 1 => {
                let _ = sequencer.next();
            }
            2 => {
                let _ = sequencer.previous();
            }
            3 => {
                let _ = sequencer.set_current_by_identity(&format!("track_{}.mp3", byte / 6));
            }
            4 => sequencer.reset(),
            _ => store.set_unreachable(byte & 0x80 != 0),
        }

        assert!(sequencer.position() <= count);
        let mut order = sequencer.order().to_vec();
        order.sort_unstable();
        assert!(order.iter().copied().eq(0..count));
    }
});
