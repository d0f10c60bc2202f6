//! Write-ahead-log replay.
//!
//! Recovery feeds the machine the persisted prefix as `LoadEntry` events in
//! index order, then `CompleteInitialization`. The resulting machine matches
//! the persisted projection of the one that wrote the log; in-flight sends
//! are re-issued when initialization completes.

use conclave_core::{Event, EventList, WalStorage};
use std::io;

/// Build the replay event sequence for a persisted log.
pub fn replay_events(wal: &dyn WalStorage) -> io::Result<EventList> {
    let mut events = EventList::new();
    wal.load_all(&mut |index, entry| {
        events.push(Event::LoadEntry {
            index,
            entry: entry.clone(),
        });
    })?;
    events.push(Event::CompleteInitialization);
    Ok(events)
}
