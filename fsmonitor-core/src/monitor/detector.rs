//! Change detection against the last recorded event
//!
//! Pure decision logic: no I/O, no locks, safe to call concurrently for
//! different paths. Callers decide whether `Unchanged` results are worth
//! surfacing; the detector always reports them.

use crate::monitor::{EventType, FileEvent};
use crate::storage::FileMetadata;

/// Decide what kind of event a freshly observed file represents.
///
/// Rules, in order:
/// 1. no prior event for the path: `Added`
/// 2. prior event was `Deleted`: `Added` (the path reappeared)
/// 3. checksum or last-modified timestamp differs: `Changed`
/// 4. otherwise: `Unchanged`
pub fn determine_event_type(
    last: Option<&FileEvent>,
    current: &FileMetadata,
    checksum: &str,
) -> EventType {
    let Some(last) = last else {
        return EventType::Added;
    };
    if last.event_type == EventType::Deleted {
        return EventType::Added;
    }
    if last.checksum != checksum || last.modified != Some(current.modified) {
        return EventType::Changed;
    }
    EventType::Unchanged
}
