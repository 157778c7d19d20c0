//! Advisory events emitted by the snapshot pipeline. Subscribers may
//! lag or disappear; dropping events never affects correctness.

use crate::Digest;

#[derive(Clone, Debug)]
pub enum Event {
    PathError { snapshot_id: Digest, pathname: String, message: String },
    FileOk { snapshot_id: Digest, pathname: String, size: u64 },
    DirectoryOk { snapshot_id: Digest, pathname: String },
    Done { snapshot_id: Digest },
}

pub type EventSender = crossbeam_channel::Sender<Event>;
pub type EventReceiver = crossbeam_channel::Receiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    crossbeam_channel::unbounded()
}

/// Best-effort send; a gone subscriber is not an error.
pub(crate) fn emit(events: &Option<EventSender>, event: Event) {
    if let Some(sender) = events {
        let _ = sender.send(event);
    }
}
