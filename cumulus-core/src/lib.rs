mod client;
pub mod wire;

pub use client::{CallStatus, CumulusClient, CumulusError};
pub use wire::{
    ActionVerb, DEFAULT_SYNC_ID, EntryType, EventAction, EventStatus, FileVersion,
    MAX_EVENTS_PER_REQUEST, PendingList, PullRequest, PushRequest, SyncResponse, VersionList,
    WireEvent, WireMetadata,
};
