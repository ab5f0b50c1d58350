pub mod engine;
pub mod observer;
pub mod snapshot;
pub mod state;

pub use engine::{classify, Change, Direction, SyncEngine, SyncOptions, SyncSummary};
pub use observer::{
    Conflict, ConflictKind, ConflictPolicy, PolicyObserver, Resolution, SyncEvent, SyncObserver,
};
pub use snapshot::{LocalEntry, RemoteEntry, RemoteTree, STATE_DIR_NAME};
pub use state::{RemoteFileState, StateDb};
