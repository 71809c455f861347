/// The cache-through pipeline.
///
/// A cache core serves reads from its in-memory mapping and falls through to the backing
/// store on a miss; writes go to both. The supervisor owns the store connector and the cache
/// core, restarts whichever one fails, and rewires the cache to a restarted connector.
/// Think of it as a level 1 application cache in front of a level 2 store such as redis:
/// level 1 is closest to the app and the fastest, level 2 is the source of truth.
///
pub mod supervisor;
pub mod value;
pub mod worker;

pub use supervisor::{Child, Supervisor, SupervisorState, SupervisorStatus};
pub use value::{validate_key, Value};
pub use worker::{CacheHandle, Command, CorrelationId};
