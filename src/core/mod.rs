//! Core types and host-boundary abstractions shared by the pipeline and the
//! affiliate engine.

pub mod cookies;
pub mod random;
pub mod reqwest_transport;
pub mod storage;
pub mod timing;
pub mod transport;
pub mod types;

pub use cookies::{CookieJar, MemoryCookieJar, SetCookie};
pub use random::{RandomSource, SequenceRandom, ThreadRandom};
pub use reqwest_transport::ReqwestTransport;
pub use storage::{KeyValueStore, MemoryStore, RedbStore, StorageError};
pub use timing::{FireDelay, RetryPolicy};
pub use transport::{Transport, TransportError, is_success};
pub use types::{Classification, Event, PageContext, Properties};
