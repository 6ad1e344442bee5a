pub use self::keyed_mutex::{KeyedMutex, KeyedMutexGuard};

mod keyed_mutex;
