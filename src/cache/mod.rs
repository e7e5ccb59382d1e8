// Bounded in-memory caching

// Public API - what other modules can use
pub use lru::LruCache;
pub use read_through::CachedStateReader;

// Internal modules
mod lru;
mod read_through;
