mod lru;

pub use lru::LruContentStore;
