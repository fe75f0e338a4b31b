//! Redis 后端实现
//! Redis backend implementation

pub mod redis_queue;
pub mod redis_scripts;
pub mod redis_store;

pub use redis_queue::RedisQueue;
pub use redis_store::RedisStore;
