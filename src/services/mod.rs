//! 业务能力层
//!
//! 每个服务只提供一种能力，不关心流程顺序。

pub mod cache_store;
pub mod content_lifecycle;
pub mod markdown;
pub mod translator;

pub use cache_store::CacheStore;
pub use content_lifecycle::{ContentLifecycleManager, PrText, Publication};
pub use translator::Translator;
