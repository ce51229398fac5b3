//! 基础设施层
//!
//! 持有稀缺资源（外部服务的调用额度），只暴露能力

pub mod rate_limiter;

pub use rate_limiter::{Priority, RateLimiter, RateLimiterConfig, RateLimiterMetrics};

/// 代码托管 API 在限流器中的服务名
pub const HOSTING_SERVICE: &str = "hosting";
/// 补全 API 在限流器中的服务名
pub const COMPLETION_SERVICE: &str = "completion";
