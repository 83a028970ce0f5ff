pub mod agent;
pub mod aggregator;
pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod rate_limit;
pub mod session;
pub mod validation;
