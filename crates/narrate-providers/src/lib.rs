pub mod http;
pub mod mock;
pub mod rate_limit;
pub mod reliable;

pub use http::{HttpEndpoint, HttpSynthesizer, HttpTranscriber};
pub use mock::{MockStudio, MockSynthesizer, MockTranscriber};
pub use rate_limit::RateLimiter;
pub use reliable::{ReliableConfig, ReliableProvider};
