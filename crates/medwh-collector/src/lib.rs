pub mod collect;
pub mod error;
pub mod http_source;
pub mod media;
pub mod normalize;
pub(crate) mod rate_limit;
pub mod source;
pub mod staging;
pub mod types;

pub use collect::{collect_pass, CollectSettings, CollectedPass, Window};
pub use error::CollectorError;
pub use http_source::HttpMessageSource;
pub use normalize::normalize_message;
pub use rate_limit::RateLimitBudget;
pub use source::MessageSource;
pub use staging::{partitions_modified_since, read_staged_file, stage_pass, staged_path};
pub use types::{MediaPayload, MessagePage};
