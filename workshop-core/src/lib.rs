mod cache;
mod client;
mod de;
mod page;
mod rate_limit;

pub use cache::TtlCache;
pub use client::{
    BatchDetails, CatalogClient, CatalogEntry, CatalogError, FILE_TYPE_COLLECTION, RESULT_FILE_NOT_FOUND,
    RESULT_OK, RetryPolicy, Tag, VISIBILITY_PUBLIC,
};
pub use page::{child_item_ids, has_container_markup};
pub use rate_limit::RateLimiter;
