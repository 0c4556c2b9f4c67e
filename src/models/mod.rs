pub mod job;
pub mod proxy;
pub mod record;

pub use job::{CreateJob, Job, JobLogEntry, JobStatus, StatusUpdate};
pub use proxy::{FAILURE_THRESHOLD, Proxy, ProxyEndpoint};
pub use record::{ExtractedRecord, StoredRecord};
