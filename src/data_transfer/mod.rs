pub mod channel;
pub mod connection_resolver;
pub mod engine;
pub mod mapper;
pub mod models;
pub mod planner;
pub mod result;
pub mod sink;

pub use channel::DataTransferChannel;
pub use connection_resolver::DataSourceRegistry;
pub use engine::{Engine, JobRunner, TaskRunner};
pub use models::{JobDescriptor, JobFile};
pub use result::{JobResult, JobSnapshot, TaskResult, TaskSnapshot};
