//! Kernel module - job infrastructure and dependencies.

pub mod handlers;
pub mod jobs;
pub mod jobs_kernel;
pub mod store;
pub mod tutor_client;

pub use handlers::TutorHandlers;
pub use jobs_kernel::{JobsKernel, JobsSettings};
pub use store::{ConnectionManager, MemoryJobStore, PostgresJobStore};
pub use tutor_client::{TutorClient, TutorClientError};
