pub mod dispatch_job_repo;

pub use dispatch_job_repo::DispatchJobRepo;
