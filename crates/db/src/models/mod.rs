pub mod dispatch_job;
