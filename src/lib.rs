pub mod app;
pub mod batch;
pub mod common;
pub mod shutdown;
