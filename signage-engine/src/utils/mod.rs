pub mod backoff;
pub mod filename;
pub mod fs;
