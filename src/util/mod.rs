pub mod safe_converter;
pub mod worker_pool;
