pub mod backoff;
pub mod bus;
pub mod change;
pub mod download_cache;
pub mod engine;
mod engine_apply;
mod engine_run;
pub mod error;
pub mod index;
mod index_store_impl;
pub mod local_watcher;
pub mod paths;
pub mod policy;
mod protocol;
pub mod queue;
pub mod source;
pub mod status;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod test_support;
