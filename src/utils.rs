pub mod cache;
pub mod customisation;
pub mod fetch;
pub mod hashing;
pub mod perf;
pub mod tracker;
pub mod validation;
