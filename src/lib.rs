pub mod archive;
pub mod config;
pub mod db;
pub mod model;
pub mod outbox;
pub mod purge;
pub mod retention;
pub mod writer;
