pub mod backend;
pub mod config;
pub mod feed;
pub mod fetch;
pub mod limits;
pub mod model;
pub mod observability;
pub mod parse;
pub mod tracker;
