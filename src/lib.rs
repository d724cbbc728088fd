pub mod auth;
pub mod catalog;
pub mod config;
pub mod draft;
pub mod error;
pub mod exchange;
pub mod http;
pub mod machine;
pub mod review;
pub mod service;
pub mod store;
