pub mod agent;
pub mod config;
pub mod context;
pub mod http_client;
pub mod llm_client;
pub mod model;
pub mod response;
pub mod runtime;
pub mod server;
pub mod tools;
