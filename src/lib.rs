pub mod config;
pub mod executor;
pub mod queue;
pub mod report;
pub mod routes;
pub mod rules;
pub mod sandbox;
pub mod scheduler;
pub mod staging;
pub mod web_server;
