pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod models;
pub mod prompts;
pub mod router;
pub mod transport;
