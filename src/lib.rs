pub mod agent;
pub mod api;
pub mod audit;
pub mod cancel;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod output;
pub mod paths;
pub mod resolver;
pub mod store;
pub mod workspace;
