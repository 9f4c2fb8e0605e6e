pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod hardware;
pub mod metrics;
pub mod modbus;
pub mod planner;
pub mod repo;
pub mod telemetry;
