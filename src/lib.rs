pub mod api;
pub mod app;
pub mod bot;
pub mod calendar;
pub mod cli;
pub mod config;
pub mod db;
pub mod global;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod webhook;
