pub mod auth;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod messages;
pub mod models;
pub mod presence;
pub mod rooms;
