pub mod auth;
pub mod health;
pub mod realtime;
pub mod rest;
