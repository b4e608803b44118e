pub mod auth_service;
pub mod config;
pub mod identity;
mod orm;
pub mod pages;
pub mod post_repo;
pub mod post_service;
pub mod session;
pub mod uploads;
pub mod web;
