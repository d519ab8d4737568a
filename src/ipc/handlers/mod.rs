pub mod attendance;
pub mod auth;
pub mod catalog;
pub mod core;
pub mod grades;
pub mod groups;
pub mod offerings;
pub mod people;
pub mod periods;
pub mod reports;
