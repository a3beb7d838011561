pub mod admin;
pub mod assets;
pub mod health;
pub mod queues;
pub mod sessions;
pub mod tasks;
