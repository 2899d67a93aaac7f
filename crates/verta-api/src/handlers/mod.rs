//! API handlers

pub mod chat;
pub mod feedback;
pub mod health;
pub mod retriever;
