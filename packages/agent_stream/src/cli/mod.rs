pub mod chat;
pub mod exec;
