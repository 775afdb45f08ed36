pub mod chat;
pub mod context;
pub mod folder;
pub mod init;
pub mod memory;
pub mod models;
pub mod serve;
pub mod tree;
