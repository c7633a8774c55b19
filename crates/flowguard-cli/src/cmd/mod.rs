pub mod config;
pub mod evaluate;
pub mod feature;
pub mod init;
pub mod learned;
pub mod state;
pub mod suggest;
pub mod task;
