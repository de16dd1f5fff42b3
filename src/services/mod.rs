// Services module - Business logic

pub mod discord;
pub mod gateway;
pub mod permission_diff;
pub mod reason;
pub mod restorer;
pub mod revoker;
