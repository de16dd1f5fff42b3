// Background jobs

pub mod unverify_loop;

pub use unverify_loop::{TickReport, UnverifyLoop};
