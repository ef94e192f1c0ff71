//! Domain types and DTOs
//!
//! Entities mirror the store rows one-to-one. Request DTOs carry only what a
//! caller may choose; ids, timestamps and statuses are assigned by services.

pub mod activity;
pub mod bids;
pub mod comments;
pub mod likes;
pub mod messages;
pub mod notifications;
pub mod profiles;
pub mod ratings;
pub mod tasks;

pub use activity::*;
pub use bids::*;
pub use comments::*;
pub use likes::*;
pub use messages::*;
pub use notifications::*;
pub use profiles::*;
pub use ratings::*;
pub use tasks::*;
