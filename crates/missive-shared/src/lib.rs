pub mod application;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod group;
pub mod identity;
pub mod protocol;
pub mod raw_message;
pub mod segmentation;
pub mod types;
