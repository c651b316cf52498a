pub mod account;
pub mod actor;
pub mod courier;
pub mod offer;
pub mod order;
pub mod otp;
