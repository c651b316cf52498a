pub mod otp;
pub mod revocation;
