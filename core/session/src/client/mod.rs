pub mod authorization;
pub mod decrypt;
pub mod encrypt;
