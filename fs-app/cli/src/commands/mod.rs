pub mod clone;
pub mod mount;
