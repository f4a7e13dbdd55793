pub mod controller;
pub mod source;
