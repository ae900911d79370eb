pub mod frame;
pub mod control;
