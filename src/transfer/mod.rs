pub mod coordinator;
pub mod receiver;
pub mod send_window;
pub mod sender;
pub mod session;
