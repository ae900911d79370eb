pub mod index;
pub mod storage;
