pub mod logs;
pub mod tools;
