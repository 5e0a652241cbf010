pub mod attendance;
pub mod classes;
pub mod core;
pub mod push;
pub mod students;
pub mod teachers;
