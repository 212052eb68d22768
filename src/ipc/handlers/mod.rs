pub mod assignments;
pub mod attendance;
pub mod catalog;
pub mod core;
pub mod substitutions;
pub mod teacher_attendance;
