pub mod catalog;
pub mod config;
pub mod domain;
pub mod executables;
pub mod fixtures;
pub mod numerics;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod validator;
