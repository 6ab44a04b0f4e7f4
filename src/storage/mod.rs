pub mod memory;
pub mod pages;
pub mod queue;
pub mod repository;
pub mod visits;
