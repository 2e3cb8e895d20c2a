pub mod cluster;
pub mod config;
pub mod context;
pub mod decoder;
pub mod facade;
pub mod ir;
pub mod processing;
pub mod sentinels;
