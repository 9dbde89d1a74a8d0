pub mod agent;
pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod export;
pub mod headless;
pub mod sampler;
pub mod soc;
