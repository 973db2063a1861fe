mod camera;
mod overlay;
mod prediction;
mod routes;
mod server;
mod session;
mod stream;
mod telemetry;

pub mod app;
pub mod config;
pub mod lifecycle;

pub use app::start_app;
