pub mod api;
pub mod bounding_box;
pub mod camera;
pub mod cancel;
pub mod chat;
pub mod detection_loop;
pub mod error;
pub mod image_utils;
pub mod monitor;
pub mod pipeline;
pub mod server;
pub mod telemetry;
pub mod video;

mod routes;

pub mod app;
pub mod config;

pub use app::start_app;
