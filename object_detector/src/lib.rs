mod annotator;
mod detection;
mod frame_codec;
mod inference_service;
mod model_service;
mod ort_model;
mod server;
mod state;

pub mod config;

pub use server::start_server;
