pub mod algorithms;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod middleware;
pub mod proxy;
pub mod response;
pub mod ring;
pub mod server;
pub mod watcher;

pub use algorithms::SlidingWindow;
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use ring::{Bucket, HashRing};
pub use server::Server;
