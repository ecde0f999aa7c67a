pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod kafka;
pub mod models;
pub mod orderbook;

pub use clock::Clock;
pub use config::{Config, FeeSchedule};
pub use engine::Engine;
pub use error::EngineError;
pub use kafka::EventPublisher;
