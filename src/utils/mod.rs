pub use logger::LoggerConfig;

pub mod logger;
