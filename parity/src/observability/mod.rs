pub mod logging;

pub use logging::{bootstrap_subscriber, init_file_logging, init_simple_logging};
