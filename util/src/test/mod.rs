pub use self::logger::init_logger;

mod logger;
