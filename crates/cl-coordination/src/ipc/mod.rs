pub mod handler;

pub use handler::CoordinationHandler;
