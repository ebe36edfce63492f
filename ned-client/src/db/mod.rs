pub mod history_queries;

pub use history_queries::{latest_price, training_rows};
