pub mod fanout;
pub mod history;
pub mod questdb;

pub use fanout::FanoutSink;
pub use history::InMemoryHistory;
pub use questdb::{QuestDbHistory, QuestDbRow, QuestDbSink};
