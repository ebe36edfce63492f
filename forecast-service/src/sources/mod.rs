pub mod ha_price;
pub mod http_price;
pub mod ned_api;
pub mod price_csv_file;

pub use ha_price::{HomeAssistantPriceClient, HomeAssistantPriceSource, PriceSensorError};
pub use http_price::HttpPriceSource;
pub use ned_api::{NedClient, NedError, NedPollingSource};
pub use price_csv_file::PriceCsvFileSource;
