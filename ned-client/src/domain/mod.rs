pub mod energy;
pub mod price;
pub mod series;
pub mod units;

pub use energy::{Activity, EnergyKind, EnergyRecord, EnergySnapshot, OverviewPoint};
pub use price::{PriceObservation, PriceRow, PriceSource, TrainingRow};
pub use series::{floor_to_hour, ForecastPoint, Series};
pub use units::{
    round_to, CentsPerKwh, EurPerKwh, Gigawatts, Kilowatts, Measurement, Percent, PriceUnit, Quantity,
    RSquared, Unit, UnitError,
};
