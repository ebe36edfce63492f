use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, Mul, Sub},
};

use serde::{Deserialize, Serialize};

/// Unit tag carried next to every numeric value that leaves the crate.
///
/// Values are never exchanged as bare numbers: they are either a typed
/// [`Quantity`] or a [`Measurement`] holding its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "kW")]
    Kilowatt,
    #[serde(rename = "GW")]
    Gigawatt,
    #[serde(rename = "%")]
    Percent,
    #[serde(rename = "€/kWh")]
    EurPerKwh,
    #[serde(rename = "ct/kWh")]
    CentsPerKwh,
    #[serde(rename = "")]
    Dimensionless,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Kilowatt => "kW",
            Self::Gigawatt => "GW",
            Self::Percent => "%",
            Self::EurPerKwh => "€/kWh",
            Self::CentsPerKwh => "ct/kWh",
            Self::Dimensionless => "",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dimensionless => f.write_str("dimensionless"),
            other => f.write_str(other.symbol()),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UnitError {
    #[error("unit mismatch: cannot compare {left} with {right}")]
    Mismatch { left: Unit, right: Unit },
    #[error("unknown unit '{0}'")]
    Unknown(String),
    #[error("value has no unit of measurement")]
    Missing,
}

/// A numeric value whose unit is fixed by its type.
pub trait Quantity: Copy + fmt::Debug + Send + Sync + 'static {
    const UNIT: Unit;

    fn new(value: f64) -> Self;

    fn value(self) -> f64;

    fn measurement(self) -> Measurement {
        Measurement {
            value: self.value(),
            unit: Self::UNIT,
        }
    }
}

macro_rules! quantity {
    ($(#[$meta:meta])* $name:ident => $unit:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub f64);

        impl Quantity for $name {
            const UNIT: Unit = $unit;

            fn new(value: f64) -> Self {
                Self(value)
            }

            fn value(self) -> f64 {
                self.0
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl Mul<f64> for $name {
            type Output = Self;

            fn mul(self, rhs: f64) -> Self {
                Self(self.0 * rhs)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} {}", self.0, Self::UNIT.symbol())
            }
        }
    };
}

quantity!(
    /// Raw NED `capacity` values are reported in kilowatts.
    Kilowatts => Unit::Kilowatt
);
quantity!(Gigawatts => Unit::Gigawatt);
quantity!(Percent => Unit::Percent);
quantity!(EurPerKwh => Unit::EurPerKwh);
quantity!(CentsPerKwh => Unit::CentsPerKwh);
quantity!(
    /// Coefficient of determination of a fitted model.
    RSquared => Unit::Dimensionless
);

impl From<Kilowatts> for Gigawatts {
    fn from(kw: Kilowatts) -> Self {
        Gigawatts(kw.0 / 1_000_000.0)
    }
}

impl From<CentsPerKwh> for EurPerKwh {
    fn from(ct: CentsPerKwh) -> Self {
        EurPerKwh(ct.0 / 100.0)
    }
}

impl From<EurPerKwh> for CentsPerKwh {
    fn from(eur: EurPerKwh) -> Self {
        CentsPerKwh(eur.0 * 100.0)
    }
}

/// Units accepted for incoming price values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceUnit {
    EurPerKwh,
    CentsPerKwh,
    EurPerMwh,
}

impl PriceUnit {
    pub fn parse(raw: &str) -> Result<Self, UnitError> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "" => Err(UnitError::Missing),
            "€/kwh" | "eur/kwh" | "euro/kwh" => Ok(Self::EurPerKwh),
            "ct/kwh" | "cent/kwh" | "c€/kwh" => Ok(Self::CentsPerKwh),
            "€/mwh" | "eur/mwh" | "euro/mwh" => Ok(Self::EurPerMwh),
            _ => Err(UnitError::Unknown(raw.to_string())),
        }
    }

    pub fn to_eur_per_kwh(self, value: f64) -> EurPerKwh {
        match self {
            Self::EurPerKwh => EurPerKwh(value),
            Self::CentsPerKwh => CentsPerKwh(value).into(),
            Self::EurPerMwh => EurPerKwh(value / 1000.0),
        }
    }
}

/// A value tagged with its unit, as served to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub unit: Unit,
}

impl Measurement {
    /// Compares two measurements, refusing to compare across units.
    pub fn try_cmp(&self, other: &Measurement) -> Result<Option<Ordering>, UnitError> {
        if self.unit != other.unit {
            return Err(UnitError::Mismatch {
                left: self.unit,
                right: other.unit,
            });
        }
        Ok(self.value.partial_cmp(&other.value))
    }

    /// Extracts the value as `Q`, failing when the tag is a different unit.
    pub fn as_quantity<Q: Quantity>(&self) -> Result<Q, UnitError> {
        if self.unit != Q::UNIT {
            return Err(UnitError::Mismatch {
                left: self.unit,
                right: Q::UNIT,
            });
        }
        Ok(Q::new(self.value))
    }

    pub fn rounded(self, decimals: u32) -> Self {
        Self {
            value: round_to(self.value, decimals),
            unit: self.unit,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Unit::Dimensionless => write!(f, "{}", self.value),
            unit => write!(f, "{} {}", self.value, unit.symbol()),
        }
    }
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
