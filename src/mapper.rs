//! C5 (mapper half) — static source-type -> destination-type tables, one
//! per destination family, plus the compatibility policy the schema
//! monitor's diff (§4.2) shares via [`crate::schema::diff::is_widening`].
//!
//! The time-series family derives from the relational family "by
//! inheritance... with explicit per-key overrides" (§4.5): it starts from
//! the relational map and overlays the timestamp entry with the
//! timezone-aware form.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Which destination family a mapper targets. The columnar store's
/// supported-type set differs slightly (e.g. no native decimal), so it is
/// kept as its own table rather than derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationFamily {
    Relational,
    TimeSeries,
    Columnar,
}

/// The outcome of mapping one source type for one destination family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedType {
    /// A destination-native scalar type.
    Scalar(&'static str),
    /// Collections and user-defined types serialize to a destination-native
    /// JSON type where available (§4.5).
    Json(&'static str),
    /// Declared unsupported: tuple and counter types (§4.5, §9).
    Unsupported,
}

static RELATIONAL_MAP: Lazy<HashMap<&'static str, MappedType>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("null", MappedType::Scalar("null"));
    m.insert("boolean", MappedType::Scalar("boolean"));
    m.insert("int", MappedType::Scalar("integer"));
    m.insert("bigint", MappedType::Scalar("bigint"));
    m.insert("float", MappedType::Scalar("real"));
    m.insert("double", MappedType::Scalar("double precision"));
    m.insert("decimal", MappedType::Scalar("numeric"));
    m.insert("text", MappedType::Scalar("text"));
    m.insert("blob", MappedType::Scalar("bytea"));
    m.insert("timestamp", MappedType::Scalar("timestamp"));
    m.insert("uuid", MappedType::Scalar("uuid"));
    m.insert("list", MappedType::Json("jsonb"));
    m.insert("set", MappedType::Json("jsonb"));
    m.insert("map", MappedType::Json("jsonb"));
    m.insert("tuple", MappedType::Unsupported);
    m.insert("counter", MappedType::Unsupported);
    m
});

static TIME_SERIES_MAP: Lazy<HashMap<&'static str, MappedType>> = Lazy::new(|| {
    let mut m = RELATIONAL_MAP.clone();
    // Time-series destinations prefer the timezone-aware timestamp form.
    m.insert("timestamp", MappedType::Scalar("timestamptz"));
    m
});

static COLUMNAR_MAP: Lazy<HashMap<&'static str, MappedType>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("null", MappedType::Scalar("Nullable(Nothing)"));
    m.insert("boolean", MappedType::Scalar("UInt8"));
    m.insert("int", MappedType::Scalar("Int32"));
    m.insert("bigint", MappedType::Scalar("Int64"));
    m.insert("float", MappedType::Scalar("Float32"));
    m.insert("double", MappedType::Scalar("Float64"));
    m.insert("decimal", MappedType::Scalar("Decimal64(9)"));
    m.insert("text", MappedType::Scalar("String"));
    m.insert("blob", MappedType::Scalar("String"));
    m.insert("timestamp", MappedType::Scalar("DateTime64(6)"));
    m.insert("uuid", MappedType::Scalar("UUID"));
    m.insert("list", MappedType::Json("String"));
    m.insert("set", MappedType::Json("String"));
    m.insert("map", MappedType::Json("String"));
    m.insert("tuple", MappedType::Unsupported);
    m.insert("counter", MappedType::Unsupported);
    m
});

/// The table-driven source-type -> destination-type translator, and the
/// policy that decides which source type changes are compatible.
pub struct SchemaMapper {
    family: DestinationFamily,
}

impl SchemaMapper {
    pub fn new(family: DestinationFamily) -> Self {
        SchemaMapper { family }
    }

    fn table(&self) -> &'static HashMap<&'static str, MappedType> {
        match self.family {
            DestinationFamily::Relational => &RELATIONAL_MAP,
            DestinationFamily::TimeSeries => &TIME_SERIES_MAP,
            DestinationFamily::Columnar => &COLUMNAR_MAP,
        }
    }

    /// Maps one source type tag to this destination's type, or
    /// [`MappedType::Unsupported`] if there is no mapping at all.
    pub fn map_type(&self, source_type: &str) -> MappedType {
        self.table().get(source_type).cloned().unwrap_or(MappedType::Unsupported)
    }
}

impl Clone for MappedType {
    fn clone(&self) -> Self {
        match self {
            MappedType::Scalar(s) => MappedType::Scalar(s),
            MappedType::Json(s) => MappedType::Json(s),
            MappedType::Unsupported => MappedType::Unsupported,
        }
    }
}
