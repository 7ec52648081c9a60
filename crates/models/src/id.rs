use crate::Error;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// EntityKind is the ownership class of an entity, encoded as the first
/// character of its id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Location,
    Group,
    Item,
    Bag,
    Player,
    Quest,
    DataContainer,
    Geometry,
}

impl EntityKind {
    pub fn prefix(&self) -> char {
        match self {
            EntityKind::Location => 'L',
            EntityKind::Group => 'R',
            EntityKind::Item => 'I',
            EntityKind::Bag => 'B',
            EntityKind::Player => 'P',
            EntityKind::Quest => 'Q',
            EntityKind::DataContainer => 'D',
            EntityKind::Geometry => 'G',
        }
    }

    pub fn from_prefix(c: char) -> Result<Self, Error> {
        match c.to_ascii_uppercase() {
            'L' => Ok(EntityKind::Location),
            'R' => Ok(EntityKind::Group),
            'I' => Ok(EntityKind::Item),
            'B' => Ok(EntityKind::Bag),
            'P' => Ok(EntityKind::Player),
            'Q' => Ok(EntityKind::Quest),
            'D' => Ok(EntityKind::DataContainer),
            'G' => Ok(EntityKind::Geometry),
            other => Err(Error::UnknownPrefix(other)),
        }
    }

    /// Table name used by the default storage table mapper.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Location => "locations",
            EntityKind::Group => "groups",
            EntityKind::Item => "items",
            EntityKind::Bag => "bags",
            EntityKind::Player => "players",
            EntityKind::Quest => "quests",
            EntityKind::DataContainer => "data",
            EntityKind::Geometry => "geometry",
        }
    }
}

/// Id is a globally unique entity identifier: a single type-prefix letter
/// followed by a base-36, timestamp-derived token. Canonical form is
/// uppercase; parsing accepts any case.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(String);

impl Id {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut chars = s.chars();
        let Some(prefix) = chars.next() else {
            return Err(Error::InvalidId(s.to_string()));
        };
        EntityKind::from_prefix(prefix)?;

        if s.len() < 2 || !chars.all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidId(s.to_string()));
        }
        Ok(Id(s.to_ascii_uppercase()))
    }

    pub fn kind(&self) -> EntityKind {
        // Parsing validated the prefix.
        EntityKind::from_prefix(self.0.chars().next().unwrap()).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The base-36 token following the type prefix. The shard hash is
    /// computed over this portion only, so entities which share a token
    /// (a location and its geometry) co-locate.
    pub fn token(&self) -> &str {
        &self.0[1..]
    }

    /// Derive the geometry id co-located with this location id,
    /// or vice versa.
    pub fn with_kind(&self, kind: EntityKind) -> Id {
        Id(format!("{}{}", kind.prefix(), self.token()))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}
impl std::str::FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::parse(s)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Id::parse(str_val.as_ref()).map_err(|err| D::Error::custom(format!("{err}")))
    }
}

/// IdGenerator allocates fresh entity ids from the system clock.
/// Ids allocated by one generator are strictly monotonic: if the clock
/// reads at or before the previously issued timestamp, the new timestamp
/// is advanced one nanosecond past it.
pub struct IdGenerator {
    last_ns: Mutex<u64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            last_ns: Mutex::new(0),
        }
    }

    pub fn next(&self, kind: EntityKind) -> Id {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut last = self.last_ns.lock().unwrap();
        let ns = if now > *last { now } else { *last + 1 };
        *last = ns;

        Id(format!("{}{}", kind.prefix(), base36(ns)))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_and_canonical_form() {
        let id = Id::parse("lhvxj8aj9p1").unwrap();
        assert_eq!(id.as_str(), "LHVXJ8AJ9P1");
        assert_eq!(id.kind(), EntityKind::Location);
        assert_eq!(id.token(), "HVXJ8AJ9P1");

        assert!(Id::parse("").is_err());
        assert!(Id::parse("X123").is_err());
        assert!(Id::parse("L").is_err());
        assert!(Id::parse("L!!").is_err());
    }

    #[test]
    fn test_geometry_co_location() {
        let loc = Id::parse("LA510").unwrap();
        let geo = loc.with_kind(EntityKind::Geometry);
        assert_eq!(geo.as_str(), "GA510");
        assert_eq!(geo.token(), loc.token());
    }

    #[test]
    fn test_generator_is_strictly_monotonic() {
        let gen = IdGenerator::new();
        let mut prev = gen.next(EntityKind::Item);
        for _ in 0..1000 {
            let next = gen.next(EntityKind::Item);
            assert!(next.token() > prev.token(), "{next} !> {prev}");
            prev = next;
        }
    }

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "Z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }
}
