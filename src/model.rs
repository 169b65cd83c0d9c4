use serde::{Deserialize, Serialize};

pub type RecordId = u64;
pub type OracleId = u64;

/// One named metadata value attached to a record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    pub name: String,
    pub value: String,
}

impl MetaEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// The atomic unit of the store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    /// Server-assigned, never reused
    pub id: RecordId,

    /// The embedding
    pub data: Vec<f64>,

    /// Ordered name/value pairs, names unique per record
    #[serde(default)]
    pub meta: Vec<MetaEntry>,
}

impl Record {
    pub fn new(id: RecordId, data: Vec<f64>, meta: Vec<MetaEntry>) -> Self {
        Self { id, data, meta }
    }

    pub fn meta(&self, name: &str) -> Option<&str> {
        self.meta.iter().find(|m| m.name == name).map(|m| m.value.as_str())
    }
}

/// A registered script. Write-once per name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Oracle {
    pub id: OracleId,
    pub name: String,
    pub code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OracleSummary {
    pub id: OracleId,
    pub name: String,
}

impl From<&Oracle> for OracleSummary {
    fn from(o: &Oracle) -> Self {
        Self { id: o.id, name: o.name.clone() }
    }
}

/// Serialized return value of one invocation.
///
/// When `compressed` is set, `payload` is a zstd stream that decodes to JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub compressed: bool,
}

/// One page of a listing plus totals.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub total: u64,
    pub pages: u64,
    pub items: Vec<T>,
}

impl<T: Clone> Page<T> {
    /// Slices `all` into the requested 1-based page; out-of-range pages are empty.
    pub fn slice(all: &[T], page: u64, per_page: u64) -> Self {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = all.len() as u64;
        let pages = total.div_ceil(per_page);

        let start = (page - 1).saturating_mul(per_page);
        let items = if start >= total {
            Vec::new()
        } else {
            let end = start.saturating_add(per_page).min(total);
            all[start as usize..end as usize].to_vec()
        };
        Self { total, pages, items }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
