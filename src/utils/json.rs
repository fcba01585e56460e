use serde::{Deserialize, Deserializer};

/// Keeps an explicit `null` apart from an omitted field: omitted stays `None`
/// (via `#[serde(default)]`), `null` becomes `Some(None)`.
pub fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
