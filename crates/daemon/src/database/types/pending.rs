use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};

/// Where the authoritative bytes of a node are waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Pending {
    /// Content is in the local cache
    None,
    /// Local bytes were evicted; a read must hydrate first
    Remote,
}

impl Pending {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pending::None => "NONE",
            Pending::Remote => "REMOTE",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown pending state: {0:?}")]
pub struct ParsePendingError(String);

impl std::str::FromStr for Pending {
    type Err = ParsePendingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Pending::None),
            "REMOTE" => Ok(Pending::Remote),
            other => Err(ParsePendingError(other.to_string())),
        }
    }
}

impl std::fmt::Display for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Type<Sqlite> for Pending {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <String as Type<Sqlite>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Sqlite> for Pending {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<'q, Sqlite>>::encode_by_ref(&self.as_str(), args)
    }
}

impl<'r> Decode<'r, Sqlite> for Pending {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as Decode<'r, Sqlite>>::decode(value)?;
        Ok(raw.parse()?)
    }
}
