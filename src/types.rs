use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const MAX_NAME_LEN: usize = 128;

fn validate_name(value: &str, kind: &str, allowed: fn(char) -> bool) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(allowed) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_simple_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-')
}

fn is_username_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '@' | '+')
}

macro_rules! define_name_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $allowed:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated name.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_name(value.as_ref(), $kind, $allowed).map(Self)
            }

            /// Creates a name from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

macro_rules! define_numeric_id {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw numeric id.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw numeric id.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self> {
                value
                    .trim()
                    .parse::<u64>()
                    .map(Self)
                    .map_err(|_| Error::InvalidId(format!("{} must be an unsigned integer", $kind)))
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

define_numeric_id!(
    /// User identifier.
    UserId,
    "user id"
);
define_numeric_id!(
    /// Role identifier.
    RoleId,
    "role id"
);

define_name_type!(
    /// Machine-readable role value, used as the policy subject.
    RoleValue,
    "role value",
    is_simple_name_char
);
define_name_type!(
    /// OAuth provider name.
    ProviderName,
    "provider name",
    is_simple_name_char
);
define_name_type!(
    /// Login name of a local account.
    Username,
    "username",
    is_username_char
);

/// Account or role status.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Usable.
    #[default]
    Active,
    /// Switched off by an administrator.
    Disabled,
}

impl Status {
    /// Returns true for [`Status::Active`].
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        if value == 1 { Self::Active } else { Self::Disabled }
    }
}

/// Local account.
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    /// PHC-format password hash.
    pub password_hash: String,
    pub role_id: RoleId,
    pub status: Status,
    /// Stable per-provider handles, for providers that expose one.
    #[serde(default)]
    pub federated_handles: BTreeMap<ProviderName, String>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("role_id", &self.role_id)
            .field("status", &self.status)
            .field("federated_handles", &self.federated_handles)
            .finish()
    }
}

/// Role record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub value: RoleValue,
    pub default_router: String,
    pub status: Status,
    pub remark: String,
    pub order_no: u32,
}

/// Role fields for creation; the store assigns the id.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoleDraft {
    pub name: String,
    pub value: RoleValue,
    #[serde(default)]
    pub default_router: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub order_no: u32,
}

impl RoleDraft {
    pub(crate) fn into_role(self, id: RoleId) -> Role {
        Role {
            id,
            name: self.name,
            value: self.value,
            default_router: self.default_router,
            status: self.status,
            remark: self.remark,
            order_no: self.order_no,
        }
    }
}

/// Where a session came from.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    /// Username and password.
    Local,
    /// A named OAuth provider.
    #[serde(rename = "oauth")]
    OAuth(ProviderName),
}

impl fmt::Display for SessionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::OAuth(provider) => f.write_str(provider.as_str()),
        }
    }
}

/// Live login of one user. At most one exists per user.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    /// Opaque session token, embedded as `sid` in the bearer claims.
    pub token: String,
    pub source: SessionSource,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Returns true when `now` is at or past the expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One page of an administrative listing.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    /// Slices `all` to the 1-based `page` of `page_size` items.
    pub fn slice(all: Vec<T>, page: u64, page_size: u64) -> Self {
        let total = all.len();
        let page_size = page_size.max(1) as usize;
        let skip = (page.max(1) as usize - 1).saturating_mul(page_size);
        let items = all.into_iter().skip(skip).take(page_size).collect();
        Self { items, total }
    }
}
