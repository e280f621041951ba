//! Newtype ids for type-safe identifiers.
//!
//! Using newtypes keeps a `ProductId` from ever landing where an
//! `OrderId` is expected. Generated ids carry a short prefix so log
//! lines and webhook payloads stay legible.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate newtype id structs with a generation prefix.
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A unique identifier.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique id.
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, random_suffix()))
            }

            /// The id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(ProductId, "prd");
define_id!(CategoryId, "cat");
define_id!(CartId, "crt");
define_id!(UserId, "usr");
define_id!(CouponId, "cpn");
define_id!(UsageId, "usg");
define_id!(OrderId, "ord");
define_id!(OrderItemId, "itm");
define_id!(PaymentId, "pay");
define_id!(MovementId, "mov");
define_id!(AlertId, "alr");

/// 96 bits of randomness, url-safe base64.
fn random_suffix() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;

    let bytes: [u8; 12] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}
