use core::str::FromStr;
use std::fmt;

use serde::de::Visitor;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// encapsulate the UUIDs in custom struct to let the compiler differentiate
/// them
macro_rules! impl_id_encapsulation {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            id: Uuid,
        }

        impl $name {
            /// A fresh random identifier.
            #[inline(always)]
            pub fn generate() -> Self { $name { id: Uuid::new_v4() } }
        }

        impl From<Uuid> for $name {
            #[inline(always)]
            fn from(id: Uuid) -> Self { $name { id } }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            #[inline(always)]
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(|id| id.into())
            }
        }

        impl fmt::Display for $name {
            #[inline(always)]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.id)
            }
        }

        impl Serialize for $name {
            #[inline(always)]
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.id.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct MyVisitor;

                impl<'de> Visitor<'de> for MyVisitor {
                    type Value = $name;

                    fn expecting(
                        &self,
                        formatter: &mut fmt::Formatter,
                    ) -> fmt::Result {
                        formatter.write_str(
                            format!("a {}, i.e., a UUIDv4", stringify!($name))
                                .as_str(),
                        )
                    }

                    fn visit_str<E>(
                        self,
                        value: &str,
                    ) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        Ok($name {
                            id: Uuid::parse_str(value).map_err(E::custom)?,
                        })
                    }
                }

                deserializer.deserialize_str(MyVisitor)
            }
        }
    };
}

impl_id_encapsulation!(JobId);
impl_id_encapsulation!(BidId);
impl_id_encapsulation!(ClientId);
impl_id_encapsulation!(WorkerId);
impl_id_encapsulation!(DeviceId);
// One per live broadcast connection, a worker may hold several
impl_id_encapsulation!(ConnectionId);

pub mod domain;
pub mod dto;
pub mod view;
