use std::fmt;

use serde::{Deserialize, Serialize};

/// How a device address was assigned.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "camelCase")]
pub enum AddressType {
    #[display("public")]
    Public,
    #[default]
    #[display("randomStatic")]
    RandomStatic,
    #[display("randomPrivateResolvable")]
    RandomPrivateResolvable,
    #[display("randomPrivateNonResolvable")]
    RandomPrivateNonResolvable,
}

impl AddressType {
    /// Maps a stack-level address-type tag to an address type.
    ///
    /// Unknown tags fall back to random-static, which is what mobile stacks
    /// report for most peripherals.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "BLE_GAP_ADDR_TYPE_PUBLIC" | "public" => Self::Public,
            "BLE_GAP_ADDR_TYPE_RANDOM_PRIVATE_RESOLVABLE" | "randomPrivateResolvable" => {
                Self::RandomPrivateResolvable
            }
            "BLE_GAP_ADDR_TYPE_RANDOM_PRIVATE_NON_RESOLVABLE" | "randomPrivateNonResolvable" => {
                Self::RandomPrivateNonResolvable
            }
            _ => Self::RandomStatic,
        }
    }
}

/// An observed device address. The address string is the key for all
/// per-device state.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Address {
    address: String,
    #[serde(rename = "type")]
    address_type: AddressType,
}

impl Address {
    /// Creates an address with an explicit type.
    #[must_use]
    pub fn new(address: impl Into<String>, address_type: AddressType) -> Self {
        Self {
            address: address.into(),
            address_type,
        }
    }

    /// Creates a random-static address.
    #[must_use]
    pub fn random_static(address: impl Into<String>) -> Self {
        Self::new(address, AddressType::RandomStatic)
    }

    /// Returns the opaque address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn address_type(&self) -> AddressType {
        self.address_type
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::random_static(value)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("BLE_GAP_ADDR_TYPE_PUBLIC", AddressType::Public)]
    #[case("BLE_GAP_ADDR_TYPE_RANDOM_STATIC", AddressType::RandomStatic)]
    #[case("randomPrivateResolvable", AddressType::RandomPrivateResolvable)]
    #[case(
        "BLE_GAP_ADDR_TYPE_RANDOM_PRIVATE_NON_RESOLVABLE",
        AddressType::RandomPrivateNonResolvable
    )]
    #[case("something-else", AddressType::RandomStatic)]
    fn from_tag_maps_stack_tags(#[case] tag: &str, #[case] expected: AddressType) {
        assert_eq!(expected, AddressType::from_tag(tag));
    }

    #[test]
    fn address_serialises_with_type_tag() {
        let address = Address::new("AA:BB:CC:DD:EE:FF", AddressType::Public);
        let json = serde_json::to_string(&address).expect("address should serialise");
        assert_eq!(r#"{"address":"AA:BB:CC:DD:EE:FF","type":"public"}"#, json);
    }
}
