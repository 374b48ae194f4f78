//! SMBIOS identification tables (types 0, 1 and 3).

use std::collections::BTreeMap;

use chrono::Local;

/// Keys understood by [`SmbiosFields::to_args`]. Overrides may carry other
/// keys; they are kept but never emitted.
pub const SMBIOS_KEYS: &[&str] = &[
    "smbios0_vendor",
    "smbios0_version",
    "smbios0_date",
    "smbios1_manufacturer",
    "smbios1_product",
    "smbios1_family",
    "smbios1_version",
    "smbios1_serial",
    "smbios1_uuid",
    "smbios3_manufacturer",
    "smbios3_serial",
    "smbios3_asset",
    "smbios3_sku",
    "smbios3_version",
];

const VENDOR: &str = "Patina";
const MANUFACTURER: &str = "OpenDevicePartnership";
const SYSTEM_UUID: &str = "99fb60e2-181c-413a-a3cf-0a5fea8d87b0";

/// Flat key/value view of the SMBIOS fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbiosFields {
    values: BTreeMap<String, String>,
}

impl SmbiosFields {
    /// Defaults shared by both boards; the four arguments are what differs.
    pub(crate) fn for_board(bios_version: &str, product: &str, chassis_serial: &str, tag: &str) -> Self {
        let date = Local::now().format("%m/%d/%Y").to_string();
        let values = [
            ("smbios0_vendor", VENDOR),
            ("smbios0_version", bios_version),
            ("smbios0_date", date.as_str()),
            ("smbios1_manufacturer", MANUFACTURER),
            ("smbios1_product", product),
            ("smbios1_family", "QEMU"),
            ("smbios1_version", "10.0.0"),
            ("smbios1_serial", "42-42-42-42"),
            ("smbios1_uuid", SYSTEM_UUID),
            ("smbios3_manufacturer", MANUFACTURER),
            ("smbios3_serial", chassis_serial),
            ("smbios3_asset", tag),
            ("smbios3_sku", tag),
            ("smbios3_version", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self { values }
    }

    /// Override key by key; keys not present in `overrides` keep their value.
    pub fn merge<K, V>(&mut self, overrides: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in overrides {
            self.values.insert(key.into(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn quoted(&self, key: &str) -> String {
        format!("\"{}\"", escape(self.get(key).unwrap_or_default()))
    }

    /// The three `-smbios` flag/value pairs.
    pub fn to_args(&self) -> Vec<String> {
        let q = |key| self.quoted(key);
        vec![
            "-smbios".to_string(),
            format!(
                "type=0,vendor={},version={},date={},uefi=on",
                q("smbios0_vendor"),
                q("smbios0_version"),
                q("smbios0_date"),
            ),
            "-smbios".to_string(),
            format!(
                "type=1,manufacturer={},product={},family={},version={},serial={},uuid={}",
                q("smbios1_manufacturer"),
                q("smbios1_product"),
                q("smbios1_family"),
                q("smbios1_version"),
                q("smbios1_serial"),
                escape(self.get("smbios1_uuid").unwrap_or_default()),
            ),
            "-smbios".to_string(),
            format!(
                "type=3,manufacturer={},serial={},asset={},sku={},version={}",
                q("smbios3_manufacturer"),
                q("smbios3_serial"),
                q("smbios3_asset"),
                q("smbios3_sku"),
                q("smbios3_version"),
            ),
        ]
    }
}

/// QEMU option values cannot carry a bare comma (it splits the option) and
/// the surrounding quotes cannot be nested, so commas are doubled and quotes
/// dropped.
fn escape(value: &str) -> String {
    value.replace('"', "").replace(',', ",,")
}
