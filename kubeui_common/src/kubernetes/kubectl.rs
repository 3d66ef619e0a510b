//! Running `kubectl` for the few things it knows better than we do, like how
//! to pick apart a user's kubeconfig files.

use serde::de::{DeserializeOwned, Deserializer, Error as DeError};
use std::process::{Command, Stdio};

use crate::prelude::*;

/// Run `kubectl`, capture output as JSON, and parse it using the
/// specified type.
#[tracing::instrument(level = "trace")]
pub fn kubectl_parse_json<T: DeserializeOwned>(args: &[&str]) -> Result<T> {
    let output = Command::new("kubectl")
        .args(args)
        // Pass `stderr` through on console instead of capturing.
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| format!("error starting kubectl with {:?}", args))?;
    if !output.status.success() {
        return Err(format_err!("error running kubectl with {:?}", args));
    }
    serde_json::from_slice(&output.stdout)
        .with_context(|| format!("error parsing output of kubectl {:?}", args))
}

/// Custom `serde` deserialization module for optional Base64-encoded data,
/// which is how kubeconfig files embed certificates and keys. Use with
/// `#[serde(default, with = "base64_encoded_data")]`.
pub mod base64_encoded_data {
    use super::*;

    /// Deserialize an optional Base64-encoded blob.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|encoded| {
                base64::decode(encoded.trim()).map_err(|err| {
                    D::Error::custom(format!("could not base64-decode data: {}", err))
                })
            })
            .transpose()
    }
}

#[test]
fn base64_encoded_data_decodes_present_and_missing_fields() {
    #[derive(Debug, Deserialize)]
    struct Example {
        #[serde(default, with = "base64_encoded_data")]
        data: Option<Vec<u8>>,
    }

    let present: Example = serde_json::from_str(r#"{ "data": "aGVsbG8=" }"#).unwrap();
    assert_eq!(present.data.as_deref(), Some(&b"hello"[..]));
    let null: Example = serde_json::from_str(r#"{ "data": null }"#).unwrap();
    assert_eq!(null.data, None);
    let missing: Example = serde_json::from_str("{}").unwrap();
    assert_eq!(missing.data, None);
    assert!(serde_json::from_str::<Example>(r#"{ "data": "%%%" }"#).is_err());
}
