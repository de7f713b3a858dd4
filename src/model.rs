// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resource types for the Cloud Storage JSON API.
//!
//! See <https://cloud.google.com/storage/docs/json_api/v1> for the API
//! reference. Wire quirks handled here: 64-bit integers travel as decimal
//! strings, the CRC32C checksum travels as the base64 encoding of the
//! big-endian `u32`, and the MD5 hash travels base64 encoded.

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde_with::{DisplayFromStr, serde_as, skip_serializing_none};
use std::collections::HashMap;

/// An object (sometimes called a "blob" or "file") stored in a bucket.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Object {
    pub id: String,
    pub name: String,
    pub bucket: String,
    #[serde_as(as = "DisplayFromStr")]
    pub generation: i64,
    #[serde_as(as = "DisplayFromStr")]
    pub metageneration: i64,
    #[serde_as(as = "DisplayFromStr")]
    pub size: u64,
    pub content_type: String,
    pub content_encoding: String,
    pub content_disposition: String,
    pub content_language: String,
    pub cache_control: String,
    pub storage_class: String,
    pub etag: String,
    pub kms_key_name: String,
    #[serde_as(as = "Option<Crc32cAsBase64>")]
    pub crc32c: Option<u32>,
    pub md5_hash: Option<String>,
    pub metadata: HashMap<String, String>,
    pub customer_encryption: Option<CustomerEncryption>,
    pub owner: Option<Owner>,
    pub acl: Vec<ObjectAccessControl>,
    pub time_created: String,
    pub updated: String,
    pub component_count: Option<i32>,
    pub temporary_hold: Option<bool>,
    pub event_based_hold: Option<bool>,
}

impl Object {
    /// The checksums reported by the service for this object, if any.
    pub fn checksums(&self) -> Option<ObjectChecksums> {
        if self.crc32c.is_none() && self.md5_hash.is_none() {
            return None;
        }
        Some(ObjectChecksums {
            crc32c: self.crc32c,
            md5_hash: self.md5_hash.clone(),
        })
    }
}

/// The checksums of an object's data.
///
/// Either field may be absent: the client enables only CRC32C by default,
/// and the service omits MD5 hashes for composite objects.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct ObjectChecksums {
    /// The CRC32C checksum, as a native `u32`.
    pub crc32c: Option<u32>,
    /// The MD5 hash, base64 encoded as it travels on the wire.
    pub md5_hash: Option<String>,
}

impl ObjectChecksums {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_crc32c(mut self, v: u32) -> Self {
        self.crc32c = Some(v);
        self
    }

    pub fn set_md5_hash<T: Into<String>>(mut self, v: T) -> Self {
        self.md5_hash = Some(v.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.crc32c.is_none() && self.md5_hash.is_none()
    }

    /// The CRC32C checksum in its wire form: base64 of the big-endian bytes.
    pub fn crc32c_base64(&self) -> Option<String> {
        self.crc32c.map(|v| BASE64_STANDARD.encode(v.to_be_bytes()))
    }

    /// Renders the `X-Goog-Hash` header value, e.g. `crc32c=...,md5=...`.
    pub fn as_goog_hash_header(&self) -> Option<String> {
        let parts = [
            self.crc32c_base64().map(|v| format!("crc32c={v}")),
            self.md5_hash.as_ref().map(|v| format!("md5={v}")),
        ];
        let joined = parts.into_iter().flatten().collect::<Vec<_>>().join(",");
        if joined.is_empty() { None } else { Some(joined) }
    }

    /// Parses an `x-goog-hash` response header value.
    pub fn from_goog_hash_header(value: &str) -> Self {
        value
            .split(',')
            .filter_map(|item| item.trim().split_once('='))
            .fold(Self::new(), |acc, (key, value)| match key {
                "crc32c" => Self {
                    crc32c: decode_crc32c(value),
                    ..acc
                },
                "md5" => Self {
                    md5_hash: Some(value.to_string()),
                    ..acc
                },
                _ => acc,
            })
    }
}

pub(crate) fn decode_crc32c(value: &str) -> Option<u32> {
    let bytes = BASE64_STANDARD.decode(value).ok()?;
    let bytes: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Serde adapter for the CRC32C wire encoding.
pub(crate) struct Crc32cAsBase64;

impl<'de> serde_with::DeserializeAs<'de, u32> for Crc32cAsBase64 {
    fn deserialize_as<D>(deserializer: D) -> Result<u32, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let value = <String as serde::Deserialize>::deserialize(deserializer)?;
        decode_crc32c(&value).ok_or_else(|| {
            serde::de::Error::custom("crc32c must be the base64 encoding of 4 bytes")
        })
    }
}

impl serde_with::SerializeAs<u32> for Crc32cAsBase64 {
    fn serialize_as<S>(source: &u32, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(source.to_be_bytes()))
    }
}

/// A bucket.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub project_number: Option<i64>,
    #[serde_as(as = "DisplayFromStr")]
    pub metageneration: i64,
    pub location: String,
    pub location_type: String,
    pub storage_class: String,
    pub etag: String,
    pub versioning: Option<BucketVersioning>,
    pub labels: HashMap<String, String>,
    pub time_created: String,
    pub updated: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct BucketVersioning {
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Owner {
    pub entity: String,
    pub entity_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct ProjectTeam {
    pub project_number: String,
    pub team: String,
}

/// Metadata for customer-supplied encryption keys.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct CustomerEncryption {
    pub encryption_algorithm: String,
    pub key_sha256: String,
}

/// An access control entry on an object or as a bucket default.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct ObjectAccessControl {
    pub id: String,
    pub bucket: String,
    pub object: String,
    pub entity: String,
    pub role: String,
    pub email: String,
    pub domain: String,
    pub entity_id: String,
    pub etag: String,
    pub project_team: Option<ProjectTeam>,
}

/// A change notification configuration.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Notification {
    pub id: String,
    pub topic: String,
    pub payload_format: String,
    pub event_types: Vec<String>,
    pub custom_attributes: HashMap<String, String>,
    pub object_name_prefix: String,
    pub etag: String,
}

/// Metadata for an HMAC key; the secret only appears at creation time.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct HmacKeyMetadata {
    pub id: String,
    pub access_id: String,
    pub project_id: String,
    pub service_account_email: String,
    pub state: String,
    pub etag: String,
    pub time_created: String,
    pub updated: String,
}

/// The response to HMAC key creation: metadata plus the one-time secret.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct HmacKey {
    pub metadata: HmacKeyMetadata,
    pub secret: String,
}

/// An IAM policy on a bucket.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Policy {
    pub version: Option<i32>,
    pub bindings: Vec<Binding>,
    pub etag: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Binding {
    pub role: String,
    pub members: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct TestIamPermissionsResponse {
    pub permissions: Vec<String>,
}

/// A watch channel, as created by `objects.watchAll` and stopped via
/// `channels.stop`.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Channel {
    pub id: String,
    pub resource_id: String,
    pub resource_uri: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub address: String,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub expiration: Option<i64>,
}

/// The body of a compose request.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ComposeRequest {
    pub destination: Option<ComposeDestination>,
    pub source_objects: Vec<SourceObject>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ComposeDestination {
    pub content_type: String,
}

#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SourceObject {
    pub name: String,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub generation: Option<i64>,
}

impl SourceObject {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            generation: None,
        }
    }

    pub fn with_generation(mut self, v: i64) -> Self {
        self.generation = Some(v);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct ListBucketsResponse {
    pub items: Vec<Bucket>,
    pub next_page_token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct ListObjectsResponse {
    pub items: Vec<Object>,
    pub prefixes: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct ListNotificationsResponse {
    pub items: Vec<Notification>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct ListObjectAccessControlsResponse {
    pub items: Vec<ObjectAccessControl>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct ListHmacKeysResponse {
    pub items: Vec<HmacKeyMetadata>,
    pub next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn object_from_json() -> anyhow::Result<()> {
        let json = serde_json::json!({
            "name": "test-object",
            "bucket": "test-bucket",
            "generation": "123456",
            "metageneration": "2",
            "size": "5000000",
            "contentType": "text/plain",
            "storageClass": "STANDARD",
            "crc32c": "AAAAAA==",
            "md5Hash": "nhB9nTcrtoJr2B01QqQZ1g==",
            "metadata": {"k": "v"},
        });
        let object = serde_json::from_value::<Object>(json)?;
        assert_eq!(object.name, "test-object");
        assert_eq!(object.bucket, "test-bucket");
        assert_eq!(object.generation, 123456);
        assert_eq!(object.size, 5_000_000);
        assert_eq!(object.crc32c, Some(0));
        assert_eq!(object.md5_hash.as_deref(), Some("nhB9nTcrtoJr2B01QqQZ1g=="));
        assert_eq!(object.metadata.get("k").map(String::as_str), Some("v"));

        let checksums = object.checksums().expect("both checksums set");
        assert_eq!(checksums.crc32c, Some(0));
        Ok(())
    }

    #[test]
    fn object_rejects_bad_crc32c() {
        let json = serde_json::json!({"name": "o", "crc32c": "too-long-to-be-4-bytes"});
        let result = serde_json::from_value::<Object>(json);
        assert!(result.is_err(), "{result:?}");
    }

    // 0x01020304 in big-endian base64.
    #[test_case("AQIDBA==", Some(0x01020304); "four bytes")]
    #[test_case("AAAAAA==", Some(0); "zero")]
    #[test_case("AQID", None; "three bytes")]
    #[test_case("not base64!!", None; "garbage")]
    fn crc32c_decoding(input: &str, want: Option<u32>) {
        assert_eq!(decode_crc32c(input), want);
    }

    #[test]
    fn goog_hash_header_round_trip() {
        let checksums = ObjectChecksums::new()
            .set_crc32c(0x01020304)
            .set_md5_hash("nhB9nTcrtoJr2B01QqQZ1g==");
        let header = checksums.as_goog_hash_header().unwrap();
        assert_eq!(header, "crc32c=AQIDBA==,md5=nhB9nTcrtoJr2B01QqQZ1g==");
        let parsed = ObjectChecksums::from_goog_hash_header(&header);
        assert_eq!(parsed, checksums);
    }

    #[test]
    fn goog_hash_header_partial() {
        let parsed = ObjectChecksums::from_goog_hash_header("crc32c=AQIDBA==");
        assert_eq!(parsed.crc32c, Some(0x01020304));
        assert_eq!(parsed.md5_hash, None);
        assert!(ObjectChecksums::new().as_goog_hash_header().is_none());
    }

    #[test]
    fn compose_request_body() -> anyhow::Result<()> {
        let request = ComposeRequest {
            destination: Some(ComposeDestination {
                content_type: "text/plain".into(),
            }),
            source_objects: vec![
                SourceObject::new("part-1"),
                SourceObject::new("part-2").with_generation(7),
            ],
        };
        let got = serde_json::to_value(&request)?;
        let want = serde_json::json!({
            "destination": {"contentType": "text/plain"},
            "sourceObjects": [
                {"name": "part-1"},
                {"name": "part-2", "generation": "7"},
            ],
        });
        assert_eq!(got, want);
        Ok(())
    }

    #[test]
    fn bucket_from_json() -> anyhow::Result<()> {
        let json = serde_json::json!({
            "name": "test-bucket",
            "projectNumber": "42",
            "metageneration": "3",
            "location": "US-CENTRAL1",
            "storageClass": "STANDARD",
            "versioning": {"enabled": true},
        });
        let bucket = serde_json::from_value::<Bucket>(json)?;
        assert_eq!(bucket.name, "test-bucket");
        assert_eq!(bucket.project_number, Some(42));
        assert_eq!(bucket.metageneration, 3);
        assert!(bucket.versioning.unwrap().enabled);
        Ok(())
    }

    #[test]
    fn channel_type_field() -> anyhow::Result<()> {
        let json = serde_json::json!({
            "id": "channel-1",
            "resourceId": "resource-1",
            "type": "web_hook",
            "address": "https://example.com/hook",
        });
        let channel = serde_json::from_value::<Channel>(json)?;
        assert_eq!(channel.channel_type, "web_hook");
        assert_eq!(channel.resource_id, "resource-1");
        Ok(())
    }
}
