//! Payload codec for optimizer requests
//!
//! Cluster snapshots can be large, so the pod and node arrays are
//! JSON-encoded, gzip-compressed and base64-encoded before being
//! embedded in the outbound request body.

use anyhow::{Context, Result};
use base64::prelude::*;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// JSON-encode, gzip and base64 a value for the optimizer request
pub fn compress_payload<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).context("serializing payload")?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).context("gzip write")?;
    let compressed = encoder.finish().context("gzip finish")?;
    Ok(BASE64_STANDARD.encode(compressed))
}

/// Inverse of [`compress_payload`]
pub fn decompress_payload<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let compressed = BASE64_STANDARD
        .decode(encoded)
        .context("base64 decode")?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).context("gzip read")?;
    serde_json::from_slice(&json).context("deserializing payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeRecord, PodRecord};

    fn sample_pods() -> Vec<PodRecord> {
        vec![
            PodRecord {
                item: "ns/a".to_string(),
                node: "node1".to_string(),
                cpu_millicores: 2000,
                memory_bytes: 1 << 30,
                eligible: true,
            },
            PodRecord {
                item: "ns/b".to_string(),
                node: "node2".to_string(),
                cpu_millicores: 1000,
                memory_bytes: 1 << 29,
                eligible: true,
            },
        ]
    }

    #[test]
    fn pod_array_round_trips_byte_for_byte() {
        let pods = sample_pods();
        let original = serde_json::to_vec(&pods).unwrap();

        let encoded = compress_payload(&pods).unwrap();
        let decoded: Vec<PodRecord> = decompress_payload(&encoded).unwrap();
        let recovered = serde_json::to_vec(&decoded).unwrap();

        assert_eq!(original, recovered);
        assert_eq!(decoded, pods);
    }

    #[test]
    fn node_array_round_trips() {
        let nodes = vec![NodeRecord {
            name: "node1".to_string(),
            cpu_allocatable_millicores: 8000,
            memory_allocatable_bytes: 16 << 30,
            cpu_available_millicores: 6000,
            memory_available_bytes: 12 << 30,
            unschedulable: false,
        }];
        let decoded: Vec<NodeRecord> =
            decompress_payload(&compress_payload(&nodes).unwrap()).unwrap();
        assert_eq!(decoded, nodes);
    }

    #[test]
    fn garbage_input_is_an_error() {
        assert!(decompress_payload::<Vec<PodRecord>>("not base64!!").is_err());
        let valid_b64_bad_gzip = BASE64_STANDARD.encode(b"plainly not gzip");
        assert!(decompress_payload::<Vec<PodRecord>>(&valid_b64_bad_gzip).is_err());
    }
}
