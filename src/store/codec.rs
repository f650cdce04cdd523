//! Typed access to a [`PersistentDictionary`].
//!
//! Values are JSON-encoded, or passed through untouched in raw mode. Encoded
//! bytes above the compression threshold are deflated. The first byte of
//! every stored value tags the format so readers never guess.

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ETag, Expect, PersistentDictionary};
use crate::error::{Error, Result};

/// Values larger than this are compressed unless configured otherwise.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 16 * 1024;

const TAG_JSON: u8 = 0;
const TAG_JSON_DEFLATE: u8 = 1;
const TAG_RAW: u8 = 2;
const TAG_RAW_DEFLATE: u8 = 3;

/// A dictionary of `T` values layered over a byte-level store.
pub struct TypedDictionary<T> {
    inner: Arc<dyn PersistentDictionary>,
    compress_threshold: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedDictionary<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            compress_threshold: self.compress_threshold,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedDictionary<T> {
    pub fn new(inner: Arc<dyn PersistentDictionary>, compress_threshold: usize) -> Self {
        Self {
            inner,
            compress_threshold,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn get(&self, key: &str) -> Result<Option<(T, ETag)>> {
        let Some(stored) = self.inner.get(key).await? else {
            return Ok(None);
        };
        let bytes = self.decode(key, &stored.value, false)?;
        Ok(Some((serde_json::from_slice(&bytes)?, stored.etag)))
    }

    pub async fn set(&self, key: &str, value: &T, expect: Expect) -> Result<ETag> {
        let json = serde_json::to_vec(value)?;
        let bytes = self.encode(json, false)?;
        self.inner.set(key, bytes, expect).await
    }

    /// Read a value written with [`set_raw`](Self::set_raw).
    pub async fn get_raw(&self, key: &str) -> Result<Option<(Vec<u8>, ETag)>> {
        let Some(stored) = self.inner.get(key).await? else {
            return Ok(None);
        };
        Ok(Some((self.decode(key, &stored.value, true)?, stored.etag)))
    }

    /// Store bytes as-is, skipping serialization.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>, expect: Expect) -> Result<ETag> {
        let bytes = self.encode(value, true)?;
        self.inner.set(key, bytes, expect).await
    }

    pub async fn remove(&self, key: &str, expect: Expect) -> Result<bool> {
        self.inner.remove(key, expect).await
    }

    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        self.inner.contains_key(key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    fn encode(&self, payload: Vec<u8>, raw: bool) -> Result<Vec<u8>> {
        let (plain, deflated) = if raw {
            (TAG_RAW, TAG_RAW_DEFLATE)
        } else {
            (TAG_JSON, TAG_JSON_DEFLATE)
        };

        if payload.len() <= self.compress_threshold {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.push(plain);
            out.extend_from_slice(&payload);
            return Ok(out);
        }

        let mut encoder = DeflateEncoder::new(vec![deflated], Compression::default());
        encoder.write_all(&payload)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, key: &str, stored: &[u8], raw: bool) -> Result<Vec<u8>> {
        let Some((&tag, body)) = stored.split_first() else {
            return Err(Error::Other(format!(
                "empty value under '{key}' in store '{}'",
                self.name()
            )));
        };

        let expected_raw = matches!(tag, TAG_RAW | TAG_RAW_DEFLATE);
        if expected_raw != raw {
            return Err(Error::Other(format!(
                "value under '{key}' in store '{}' has format tag {tag}, wrong access mode",
                self.name()
            )));
        }

        match tag {
            TAG_JSON | TAG_RAW => Ok(body.to_vec()),
            TAG_JSON_DEFLATE | TAG_RAW_DEFLATE => {
                let mut out = Vec::new();
                DeflateDecoder::new(body).read_to_end(&mut out)?;
                Ok(out)
            }
            other => Err(Error::Other(format!(
                "unknown format tag {other} under '{key}' in store '{}'",
                self.name()
            ))),
        }
    }
}
