//! Process-scoped memoisation of decoded assets.
//!
//! Entries are populated on first access and never evicted; callers drop a
//! stale entry with [`AssetCache::invalidate`] when the asset source changes.
//! Concurrent requests for one key share a single in-flight load.

use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::RgbaImage;
use regex::Regex;
use smol::lock::OnceCell;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Where an asset key points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    File(PathBuf),
    DataUrl {
        mime: String,
        base64: bool,
        payload: String,
    },
}

static DATA_URL: OnceLock<Regex> = OnceLock::new();

fn data_url_pattern() -> &'static Regex {
    DATA_URL.get_or_init(|| {
        Regex::new(r"(?s)^data:([A-Za-z0-9!#$&^_.+/-]*)((?:;[^,;]*)*?)(;base64)?,(.*)$")
            .expect("static data url pattern")
    })
}

impl AssetSource {
    pub fn parse(key: &str) -> Self {
        let trimmed = key.trim();
        if let Some(caps) = data_url_pattern().captures(trimmed) {
            let mime = caps
                .get(1)
                .map(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .unwrap_or("text/plain");
            return Self::DataUrl {
                mime: mime.to_string(),
                base64: caps.get(3).is_some(),
                payload: caps.get(4).map(|m| m.as_str()).unwrap_or("").to_string(),
            };
        }
        Self::File(PathBuf::from(trimmed))
    }
}

/// Decodes the body of a `data:` URL.
pub fn decode_data_url(key: &str) -> Result<(String, Vec<u8>), PipelineError> {
    match AssetSource::parse(key) {
        AssetSource::DataUrl {
            mime,
            base64,
            payload,
        } => {
            let bytes = if base64 {
                STANDARD
                    .decode(payload.trim())
                    .map_err(|err| PipelineError::asset_load("data url", err))?
            } else {
                payload.into_bytes()
            };
            Ok((mime, bytes))
        }
        AssetSource::File(_) => Err(PipelineError::asset_load(key, "not a data url")),
    }
}

/// Reads the raw bytes behind an asset key. Suspends on file I/O.
pub async fn read_source(key: &str) -> Result<Vec<u8>, PipelineError> {
    match AssetSource::parse(key) {
        AssetSource::File(path) => smol::fs::read(&path)
            .await
            .map_err(|err| PipelineError::asset_load(key, err)),
        AssetSource::DataUrl { .. } => {
            let owned = key.to_string();
            let (_, bytes) = smol::unblock(move || decode_data_url(&owned)).await?;
            Ok(bytes)
        }
    }
}

type Slot<V> = Arc<OnceCell<Arc<V>>>;

pub struct AssetCache<V> {
    entries: Mutex<HashMap<String, Slot<V>>>,
    loads: AtomicUsize,
}

impl<V> Default for AssetCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }
}

impl<V> AssetCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cached value or runs `load` once for all concurrent callers.
    ///
    /// A failed load leaves the key empty so a later request retries.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> Result<Arc<V>, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, PipelineError>>,
    {
        let slot = self
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let value = slot
            .get_or_try_init(|| async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                log::debug!("Asset cache miss: {}", short_key(key));
                load().await.map(Arc::new)
            })
            .await?;
        Ok(value.clone())
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.lock().get(key).and_then(|slot| slot.get().cloned())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many loader invocations have run since creation.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

fn short_key(key: &str) -> &str {
    if key.starts_with("data:") {
        "data:…"
    } else {
        key
    }
}

static BITMAP_CACHE: OnceLock<AssetCache<RgbaImage>> = OnceLock::new();

pub fn bitmap_cache() -> &'static AssetCache<RgbaImage> {
    BITMAP_CACHE.get_or_init(AssetCache::new)
}

/// Loads and decodes a raster asset through `cache`.
pub async fn load_bitmap(
    cache: &AssetCache<RgbaImage>,
    key: &str,
) -> Result<Arc<RgbaImage>, PipelineError> {
    cache
        .get_or_load(key, || async {
            let bytes = read_source(key).await?;
            let owned_key = key.to_string();
            smol::unblock(move || {
                image::load_from_memory(&bytes)
                    .map(|img| img.to_rgba8())
                    .map_err(|err| PipelineError::asset_load(short_key(&owned_key), err))
            })
            .await
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_and_data_sources() {
        assert_eq!(
            AssetSource::parse("/rooms/kitchen_base.png"),
            AssetSource::File(PathBuf::from("/rooms/kitchen_base.png"))
        );
        match AssetSource::parse("data:image/png;base64,AAAA") {
            AssetSource::DataUrl {
                mime,
                base64,
                payload,
            } => {
                assert_eq!(mime, "image/png");
                assert!(base64);
                assert_eq!(payload, "AAAA");
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn decodes_base64_and_plain_data_urls() {
        let (mime, bytes) = decode_data_url("data:text/plain;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(bytes, b"hello");

        let (_, plain) = decode_data_url("data:image/svg+xml,<svg/>").unwrap();
        assert_eq!(plain, b"<svg/>");
        assert!(decode_data_url("data:image/png;base64,@@@").is_err());
    }

    #[test]
    fn concurrent_loads_share_one_fetch() {
        let cache: AssetCache<String> = AssetCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let load = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            smol::future::yield_now().await;
            Ok("pattern".to_string())
        };

        let (a, b) = smol::block_on(smol::future::zip(
            cache.get_or_load("p.svg", load),
            cache.get_or_load("p.svg", load),
        ));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.load_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_load_is_retried_and_invalidate_forces_reload() {
        let cache: AssetCache<u32> = AssetCache::new();
        let failed = smol::block_on(
            cache.get_or_load("k", || async { Err(PipelineError::asset_load("k", "offline")) }),
        );
        assert!(failed.is_err());
        assert!(cache.get("k").is_none());

        let first = smol::block_on(cache.get_or_load("k", || async { Ok(1) })).unwrap();
        assert_eq!(*first, 1);
        let cached = smol::block_on(cache.get_or_load("k", || async { Ok(2) })).unwrap();
        assert_eq!(*cached, 1);

        assert!(cache.invalidate("k"));
        let reloaded = smol::block_on(cache.get_or_load("k", || async { Ok(3) })).unwrap();
        assert_eq!(*reloaded, 3);
    }

    #[test]
    fn decodes_png_data_url_bitmap() {
        let img = RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        let png = crate::export::encode_png(&img).unwrap();
        let url = crate::export::to_data_url(&png);

        let cache = AssetCache::new();
        let decoded = smol::block_on(load_bitmap(&cache, &url)).unwrap();
        assert_eq!(decoded.dimensions(), (2, 3));
        assert_eq!(decoded.get_pixel(1, 2).0, [10, 20, 30, 255]);
    }

    #[test]
    fn missing_file_is_an_asset_load_failure() {
        let cache = AssetCache::new();
        let err = smol::block_on(load_bitmap(&cache, "/definitely/not/here.png")).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::AssetLoad);
    }
}
