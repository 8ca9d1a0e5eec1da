//! Image transform request validation and an in-memory result cache
//! (spec §4.7.7). Pixel resizing/reencoding itself is delegated to an
//! upstream image-processing collaborator (out of scope — no codec crate is
//! part of the grounding corpus's dependency stack; see DESIGN.md); this
//! module owns the bounds checks and the cache that makes repeated
//! transform requests cheap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransformRequest {
    pub bucket: String,
    pub key: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub quality: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransformLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_total_pixels: u64,
}

impl TransformLimits {
    pub fn validate(&self, req: &TransformRequest, allowed_formats: &[String]) -> Result<()> {
        let width = req.width.unwrap_or(self.max_width);
        let height = req.height.unwrap_or(self.max_height);
        if width > self.max_width || height > self.max_height {
            return Err(Error::validation(format!("transform dimensions {width}x{height} exceed the configured maximum")));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.max_total_pixels {
            return Err(Error::validation(format!("transform would produce {pixels} pixels, exceeding the maximum")));
        }
        if let Some(format) = &req.format {
            if !allowed_formats.iter().any(|f| f.eq_ignore_ascii_case(format)) {
                return Err(Error::validation(format!("transform format '{format}' is not allowed")));
            }
        }
        Ok(())
    }
}

struct CacheEntry {
    bytes: Arc<Vec<u8>>,
    expires_at: Instant,
}

/// Bounded-size, TTL-expiring cache of transformed bytes. Eviction is
/// oldest-insertion-first once `max_entries` is reached — adequate for a
/// cache whose entries are cheap to regenerate, not a strict LRU.
#[derive(Clone)]
pub struct TransformCache {
    entries: Arc<Mutex<HashMap<TransformRequest, CacheEntry>>>,
    insertion_order: Arc<Mutex<Vec<TransformRequest>>>,
    max_entries: usize,
    ttl: Duration,
}

impl TransformCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            insertion_order: Arc::new(Mutex::new(Vec::new())),
            max_entries,
            ttl,
        }
    }

    pub fn get(&self, req: &TransformRequest) -> Option<Arc<Vec<u8>>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(req) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.bytes.clone()),
            Some(_) => {
                entries.remove(req);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, req: TransformRequest, bytes: Vec<u8>) {
        let mut entries = self.entries.lock().unwrap();
        let mut order = self.insertion_order.lock().unwrap();
        if entries.len() >= self.max_entries && !entries.contains_key(&req) {
            if let Some(oldest) = order.first().cloned() {
                entries.remove(&oldest);
                order.remove(0);
            }
        }
        entries.insert(req.clone(), CacheEntry { bytes: Arc::new(bytes), expires_at: Instant::now() + self.ttl });
        order.push(req);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
